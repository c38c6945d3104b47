//! Lock requests and lock upgrades.

use super::save::reassociate;
use super::{deleted_instance, LockEvent, LockEventListener, OperationContext};
use crate::action::BeforeCompletion;
use crate::cache::{coordinator, CacheKey};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::engine::transient;
use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, LockOptions};
use crate::session::Session;
use std::sync::Arc;

/// Default handler of lock requests.
///
/// A detached instance is reassociated first, assuming it was not modified
/// since it was read.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLockEventListener;

impl LockEventListener for DefaultLockEventListener {
    fn on_lock(
        &self,
        session: &mut Session,
        event: &mut LockEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let mode = event.lock_options.lock_mode();
        if mode == LockMode::Write {
            return Err(CoreError::InvalidLockMode {
                mode: mode.to_string(),
                operation: "lock",
            });
        }
        let entity = event.entity.clone();
        let persister = session.entity_persister(entity.entity_name())?;
        if !session.persistence_context().contains(&entity) {
            if transient::is_transient(session, &entity, Some(false))? {
                return Err(CoreError::transient_object(format!(
                    "cannot lock an unsaved instance {entity:?}"
                )));
            }
            reassociate(session, &entity, &persister, true)?;
        }
        upgrade_lock(session, &entity, &event.lock_options)?;
        Cascade::new(CascadingAction::Lock, CascadePoint::AfterLock).cascade(session, &persister, &entity, ctx)
    }
}

/// Raises the lock held on a tracked instance to the requested mode.
///
/// Optimistic modes are deferred to transaction completion; pessimistic
/// modes go to the store at once, with the cache entry soft-locked.
/// Requests not stronger than the held lock do nothing.
pub(crate) fn upgrade_lock(session: &mut Session, entity: &EntityRef, lock_options: &LockOptions) -> CoreResult<()> {
    let requested = lock_options.lock_mode();
    let (persister, id, version, held) = {
        let entry = session.persistence_context().get_entry(entity).ok_or_else(|| {
            CoreError::transient_object(format!("instance {entity:?} is not associated with the session"))
        })?;
        if !requested.greater_than(entry.lock_mode()) {
            return Ok(());
        }
        if entry.status().is_deleted_or_gone() {
            return Err(deleted_instance(session, entity, "lock"));
        }
        let id = entry
            .id()
            .cloned()
            .ok_or_else(|| CoreError::assertion_failure(format!("locking {entity:?} without identifier")))?;
        (Arc::clone(entry.persister()), id, entry.version(), entry.lock_mode())
    };
    let meta = persister.metamodel();
    tracing::trace!(entity = ?entity, from = %held, to = %requested, "upgrading lock");

    if requested.is_optimistic() {
        if !meta.is_versioned() {
            return Err(CoreError::InvalidLockMode {
                mode: requested.to_string(),
                operation: "lock of an unversioned entity",
            });
        }
        let process = if requested == LockMode::Optimistic {
            BeforeCompletion::VerifyVersion(entity.clone())
        } else {
            BeforeCompletion::IncrementVersion(entity.clone())
        };
        session.action_queue_mut().register_before_completion(process);
    } else {
        session.check_cancelled()?;
        let region = session.entity_region(persister.as_ref());
        let cache_key = CacheKey::new(meta.name(), id.clone());
        let result = coordinator::with_soft_lock(region.as_ref(), &cache_key, version, || {
            if requested.forces_increment() && meta.is_versioned() {
                let current = version.ok_or_else(|| {
                    CoreError::assertion_failure(format!("versioned {entity:?} has no version"))
                })?;
                persister.force_version_increment(&id, current).map(Some)
            } else {
                persister.lock(&id, version, lock_options).map(|()| None)
            }
        });
        let next = match result {
            Ok(next) => next,
            Err(err) => {
                if err.is_optimistic_failure() {
                    session.statistics().record_optimistic_failure();
                }
                return Err(err);
            }
        };
        if let (Some(next), Some(entry)) = (next, session.context_mut().get_entry_mut(entity)) {
            entry.force_locked(entity, next);
        }
    }
    if let Some(entry) = session.context_mut().get_entry_mut(entity) {
        entry.set_lock_mode(requested);
    }
    Ok(())
}
