//! Refresh: re-read an instance from the store into the same object.

use super::load::assemble_row;
use super::{deleted_instance, OperationContext, RefreshEvent, RefreshEventListener};
use crate::cache::{coordinator, CacheKey};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::engine::{collections, transient};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::session::Session;
use crate::types::EntityKey;

/// Default handler of refresh.
///
/// Refresh cascades first, then evicts the instance and its cached state,
/// then reloads the row into the same object. Read-only instances stay
/// read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRefreshEventListener;

impl RefreshEventListener for DefaultRefreshEventListener {
    fn on_refresh(
        &self,
        session: &mut Session,
        event: &mut RefreshEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let entity = event.entity.clone();
        let persister = session.entity_persister(entity.entity_name())?;
        let meta = persister.metamodel();
        let (id, read_only) = match session.persistence_context().get_entry(&entity) {
            Some(entry) => {
                if entry.status().is_deleted_or_gone() {
                    return Err(deleted_instance(session, &entity, "refresh"));
                }
                if !entry.exists_in_database() {
                    return Err(CoreError::invalid_operation(format!(
                        "{entity:?} does not yet exist as a row in the store"
                    )));
                }
                let id = entry.id().cloned().ok_or_else(|| {
                    CoreError::assertion_failure(format!("refreshing {entity:?} without identifier"))
                })?;
                (id, Some(entry.is_read_only()))
            }
            None => {
                if transient::is_transient(session, &entity, Some(false))? {
                    return Err(CoreError::transient_object(format!(
                        "cannot refresh an unsaved instance {entity:?}"
                    )));
                }
                let id = entity.identifier().ok_or_else(|| {
                    CoreError::transient_object(format!("cannot refresh {entity:?} without identifier"))
                })?;
                (id, None)
            }
        };
        let key = EntityKey::new(id.clone(), meta.name()).with_mode(meta.entity_mode());
        tracing::trace!(entity = %key, "refreshing");

        Cascade::new(CascadingAction::Refresh, CascadePoint::BeforeRefresh)
            .cascade(session, &persister, &entity, ctx)?;

        if session.persistence_context().contains(&entity) {
            session.context_mut().remove_entity(&key);
            collections::evict_collections(session, &entity.values(), meta);
        }
        let region = session.entity_region(persister.as_ref());
        let owned = session.owned_collection_persisters(meta)?;
        let cache_key = CacheKey::new(meta.name(), id.clone());
        let loaded = coordinator::with_soft_lock(region.as_ref(), &cache_key, None, || {
            coordinator::evict_entity_and_collections(region.as_ref(), &cache_key, &owned)?;
            session.check_cancelled()?;
            persister.load(&id, &event.lock_options)
        })?;
        let row = loaded.ok_or_else(|| CoreError::not_found(meta.name(), id.clone()))?;
        session.statistics().record_entity_fetch();
        let requested = event.lock_options.lock_mode();
        let lock_mode = if requested.greater_than(LockMode::Read) {
            requested
        } else {
            LockMode::Read
        };
        assemble_row(session, &persister, &key, &row, lock_mode, Some(entity), read_only, true)?;
        Ok(())
    }
}
