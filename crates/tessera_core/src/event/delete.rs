//! Delete.

use super::save::reassociate;
use super::{entity_state, DeleteEvent, DeleteEventListener, EntityState, OperationContext};
use crate::action::{Action, EntityDeleteAction};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::engine::foreign_keys;
use crate::entity::{EntityHandle, EntityRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::value::Snapshot;
use std::sync::Arc;

/// Default handler of delete.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDeleteEventListener;

impl DeleteEventListener for DefaultDeleteEventListener {
    fn on_delete(
        &self,
        session: &mut Session,
        event: &mut DeleteEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let entity = match &event.entity {
            EntityHandle::Entity(entity) => entity.clone(),
            EntityHandle::Proxy(proxy) => match proxy.target() {
                Some(target) => target,
                None => session.initialize_proxy(proxy)?,
            },
        };
        let persister = session.entity_persister(entity.entity_name())?;
        let status = session.persistence_context().get_entry(&entity).map(|e| e.status());
        match status {
            Some(status) if status.is_deleted_or_gone() => {
                tracing::trace!(entity = ?entity, "instance already deleted");
                Ok(())
            }
            Some(_) => delete_entity(session, &entity, &persister, event.orphan_removal, ctx),
            None => match entity_state(session, &entity, None)? {
                EntityState::Transient => {
                    tracing::trace!(entity = ?entity, "deleting transient instance: cascading only");
                    Cascade::new(CascadingAction::Delete, CascadePoint::AfterInsertBeforeDelete)
                        .cascade(session, &persister, &entity, ctx)?;
                    Cascade::new(CascadingAction::Delete, CascadePoint::BeforeInsertAfterDelete)
                        .cascade(session, &persister, &entity, ctx)
                }
                _ => {
                    tracing::trace!(entity = ?entity, "deleting detached instance");
                    reassociate(session, &entity, &persister, true)?;
                    delete_entity(session, &entity, &persister, event.orphan_removal, ctx)
                }
            },
        }
    }
}

fn delete_entity(
    session: &mut Session,
    entity: &EntityRef,
    persister: &Arc<dyn EntityPersister>,
    orphan_removal: bool,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    let meta = persister.metamodel();
    let (id, key, version, state) = {
        let entry = session
            .persistence_context()
            .get_entry(entity)
            .ok_or_else(|| CoreError::assertion_failure(format!("deleting untracked instance {entity:?}")))?;
        if entry.status() == Status::Saving {
            return Err(CoreError::invalid_operation(format!(
                "{entity:?} is still being saved and cannot be deleted"
            )));
        }
        let id = entry
            .id()
            .cloned()
            .ok_or_else(|| CoreError::assertion_failure(format!("deleting {entity:?} without identifier")))?;
        let state = match entry.loaded_state() {
            Some(loaded) => loaded.values().to_vec(),
            None => entity.values(),
        };
        (id, entry.entity_key(), entry.version(), state)
    };
    tracing::debug!(entity = ?entity, orphan_removal, "deleting");

    session.interceptor().on_delete(entity, &id, &state, meta)?;
    if let Some(entry) = session.context_mut().get_entry_mut(entity) {
        entry.set_status(Status::Deleted)?;
        entry.set_deleted_state(Some(Snapshot::capture(&state)));
    }

    // collections and their orphans go first
    Cascade::new(CascadingAction::Delete, CascadePoint::AfterInsertBeforeDelete)
        .cascade(session, persister, entity, ctx)?;

    let mut deleted_state = state;
    foreign_keys::nullify_transient_references(session, &mut deleted_state, meta, false)?;
    if let Some(key) = key {
        session.context_mut().register_nullifiable(key);
    }
    if let Some(entry) = session.context_mut().get_entry_mut(entity) {
        entry.set_deleted_state(Some(Snapshot::capture(&deleted_state)));
    }
    session.action_queue_mut().add_action(Action::Delete(EntityDeleteAction::new(
        entity.clone(),
        id,
        version,
        deleted_state,
        orphan_removal,
        Arc::clone(persister),
    )));

    Cascade::new(CascadingAction::Delete, CascadePoint::BeforeInsertAfterDelete)
        .cascade(session, persister, entity, ctx)
}
