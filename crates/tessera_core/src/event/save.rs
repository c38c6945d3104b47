//! Save, update and save-or-update.

use super::{
    deleted_instance, entity_state, EntityState, OperationContext, SaveKind, SaveOrUpdateEvent,
    SaveOrUpdateEventListener,
};
use crate::action::{Action, ActionQueue, EntityIdentityInsertAction, EntityInsertAction};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::engine::collections;
use crate::entity::{EntityRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::metadata::IdStrategy;
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::types::{EntityKey, Identifier};
use crate::value::Snapshot;
use crate::versioning;
use std::sync::Arc;

/// Default handler of save, update and save-or-update.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSaveOrUpdateEventListener;

impl SaveOrUpdateEventListener for DefaultSaveOrUpdateEventListener {
    fn on_save_or_update(
        &self,
        session: &mut Session,
        event: &mut SaveOrUpdateEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let entity = event.entity.clone();
        let assumed = match event.kind {
            SaveKind::Save => Some(true),
            SaveKind::Update => Some(false),
            SaveKind::SaveOrUpdate => None,
        };
        match entity_state(session, &entity, assumed)? {
            EntityState::Persistent => {
                tracing::trace!(entity = ?entity, "ignoring persistent instance");
                let entry_id = session
                    .persistence_context()
                    .get_entry(&entity)
                    .and_then(|entry| entry.id().cloned());
                if let (Some(requested), Some(current)) = (&event.requested_id, &entry_id) {
                    if requested != current {
                        return Err(CoreError::persistent_object(entity.entity_name(), "save"));
                    }
                }
                event.result_id = entry_id;
                Ok(())
            }
            EntityState::Deleted => Err(deleted_instance(session, &entity, event.kind.name())),
            EntityState::Transient => {
                if event.kind == SaveKind::Update {
                    if session.settings().lenient_update {
                        tracing::debug!(entity = ?entity, "update of transient instance ignored");
                        return Ok(());
                    }
                    return Err(CoreError::transient_object(format!(
                        "update of unsaved instance {entity:?}"
                    )));
                }
                event.result_id = save_transient(
                    session,
                    &entity,
                    event.requested_id.clone(),
                    Some(CascadingAction::SaveUpdate),
                    ctx,
                )?;
                Ok(())
            }
            EntityState::Detached => {
                if event.kind == SaveKind::Save && session.settings().strict_detached_save {
                    return Err(CoreError::persistent_object(entity.entity_name(), "save"));
                }
                let persister = session.entity_persister(entity.entity_name())?;
                reassociate(session, &entity, &persister, false)?;
                Cascade::new(CascadingAction::SaveUpdate, CascadePoint::AfterUpdate)
                    .cascade(session, &persister, &entity, ctx)?;
                event.result_id = entity.identifier();
                Ok(())
            }
        }
    }
}

fn generate_id(entity: &EntityRef, persister: &Arc<dyn EntityPersister>) -> CoreResult<Option<Identifier>> {
    let meta = persister.metamodel();
    match meta.identifier_strategy() {
        IdStrategy::Assigned => entity.identifier().map(Some).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "ids for {} must be assigned before saving",
                meta.name()
            ))
        }),
        IdStrategy::Sequence => persister.next_identifier().map(Some),
        IdStrategy::Uuid => Ok(Some(Identifier::new_uuid())),
        IdStrategy::Identity => Ok(None),
    }
}

/// Makes a transient instance persistent.
///
/// With `cascade` set, the action is cascaded to references before the
/// insert is queued and to collections after. Returns the identifier, which
/// for store-generated strategies is only known once the insert ran.
pub(crate) fn save_transient(
    session: &mut Session,
    entity: &EntityRef,
    requested_id: Option<Identifier>,
    cascade: Option<CascadingAction>,
    ctx: &mut OperationContext,
) -> CoreResult<Option<Identifier>> {
    let persister = session.entity_persister(entity.entity_name())?;
    session.check_cancelled()?;
    let id = match requested_id {
        Some(id) => Some(id),
        None => generate_id(entity, &persister)?,
    };
    perform_save(session, entity, id, &persister, cascade, ctx)
}

fn perform_save(
    session: &mut Session,
    entity: &EntityRef,
    id: Option<Identifier>,
    persister: &Arc<dyn EntityPersister>,
    cascade: Option<CascadingAction>,
    ctx: &mut OperationContext,
) -> CoreResult<Option<Identifier>> {
    let meta = persister.metamodel();
    entity.ensure_width(meta.property_count());
    let key = match &id {
        Some(id) => {
            let key = EntityKey::new(id.clone(), meta.name()).with_mode(meta.entity_mode());
            session.persistence_context().check_uniqueness(&key, entity)?;
            entity.set_identifier(Some(id.clone()));
            Some(key)
        }
        None => None,
    };
    tracing::trace!(entity = ?entity, "saving transient instance");

    // placeholder entry, so that cascades see the instance as being saved
    session.context_mut().add_entity(
        entity,
        Status::Saving,
        None,
        key,
        None,
        LockMode::Write,
        false,
        Arc::clone(persister),
        false,
        false,
    )?;

    if let Some(action) = cascade {
        Cascade::new(action, CascadePoint::BeforeInsertAfterDelete).cascade(session, persister, entity, ctx)?;
    }

    let mut values = entity.values();
    let interceptor = session.interceptor();
    let mut substitute = interceptor.on_save(entity, id.as_ref(), &mut values, meta)?;
    substitute |= versioning::seed_version(&mut values, meta);
    if substitute {
        entity.replace_values(values.clone());
    }
    collections::attach_collections(session, &values, meta)?;

    let version = versioning::get_version(&values, meta);
    let action = match id {
        Some(id) => Action::Insert(EntityInsertAction::new(
            entity.clone(),
            id,
            values,
            version,
            Arc::clone(persister),
        )),
        None => Action::IdentityInsert(EntityIdentityInsertAction::new(
            entity.clone(),
            values,
            Arc::clone(persister),
        )),
    };
    ActionQueue::add_insert_action(session, action)?;

    if let Some(action) = cascade {
        Cascade::new(action, CascadePoint::AfterInsertBeforeDelete).cascade(session, persister, entity, ctx)?;
    }
    Ok(entity.identifier())
}

/// Starts tracking a detached instance.
///
/// With `assume_unmodified`, the current state becomes the loaded state, so
/// the next flush writes only what changes from here on. Otherwise no loaded
/// state is kept and the next flush updates the row.
pub(crate) fn reassociate(
    session: &mut Session,
    entity: &EntityRef,
    persister: &Arc<dyn EntityPersister>,
    assume_unmodified: bool,
) -> CoreResult<()> {
    let meta = persister.metamodel();
    let id = entity.identifier().ok_or_else(|| {
        CoreError::transient_object(format!("detached instance {entity:?} has no identifier"))
    })?;
    entity.ensure_width(meta.property_count());
    let key = EntityKey::new(id, meta.name()).with_mode(meta.entity_mode());
    tracing::trace!(entity = %key, "reassociating detached instance");
    let values = entity.values();
    let version = versioning::get_version(&values, meta);
    let status = if meta.is_mutable() {
        Status::Managed
    } else {
        Status::ReadOnly
    };
    let loaded = (assume_unmodified && meta.is_mutable()).then(|| Snapshot::capture(&values));
    session.context_mut().add_entity(
        entity,
        status,
        loaded,
        Some(key.clone()),
        version,
        LockMode::None,
        true,
        Arc::clone(persister),
        false,
        false,
    )?;
    entity.clear_written();
    session.context_mut().proxy_for(&key, entity);
    collections::attach_collections(session, &values, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetamodel, PropertyMetadata};
    use crate::test_support::entity_persister;

    #[test]
    fn assigned_ids_are_required() {
        let persister = entity_persister(
            EntityMetamodel::new("Code")
                .property(PropertyMetadata::basic("label"))
                .id_strategy(IdStrategy::Assigned),
        );
        let entity = EntityRef::new("Code", vec![]);
        assert!(matches!(
            generate_id(&entity, &persister),
            Err(CoreError::InvalidOperation { .. })
        ));
        entity.set_identifier(Some(Identifier::from("EUR")));
        assert_eq!(generate_id(&entity, &persister).unwrap(), Some(Identifier::from("EUR")));
    }

    #[test]
    fn identity_ids_come_from_the_insert() {
        let persister = entity_persister(
            EntityMetamodel::new("Log")
                .property(PropertyMetadata::basic("line"))
                .id_strategy(IdStrategy::Identity),
        );
        let entity = EntityRef::new("Log", vec![]);
        assert_eq!(generate_id(&entity, &persister).unwrap(), None);
    }

    #[test]
    fn uuid_ids_are_generated() {
        let persister = entity_persister(
            EntityMetamodel::new("Token")
                .property(PropertyMetadata::basic("value"))
                .id_strategy(IdStrategy::Uuid),
        );
        let entity = EntityRef::new("Token", vec![]);
        assert!(matches!(
            generate_id(&entity, &persister).unwrap(),
            Some(Identifier::Uuid(_))
        ));
    }
}
