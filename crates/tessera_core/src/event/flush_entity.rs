//! Dirty checking of one tracked instance.

use super::{FlushEntityEvent, FlushEntityEventListener};
use crate::action::{Action, EntityUpdateAction};
use crate::engine::{collections, foreign_keys, nullability};
use crate::entity::{EntityRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::metadata::EntityMetamodel;
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::types::{Identifier, Version};
use crate::value::{Snapshot, Value};
use crate::versioning;
use std::sync::Arc;

/// What the flush needs to know about an entry, read up front.
struct EntrySnapshot {
    status: Status,
    id: Identifier,
    loaded: Option<Vec<Value>>,
    deleted: Option<Vec<Value>>,
    version: Option<Version>,
    modifiable: bool,
    requires_dirty_check: bool,
    increment_disabled: bool,
    persister: Arc<dyn EntityPersister>,
}

fn read_entry(session: &Session, entity: &EntityRef) -> CoreResult<Option<EntrySnapshot>> {
    let Some(entry) = session.persistence_context().get_entry(entity) else {
        return Ok(None);
    };
    let id = entry
        .id()
        .cloned()
        .ok_or_else(|| CoreError::assertion_failure(format!("flushing {entity:?} without identifier")))?;
    Ok(Some(EntrySnapshot {
        status: entry.status(),
        id,
        loaded: entry.loaded_state().map(|s| s.values().to_vec()),
        deleted: entry.deleted_state().map(|s| s.values().to_vec()),
        version: entry.version(),
        modifiable: entry.is_modifiable(),
        requires_dirty_check: entry.requires_dirty_check(entity),
        increment_disabled: entry.is_version_increment_disabled(),
        persister: Arc::clone(entry.persister()),
    }))
}

/// Default per-instance flush.
///
/// Compares the current state against the loaded state (or asks the
/// interceptor, or reads the row when no loaded state is kept and the entity
/// selects before update), processes reachable collections, and queues an
/// update with the next version when something changed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFlushEntityEventListener;

impl FlushEntityEventListener for DefaultFlushEntityEventListener {
    fn on_flush_entity(&self, session: &mut Session, event: &mut FlushEntityEvent) -> CoreResult<()> {
        let entity = event.entity.clone();
        let Some(entry) = read_entry(session, &entity)? else {
            return Ok(());
        };
        if matches!(entry.status, Status::Gone | Status::Saving) {
            return Ok(());
        }
        let persister = Arc::clone(&entry.persister);
        let meta = persister.metamodel();

        let might_be_dirty = entry.requires_dirty_check;
        event.property_values = if entry.status == Status::Deleted {
            entry.deleted.clone().unwrap_or_else(|| entity.values())
        } else if !might_be_dirty && entry.loaded.is_some() {
            entry.loaded.clone().unwrap_or_default()
        } else {
            check_id(&entity, &entry.id)?;
            entity.values()
        };

        if entry.status != Status::Deleted {
            if might_be_dirty {
                foreign_keys::nullify_deleted_references(session, &mut event.property_values, meta);
                check_natural_id(meta, &event.property_values, entry.loaded.as_deref())?;
            }
            let dirty_collection =
                collections::flush_reachable_collections(session, &event.property_values, meta, Some(&entry.id))?;
            event.has_dirty_collection = dirty_collection
                && meta.is_versioned()
                && entry.modifiable
                && matches!(entry.status, Status::Managed | Status::ReadOnly);
        }

        let update_needed = if might_be_dirty || entry.status == Status::Deleted {
            dirty_check(session, event, &entry, &persister)?;
            is_update_necessary(event)
        } else {
            event.has_dirty_collection
        };
        if update_needed {
            schedule_update(session, event, &entry, &persister)?;
        }
        Ok(())
    }
}

fn check_id(entity: &EntityRef, id: &Identifier) -> CoreResult<()> {
    match entity.identifier() {
        Some(current) if current != *id => Err(CoreError::invalid_operation(format!(
            "identifier of an instance of {} was altered from {id} to {current}",
            entity.entity_name()
        ))),
        _ => Ok(()),
    }
}

fn check_natural_id(meta: &EntityMetamodel, current: &[Value], loaded: Option<&[Value]>) -> CoreResult<()> {
    let Some(loaded) = loaded else {
        return Ok(());
    };
    for index in meta.natural_id_indices() {
        let property = &meta.properties()[index];
        if property.is_updatable() {
            continue;
        }
        let (Some(before), Some(after)) = (loaded.get(index), current.get(index)) else {
            continue;
        };
        if property.ty().is_dirty(before, after) {
            return Err(CoreError::NaturalIdModified {
                entity_name: meta.name().to_string(),
                property: property.name().to_string(),
            });
        }
    }
    Ok(())
}

fn dirty_check(
    session: &mut Session,
    event: &mut FlushEntityEvent,
    entry: &EntrySnapshot,
    persister: &Arc<dyn EntityPersister>,
) -> CoreResult<()> {
    let meta = persister.metamodel();
    let previous = entry.loaded.as_deref();
    let interceptor = session.interceptor();
    if let Some(dirty) = interceptor.find_dirty(&event.entity, &entry.id, &event.property_values, previous, meta) {
        event.dirty_properties = Some(dirty);
        event.dirty_check_handled_by_interceptor = true;
        return Ok(());
    }
    match previous {
        Some(loaded) => {
            event.dirty_properties = Some(meta.find_dirty(&event.property_values, loaded));
        }
        None if meta.is_select_before_update() => {
            let snapshot = session
                .context_mut()
                .get_database_snapshot(persister.as_ref(), &entry.id)?;
            let Some(row) = snapshot else {
                session.statistics().record_optimistic_failure();
                return Err(CoreError::stale_state(meta.name(), entry.id.clone()));
            };
            event.dirty_properties = Some(meta.find_modified(&row, &event.property_values));
            event.database_snapshot = Some(row);
        }
        None => {
            event.dirty_check_possible = false;
            event.dirty_properties = None;
        }
    }
    Ok(())
}

fn is_update_necessary(event: &FlushEntityEvent) -> bool {
    !event.dirty_check_possible
        || event.has_dirty_collection
        || event.dirty_properties.as_ref().map_or(false, |dirty| !dirty.is_empty())
}

fn schedule_update(
    session: &mut Session,
    event: &mut FlushEntityEvent,
    entry: &EntrySnapshot,
    persister: &Arc<dyn EntityPersister>,
) -> CoreResult<()> {
    let meta = persister.metamodel();
    let entity = event.entity.clone();
    let mut values = event.property_values.clone();

    if entry.status != Status::Deleted {
        if !entry.modifiable {
            tracing::trace!(entity = ?entity, "skipping update of read-only instance");
            return Ok(());
        }
        let interceptor = session.interceptor();
        if interceptor.on_flush_dirty(&entity, &entry.id, &mut values, entry.loaded.as_deref(), meta)? {
            entity.replace_values(values.clone());
            if !event.dirty_check_handled_by_interceptor {
                if let Some(loaded) = &entry.loaded {
                    event.dirty_properties = Some(meta.find_dirty(&values, loaded));
                }
            }
        }
        if session.settings().check_nullability {
            nullability::check_nullability(&values, meta, true)?;
        }
    }

    let next_version = next_version(&mut values, event, entry, meta);
    if let Some(next) = next_version.filter(|next| Some(*next) != entry.version) {
        tracing::trace!(entity = ?entity, from = ?entry.version, to = ?next, "incrementing version");
    }
    tracing::debug!(
        entity = ?entity,
        dirty = ?event.dirty_properties,
        status = %entry.status,
        "scheduling update"
    );
    session.action_queue_mut().add_action(Action::Update(EntityUpdateAction::new(
        entity,
        entry.id.clone(),
        values,
        event.dirty_properties.clone(),
        event.has_dirty_collection,
        entry.loaded.as_deref().map(Snapshot::capture),
        entry.version,
        next_version,
        Arc::clone(persister),
    )));
    Ok(())
}

/// Bumps the version in `values` when the changes require it.
fn next_version(
    values: &mut [Value],
    event: &FlushEntityEvent,
    entry: &EntrySnapshot,
    meta: &EntityMetamodel,
) -> Option<Version> {
    let version_metadata = meta.version_metadata()?;
    if entry.status == Status::Deleted || entry.increment_disabled {
        return entry.version;
    }
    let required = match &event.dirty_properties {
        Some(dirty) => versioning::is_version_increment_required(dirty, event.has_dirty_collection, meta),
        None => true,
    };
    if !required {
        return entry.version;
    }
    let current = entry.version?;
    let next = versioning::increment(&current, version_metadata.ty);
    versioning::set_version(values, next, meta);
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;

    fn account() -> EntityMetamodel {
        EntityMetamodel::new("Account")
            .property(PropertyMetadata::basic("iban").natural_id().immutable())
            .property(PropertyMetadata::basic("owner"))
    }

    #[test]
    fn immutable_natural_id_change_is_rejected() {
        let meta = account();
        let loaded = vec![Value::from("DE01"), Value::from("ann")];
        let current = vec![Value::from("DE02"), Value::from("ann")];
        let err = check_natural_id(&meta, &current, Some(&loaded)).unwrap_err();
        assert!(matches!(err, CoreError::NaturalIdModified { ref property, .. } if property == "iban"));
    }

    #[test]
    fn other_changes_pass_natural_id_check() {
        let meta = account();
        let loaded = vec![Value::from("DE01"), Value::from("ann")];
        let current = vec![Value::from("DE01"), Value::from("bob")];
        assert!(check_natural_id(&meta, &current, Some(&loaded)).is_ok());
    }

    #[test]
    fn altered_identifier_is_rejected() {
        let entity = EntityRef::with_identifier("Account", Identifier::from(2), vec![]);
        assert!(check_id(&entity, &Identifier::from(1)).is_err());
        assert!(check_id(&entity, &Identifier::from(2)).is_ok());
    }

    #[test]
    fn update_needed_without_loaded_state() {
        let mut event = FlushEntityEvent::new(EntityRef::new("Account", vec![]));
        event.dirty_check_possible = false;
        assert!(is_update_necessary(&event));
        event.dirty_check_possible = true;
        event.dirty_properties = Some(vec![]);
        assert!(!is_update_necessary(&event));
    }
}
