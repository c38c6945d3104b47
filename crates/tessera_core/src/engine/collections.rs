//! Collection bookkeeping for save, reattach, evict and flush.

use crate::collection::{CollectionEntry, CollectionRef};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{EntityMetamodel, PropertyType};
use crate::session::Session;
use crate::types::Identifier;
use crate::value::Value;

fn collection_properties<'a>(
    values: &'a [Value],
    meta: &'a EntityMetamodel,
) -> impl Iterator<Item = (&'a str, &'a CollectionRef)> + 'a {
    meta.properties()
        .iter()
        .enumerate()
        .filter_map(move |(index, property)| match (property.ty(), values.get(index)) {
            (PropertyType::Collection { role }, Some(Value::Collection(c))) => Some((role.as_str(), c)),
            _ => None,
        })
}

/// Starts tracking one collection that the session does not know yet.
fn attach(session: &mut Session, collection: &CollectionRef, role: &str) -> CoreResult<()> {
    if session.persistence_context().get_collection_entry(collection).is_some() {
        return Ok(());
    }
    if let Some(owner) = collection.session_id() {
        if owner != session.id() {
            return Err(CoreError::invalid_operation(format!(
                "illegal attempt to associate collection {collection:?} with two open sessions"
            )));
        }
    }
    if collection.role().is_some() {
        session.context_mut().add_detached_collection(collection)
    } else {
        session.context_mut().add_new_collection(collection, role);
        Ok(())
    }
}

/// Tracks the collections of an instance being saved or reattached.
///
/// New collections are tracked for recreation; collections loaded by
/// another unit of work keep their loaded key, so a change of owner shows up
/// at the next flush.
pub(crate) fn attach_collections(
    session: &mut Session,
    values: &[Value],
    meta: &EntityMetamodel,
) -> CoreResult<()> {
    for (role, collection) in collection_properties(values, meta) {
        attach(session, collection, role)?;
    }
    Ok(())
}

/// Stops tracking the collections of an evicted instance.
pub(crate) fn evict_collections(session: &mut Session, values: &[Value], meta: &EntityMetamodel) {
    for (_, collection) in collection_properties(values, meta) {
        if session.context_mut().remove_collection(collection).is_some() {
            tracing::trace!(collection = ?collection, "evicting collection");
        }
    }
}

/// Processes the collections reachable from one flushed owner.
///
/// Returns true if a versionable collection of the owner is dirty.
pub(crate) fn flush_reachable_collections(
    session: &mut Session,
    values: &[Value],
    meta: &EntityMetamodel,
    owner_id: Option<&Identifier>,
) -> CoreResult<bool> {
    let mut has_dirty_versionable = false;
    for (role, collection) in collection_properties(values, meta) {
        if session.persistence_context().get_collection_entry(collection).is_none() {
            attach(session, collection, role)?;
            if let Some(entry) = session.context_mut().get_collection_entry_mut(collection) {
                entry.pre_flush(collection);
            }
        }
        let versionable = session.collection_persister(role)?.metadata().is_versionable();
        let entry = session
            .context_mut()
            .get_collection_entry_mut(collection)
            .ok_or_else(|| CoreError::assertion_failure(format!("collection {collection:?} is not tracked")))?;
        if entry.reached {
            return Err(CoreError::SharedCollection {
                role: role.to_string(),
            });
        }
        entry.reached = true;
        entry.current_role = Some(role.to_string());
        entry.current_key = owner_id.cloned();
        prepare_for_update(entry);
        tracing::trace!(
            collection = ?collection,
            update = entry.do_update,
            remove = entry.do_remove,
            recreate = entry.do_recreate,
            "collection found"
        );
        // a collection created in this unit of work is written by its recreate
        if entry.is_dirty() && versionable && entry.role().is_some() {
            has_dirty_versionable = true;
        }
    }
    Ok(has_dirty_versionable)
}

/// Marks every collection no live owner reached for removal.
pub(crate) fn flush_unreachable_collections(session: &mut Session) {
    for collection in session.persistence_context().collections_in_order() {
        if let Some(entry) = session.context_mut().get_collection_entry_mut(&collection) {
            if entry.reached || entry.processed {
                continue;
            }
            entry.current_role = None;
            entry.current_key = None;
            prepare_for_update(entry);
            if entry.do_remove {
                tracing::trace!(collection = ?collection, "collection dereferenced");
            }
        }
    }
}

fn prepare_for_update(entry: &mut CollectionEntry) {
    let loaded_role = entry.role().map(str::to_string);
    let loaded_key = entry.loaded_key().cloned();
    if loaded_role != entry.current_role || loaded_key != entry.current_key {
        if loaded_role.is_some() {
            entry.do_remove = true;
        }
        if entry.current_role.is_some() {
            entry.do_recreate = true;
        }
    } else if entry.is_dirty() {
        entry.do_update = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_change_removes_and_recreates() {
        let collection = CollectionRef::new(vec![Value::from(1)]);
        collection.attach("Order.tags", Some(Identifier::from(1)), crate::types::SessionId::next());
        let mut entry = CollectionEntry::detached(&collection);
        entry.current_role = Some("Order.tags".into());
        entry.current_key = Some(Identifier::from(2));
        prepare_for_update(&mut entry);
        assert!(entry.do_remove && entry.do_recreate && !entry.do_update);
    }

    #[test]
    fn new_collection_is_recreated() {
        let mut entry = CollectionEntry::new_collection("Order.tags");
        entry.current_key = Some(Identifier::from(5));
        prepare_for_update(&mut entry);
        assert!(entry.do_recreate && !entry.do_remove);
    }

    #[test]
    fn unchanged_dirty_collection_is_updated() {
        let collection = CollectionRef::new(vec![]);
        collection.attach("Order.tags", Some(Identifier::from(1)), crate::types::SessionId::next());
        collection.push(3).unwrap();
        let mut entry = CollectionEntry::detached(&collection);
        entry.pre_flush(&collection);
        entry.current_role = Some("Order.tags".into());
        entry.current_key = Some(Identifier::from(1));
        prepare_for_update(&mut entry);
        assert!(entry.do_update && !entry.do_remove && !entry.do_recreate);
    }
}
