//! References to unsaved instances.
//!
//! An insert may only write a foreign key once the referenced row exists.
//! Nullable references to instances that cannot be written yet are written
//! as null (the instance keeps the reference, so the next flush updates the
//! key); non-nullable ones make the insert wait.

use super::transient;
use crate::entity::EntityHandle;
use crate::error::CoreResult;
use crate::metadata::{EntityMetamodel, PropertyType};
use crate::session::Session;
use crate::value::Value;

/// A non-nullable reference from a pending insert to an unsaved instance.
#[derive(Debug, Clone)]
pub struct TransientDependency {
    /// Property holding the reference.
    pub property: String,
    /// The referenced instance.
    pub entity: EntityHandle,
}

/// Returns true if a reference to `handle` must not be written yet.
pub(crate) fn is_nullifiable(
    session: &mut Session,
    handle: &EntityHandle,
    early_insert: bool,
) -> CoreResult<bool> {
    // an uninitialized placeholder always stands for an existing row
    let Some(entity) = handle.peek_implementation() else {
        return Ok(false);
    };
    let context = session.persistence_context();
    match context.get_entry(&entity) {
        Some(entry) => Ok(entry.is_nullifiable(early_insert, context.nullifiable_keys())),
        None => transient::is_transient(session, &entity, None),
    }
}

/// Replaces references that must not be written yet with null.
pub(crate) fn nullify_transient_references(
    session: &mut Session,
    values: &mut [Value],
    meta: &EntityMetamodel,
    early_insert: bool,
) -> CoreResult<()> {
    for (index, property) in meta.properties().iter().enumerate() {
        if !matches!(property.ty(), PropertyType::ManyToOne { .. }) {
            continue;
        }
        let handle = match values.get(index) {
            Some(Value::Entity(handle)) => handle.clone(),
            _ => continue,
        };
        if is_nullifiable(session, &handle, early_insert)? {
            tracing::trace!(
                entity = meta.name(),
                property = property.name(),
                target = ?handle,
                "nullifying reference to unsaved instance"
            );
            values[index] = Value::Null;
        }
    }
    Ok(())
}

/// Replaces references to instances deleted in this unit of work with null.
///
/// Used on the flush-time state of tracked instances, so a key nulled at
/// insert is not seen as dirty and a key to a deleted row is never written.
pub(crate) fn nullify_deleted_references(
    session: &Session,
    values: &mut [Value],
    meta: &EntityMetamodel,
) {
    let context = session.persistence_context();
    for (index, property) in meta.properties().iter().enumerate() {
        if !matches!(property.ty(), PropertyType::ManyToOne { .. }) {
            continue;
        }
        let Some(Value::Entity(handle)) = values.get(index) else {
            continue;
        };
        let Some(entity) = handle.peek_implementation() else {
            continue;
        };
        let deleted = context
            .get_entry(&entity)
            .is_some_and(|entry| entry.is_nullifiable(false, context.nullifiable_keys()));
        if deleted {
            values[index] = Value::Null;
        }
    }
}

/// Collects the non-nullable references that block an insert.
pub(crate) fn find_non_nullable_transient_entities(
    session: &mut Session,
    values: &[Value],
    meta: &EntityMetamodel,
    early_insert: bool,
) -> CoreResult<Vec<TransientDependency>> {
    let mut dependencies = Vec::new();
    for (index, property) in meta.properties().iter().enumerate() {
        if property.is_nullable() || !matches!(property.ty(), PropertyType::ManyToOne { .. }) {
            continue;
        }
        if let Some(Value::Entity(handle)) = values.get(index) {
            if is_nullifiable(session, handle, early_insert)? {
                dependencies.push(TransientDependency {
                    property: property.name().to_string(),
                    entity: handle.clone(),
                });
            }
        }
    }
    Ok(dependencies)
}
