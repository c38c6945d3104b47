//! Conversion between live property values and stored rows.

use crate::collection::CollectionRef;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{EntityMetamodel, PropertyMetadata, PropertyType};
use crate::persister::ElementType;
use crate::session::Session;
use crate::types::{CollectionKey, Identifier};
use crate::value::{Row, StoredValue, Value};

/// Turns property values into a row: references become identifiers and
/// collections a marker.
///
/// # Errors
///
/// Returns [`CoreError::TransientObject`] for a reference to an instance
/// without identifier.
pub(crate) fn dehydrate(values: &[Value], meta: &EntityMetamodel) -> CoreResult<Row> {
    meta.properties()
        .iter()
        .enumerate()
        .map(|(index, property)| {
            let value = values.get(index).unwrap_or(&Value::Null);
            dehydrate_property(value, property, meta.name())
        })
        .collect()
}

fn dehydrate_property(value: &Value, property: &PropertyMetadata, owner: &str) -> CoreResult<StoredValue> {
    match (property.ty(), value) {
        (_, Value::Null) => Ok(StoredValue::Null),
        (_, Value::Unfetched) => Ok(StoredValue::Unfetched),
        (PropertyType::Collection { .. }, Value::Collection(_)) => Ok(StoredValue::Collection),
        (PropertyType::ManyToOne { .. }, Value::Entity(handle)) => handle
            .identifier()
            .map(StoredValue::Reference)
            .ok_or_else(|| {
                CoreError::transient_object(format!(
                    "object references an unsaved transient instance: {owner}.{} -> {}",
                    property.name(),
                    handle.entity_name()
                ))
            }),
        (PropertyType::Basic, scalar) => scalar.to_stored_scalar().ok_or_else(|| {
            CoreError::mapping(format!(
                "basic property {owner}.{} holds an association value",
                property.name()
            ))
        }),
        (_, other) => Err(CoreError::mapping(format!(
            "property {owner}.{} cannot hold {other:?}",
            property.name()
        ))),
    }
}

/// Turns collection elements into stored elements.
pub(crate) fn dehydrate_elements(elements: &[Value], role: &str) -> CoreResult<Vec<StoredValue>> {
    elements
        .iter()
        .map(|element| match element {
            Value::Entity(handle) => handle.identifier().map(StoredValue::Reference).ok_or_else(|| {
                CoreError::transient_object(format!(
                    "collection {role} references an unsaved transient instance of {}",
                    handle.entity_name()
                ))
            }),
            scalar => scalar.to_stored_scalar().ok_or_else(|| {
                CoreError::mapping(format!("collection {role} cannot hold nested collections"))
            }),
        })
        .collect()
}

/// Turns a row back into property values.
///
/// References are resolved through the session (which may hand out
/// placeholders) and collection markers become uninitialized collections
/// keyed by `owner_id`.
pub(crate) fn assemble(
    session: &mut Session,
    row: &Row,
    meta: &EntityMetamodel,
    owner_id: &Identifier,
) -> CoreResult<Vec<Value>> {
    let mut values = Vec::with_capacity(meta.property_count());
    for (index, property) in meta.properties().iter().enumerate() {
        let stored = row.get(index).unwrap_or(&StoredValue::Null);
        values.push(assemble_property(session, stored, property, meta.name(), owner_id)?);
    }
    Ok(values)
}

pub(crate) fn assemble_property(
    session: &mut Session,
    stored: &StoredValue,
    property: &PropertyMetadata,
    owner: &str,
    owner_id: &Identifier,
) -> CoreResult<Value> {
    match (property.ty(), stored) {
        (_, StoredValue::Null) => Ok(Value::Null),
        (_, StoredValue::Unfetched) => Ok(Value::Unfetched),
        (PropertyType::ManyToOne { entity_name }, StoredValue::Reference(id)) => {
            let handle = session.internal_load(entity_name, id.clone(), false, false)?;
            Ok(handle.map_or(Value::Null, Value::Entity))
        }
        (PropertyType::Collection { role }, StoredValue::Collection) => {
            Ok(Value::Collection(collection_for(session, role, owner_id)))
        }
        (PropertyType::Basic, scalar) => scalar.to_scalar_value().ok_or_else(|| {
            CoreError::mapping(format!(
                "row of {owner} holds {scalar:?} for basic property {}",
                property.name()
            ))
        }),
        (_, other) => Err(CoreError::mapping(format!(
            "row of {owner} holds {other:?} for property {}",
            property.name()
        ))),
    }
}

fn collection_for(session: &mut Session, role: &str, owner_id: &Identifier) -> CollectionRef {
    let key = CollectionKey::new(role, owner_id.clone());
    if let Some(existing) = session.persistence_context().get_collection(&key) {
        return existing;
    }
    let collection = CollectionRef::uninitialized(role, owner_id.clone(), session.id());
    session
        .context_mut()
        .add_uninitialized_collection(&collection, role, owner_id.clone());
    collection
}

/// Turns stored collection elements back into values.
pub(crate) fn assemble_elements(
    session: &mut Session,
    stored: &[StoredValue],
    element: &ElementType,
    role: &str,
) -> CoreResult<Vec<Value>> {
    let mut values = Vec::with_capacity(stored.len());
    for item in stored {
        let value = match (element, item) {
            (ElementType::Entity(entity_name), StoredValue::Reference(id)) => session
                .internal_load(entity_name, id.clone(), false, false)?
                .map_or(Value::Null, Value::Entity),
            (_, scalar) => scalar.to_scalar_value().ok_or_else(|| {
                CoreError::mapping(format!("collection {role} holds unexpected element {scalar:?}"))
            })?,
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::test_support::order_metamodel;

    #[test]
    fn dehydrate_replaces_references_with_identifiers() {
        let customer = EntityRef::with_identifier("Customer", Identifier::from(7), vec![]);
        let values = vec![
            Value::from("A-1"),
            Value::Unfetched,
            Value::from(customer),
            Value::from(2),
        ];
        let row = dehydrate(&values, &order_metamodel()).unwrap();
        assert_eq!(
            row,
            vec![
                StoredValue::Text("A-1".into()),
                StoredValue::Unfetched,
                StoredValue::Reference(Identifier::from(7)),
                StoredValue::Integer(2),
            ]
        );
    }

    #[test]
    fn dehydrate_rejects_unsaved_reference() {
        let customer = EntityRef::new("Customer", vec![]);
        let values = vec![Value::from("A-1"), Value::Null, Value::from(customer), Value::from(0)];
        let err = dehydrate(&values, &order_metamodel()).unwrap_err();
        assert!(matches!(err, CoreError::TransientObject { .. }));
    }

    #[test]
    fn element_dehydration() {
        let line = EntityRef::with_identifier("Line", Identifier::from(3), vec![]);
        let stored = dehydrate_elements(&[Value::from(line), Value::from("x")], "Order.lines").unwrap();
        assert_eq!(
            stored,
            vec![StoredValue::Reference(Identifier::from(3)), StoredValue::Text("x".into())]
        );
        let nested = Value::Collection(CollectionRef::new(vec![]));
        assert!(dehydrate_elements(&[nested], "Order.lines").is_err());
    }
}
