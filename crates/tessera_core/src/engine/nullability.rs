//! Not-null checks ahead of inserts and updates.

use crate::error::{CoreError, CoreResult};
use crate::metadata::EntityMetamodel;
use crate::value::Value;

/// Fails if a non-nullable property that will be written holds null.
///
/// Properties excluded from the statement (not insertable on insert, not
/// updatable on update) are not checked.
pub(crate) fn check_nullability(
    values: &[Value],
    meta: &EntityMetamodel,
    is_update: bool,
) -> CoreResult<()> {
    for (index, property) in meta.properties().iter().enumerate() {
        if property.is_nullable() {
            continue;
        }
        let written = if is_update {
            property.is_updatable()
        } else {
            property.is_insertable()
        };
        if !written {
            continue;
        }
        if matches!(values.get(index), None | Some(Value::Null)) {
            return Err(CoreError::property_value(meta.name(), property.name()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;

    fn meta() -> EntityMetamodel {
        EntityMetamodel::new("Line")
            .property(PropertyMetadata::basic("sku").not_null())
            .property(PropertyMetadata::basic("created").not_null().immutable())
            .property(PropertyMetadata::basic("note"))
    }

    #[test]
    fn null_required_property_fails() {
        let err = check_nullability(&[Value::Null, Value::from(1), Value::Null], &meta(), false)
            .unwrap_err();
        assert!(matches!(err, CoreError::PropertyValue { ref property, .. } if property == "sku"));
    }

    #[test]
    fn non_updatable_skipped_on_update() {
        let values = [Value::from("A"), Value::Null, Value::Null];
        assert!(check_nullability(&values, &meta(), true).is_ok());
        assert!(check_nullability(&values, &meta(), false).is_err());
    }

    #[test]
    fn unfetched_counts_as_present() {
        let values = [Value::Unfetched, Value::from(1), Value::Null];
        assert!(check_nullability(&values, &meta(), false).is_ok());
    }
}
