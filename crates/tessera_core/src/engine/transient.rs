//! Transient-versus-detached decisions.

use crate::entity::EntityRef;
use crate::error::CoreResult;
use crate::metadata::{EntityMetamodel, IdStrategy};
use crate::session::Session;
use crate::value::Value;

/// Decides whether an untracked instance was ever saved.
///
/// Policies are consulted in registration order after the interceptor; the
/// first one that answers wins. `None` defers to the next policy, then to the
/// caller's assumption, and finally to a store lookup.
pub trait TransientPolicy: Send + Sync {
    /// Returns `Some(true)` for never-saved instances, `Some(false)` for
    /// detached ones and `None` when undecided.
    fn is_transient(&self, entity: &EntityRef, meta: &EntityMetamodel) -> Option<bool>;
}

/// Decides by unsaved values: a null version or a missing identifier means
/// transient; a present generated identifier means detached. Assigned
/// identifiers are undecided.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsavedValuePolicy;

impl TransientPolicy for UnsavedValuePolicy {
    fn is_transient(&self, entity: &EntityRef, meta: &EntityMetamodel) -> Option<bool> {
        if let Some(version) = meta.version_metadata() {
            if matches!(entity.get(version.index), Value::Null) {
                return Some(true);
            }
        }
        match (entity.identifier(), meta.identifier_strategy()) {
            (None, _) => Some(true),
            (Some(_), IdStrategy::Assigned) => None,
            (Some(_), _) => Some(false),
        }
    }
}

/// Runs the transient decision chain for an untracked instance.
pub(crate) fn is_transient(
    session: &mut Session,
    entity: &EntityRef,
    assumed: Option<bool>,
) -> CoreResult<bool> {
    if let Some(answer) = session.interceptor().is_transient(entity) {
        return Ok(answer);
    }
    let persister = session.entity_persister(entity.entity_name())?;
    let factory = session.factory().clone();
    for policy in factory.transient_policies() {
        if let Some(answer) = policy.is_transient(entity, persister.metamodel()) {
            return Ok(answer);
        }
    }
    if let Some(assumed) = assumed {
        return Ok(assumed);
    }
    let Some(id) = entity.identifier() else {
        return Ok(true);
    };
    session.check_cancelled()?;
    let snapshot = session
        .context_mut()
        .get_database_snapshot(persister.as_ref(), &id)?;
    Ok(snapshot.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;
    use crate::types::Identifier;
    use crate::versioning::VersionType;

    fn versioned() -> EntityMetamodel {
        EntityMetamodel::new("Doc")
            .property(PropertyMetadata::basic("title"))
            .version(PropertyMetadata::basic("version"), VersionType::Integer)
    }

    #[test]
    fn missing_identifier_is_transient() {
        let entity = EntityRef::new("Doc", vec![Value::from("t"), Value::from(1)]);
        assert_eq!(UnsavedValuePolicy.is_transient(&entity, &versioned()), Some(true));
    }

    #[test]
    fn null_version_is_transient() {
        let entity = EntityRef::with_identifier("Doc", Identifier::from(4), vec![Value::from("t"), Value::Null]);
        assert_eq!(UnsavedValuePolicy.is_transient(&entity, &versioned()), Some(true));
    }

    #[test]
    fn generated_identifier_is_detached() {
        let entity = EntityRef::with_identifier("Doc", Identifier::from(4), vec![Value::from("t"), Value::from(0)]);
        assert_eq!(UnsavedValuePolicy.is_transient(&entity, &versioned()), Some(false));
    }

    #[test]
    fn assigned_identifier_is_undecided() {
        let meta = EntityMetamodel::new("Tag")
            .property(PropertyMetadata::basic("label"))
            .id_strategy(IdStrategy::Assigned);
        let entity = EntityRef::with_identifier("Tag", Identifier::from("rust"), vec![Value::from("Rust")]);
        assert_eq!(UnsavedValuePolicy.is_transient(&entity, &meta), None);
    }
}
