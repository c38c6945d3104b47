//! Error types for the Tessera engine.

use crate::types::{EntityKey, Identifier};
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while working with a unit of work.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A different instance with the same key is already tracked.
    #[error("a different object with the same identifier value was already associated with the session: {key}")]
    NonUniqueObject {
        /// The conflicting key.
        key: EntityKey,
    },

    /// The instance is scheduled for deletion (or already deleted).
    #[error("deleted instance passed to {operation}: {entity_name}#{id}")]
    ObjectDeleted {
        /// Entity name.
        entity_name: String,
        /// Identifier of the deleted instance.
        id: Identifier,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// A transient instance was used where a persistent one is required.
    #[error("transient object: {message}")]
    TransientObject {
        /// Description of the offending reference.
        message: String,
    },

    /// A merge left copies that could not be saved.
    #[error("one or more objects reference unsaved transient instances, save them first: {}", entity_names.join(", "))]
    TransientObjects {
        /// Entity names of the copies that remained unsaved.
        entity_names: Vec<String>,
    },

    /// A non-nullable association references a transient instance.
    #[error("not-null property references a transient value: {entity_name}.{property} -> {transient_entity_name}")]
    TransientPropertyValue {
        /// Entity owning the property.
        entity_name: String,
        /// Property name.
        property: String,
        /// Entity name of the unsaved instance.
        transient_entity_name: String,
    },

    /// A detached instance was passed to an operation that requires a transient one.
    #[error("detached entity passed to {operation}: {entity_name}")]
    PersistentObject {
        /// Entity name.
        entity_name: String,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The row was updated or deleted by another unit of work.
    #[error("row was updated or deleted by another transaction: {entity_name}#{id}")]
    StaleObjectState {
        /// Entity name.
        entity_name: String,
        /// Identifier of the stale row.
        id: Identifier,
    },

    /// No row exists for the given identifier.
    #[error("no row with the given identifier exists: {entity_name}#{id}")]
    ObjectNotFound {
        /// Entity name.
        entity_name: String,
        /// Requested identifier.
        id: Identifier,
    },

    /// The tracked instance under a key has a different entity name than requested.
    #[error("object with id {id} was not of the specified entity type {expected} (found {actual})")]
    WrongClass {
        /// Requested identifier.
        id: Identifier,
        /// Requested entity name.
        expected: String,
        /// Entity name of the tracked instance.
        actual: String,
    },

    /// A lazy placeholder was accessed outside a live unit of work.
    #[error("failed to lazily initialize {what}: {reason}")]
    LazyInitialization {
        /// What was being initialized.
        what: String,
        /// Why initialization was impossible.
        reason: String,
    },

    /// A non-nullable property holds null.
    #[error("not-null property references a null or transient value: {entity_name}.{property}")]
    PropertyValue {
        /// Entity name.
        entity_name: String,
        /// Property name.
        property: String,
    },

    /// An immutable natural identifier was altered.
    #[error("an immutable natural identifier of entity {entity_name} was altered (property {property})")]
    NaturalIdModified {
        /// Entity name.
        entity_name: String,
        /// Natural-id property name.
        property: String,
    },

    /// A collection instance is referenced by more than one owner.
    #[error("found shared references to a collection: {role}")]
    SharedCollection {
        /// Collection role.
        role: String,
    },

    /// No persister is registered for the entity name.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// Requested entity name.
        name: String,
    },

    /// No collection persister is registered for the role.
    #[error("unknown collection role: {role}")]
    UnknownCollectionRole {
        /// Requested role.
        role: String,
    },

    /// A lock mode is not valid for the requested operation.
    #[error("invalid lock mode {mode} for {operation}")]
    InvalidLockMode {
        /// Lock mode name.
        mode: String,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The persister reported a store failure.
    #[error("store error: {message}")]
    Store {
        /// Description of the failure.
        message: String,
    },

    /// The cache access strategy reported a failure.
    #[error("cache error: {message}")]
    Cache {
        /// Description of the failure.
        message: String,
    },

    /// Metadata is inconsistent.
    #[error("mapping error: {message}")]
    Mapping {
        /// Description of the problem.
        message: String,
    },

    /// The session is closed.
    #[error("session is closed")]
    SessionClosed,

    /// The session was cancelled from another thread.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("assertion failure: {message}")]
    AssertionFailure {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CoreError {
    /// Creates a non-unique object error.
    pub fn non_unique(key: EntityKey) -> Self {
        Self::NonUniqueObject { key }
    }

    /// Creates an object deleted error.
    pub fn object_deleted(
        entity_name: impl Into<String>,
        id: Identifier,
        operation: &'static str,
    ) -> Self {
        Self::ObjectDeleted {
            entity_name: entity_name.into(),
            id,
            operation,
        }
    }

    /// Creates a transient object error.
    pub fn transient_object(message: impl Into<String>) -> Self {
        Self::TransientObject {
            message: message.into(),
        }
    }

    /// Creates a persistent object error.
    pub fn persistent_object(entity_name: impl Into<String>, operation: &'static str) -> Self {
        Self::PersistentObject {
            entity_name: entity_name.into(),
            operation,
        }
    }

    /// Creates a stale object state error.
    pub fn stale_state(entity_name: impl Into<String>, id: Identifier) -> Self {
        Self::StaleObjectState {
            entity_name: entity_name.into(),
            id,
        }
    }

    /// Creates an object not found error.
    pub fn not_found(entity_name: impl Into<String>, id: Identifier) -> Self {
        Self::ObjectNotFound {
            entity_name: entity_name.into(),
            id,
        }
    }

    /// Creates a lazy initialization error.
    pub fn lazy_initialization(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LazyInitialization {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Creates a property value (nullability) error.
    pub fn property_value(entity_name: impl Into<String>, property: impl Into<String>) -> Self {
        Self::PropertyValue {
            entity_name: entity_name.into(),
            property: property.into(),
        }
    }

    /// Creates an unknown entity error.
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Creates an unknown collection role error.
    pub fn unknown_role(role: impl Into<String>) -> Self {
        Self::UnknownCollectionRole { role: role.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Creates a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Creates a mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an assertion failure and logs it at error level.
    pub fn assertion_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "assertion failure");
        Self::AssertionFailure { message }
    }

    /// Returns true for optimistic-concurrency failures.
    #[must_use]
    pub fn is_optimistic_failure(&self) -> bool {
        matches!(self, Self::StaleObjectState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_objects_lists_names() {
        let err = CoreError::TransientObjects {
            entity_names: vec!["Child".into(), "Toy".into()],
        };
        let text = err.to_string();
        assert!(text.contains("Child, Toy"));
    }

    #[test]
    fn optimistic_classification() {
        assert!(CoreError::stale_state("Order", Identifier::from(1)).is_optimistic_failure());
        assert!(!CoreError::not_found("Order", Identifier::from(1)).is_optimistic_failure());
    }

    #[test]
    fn non_unique_displays_key() {
        let err = CoreError::non_unique(EntityKey::new(Identifier::from(7), "Order"));
        assert!(err.to_string().contains("Order#7"));
    }
}
