//! Dynamic property values, stored rows and state snapshots.

use crate::collection::CollectionRef;
use crate::entity::{EntityHandle, EntityRef};
use crate::types::{Identifier, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A property value of a tracked entity.
///
/// Scalars are owned; associations keep the identity of the referenced
/// instance or collection.
#[derive(Clone, Default)]
pub enum Value {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Text string.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Millisecond timestamp.
    Timestamp(i64),
    /// Reference to another entity (or its lazy placeholder).
    Entity(EntityHandle),
    /// Collection of values or entity references.
    Collection(CollectionRef),
    /// Lazy attribute that has not been fetched yet.
    Unfetched,
}

impl Value {
    /// Returns true for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true unless this is an unfetched lazy attribute.
    #[must_use]
    pub const fn is_fetched(&self) -> bool {
        !matches!(self, Self::Unfetched)
    }

    /// Returns the referenced entity handle, if any.
    #[must_use]
    pub fn as_entity(&self) -> Option<&EntityHandle> {
        match self {
            Self::Entity(handle) => Some(handle),
            _ => None,
        }
    }

    /// Returns the collection, if any.
    #[must_use]
    pub fn as_collection(&self) -> Option<&CollectionRef> {
        match self {
            Self::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// Returns the integer, if any.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Copies the value for a snapshot.
    ///
    /// Scalar data is duplicated; association values keep pointing at the
    /// same instance so identity comparisons still work against the copy.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Interprets the value as a version.
    #[must_use]
    pub const fn as_version(&self) -> Option<Version> {
        match self {
            Self::Integer(n) => Some(Version::Integer(*n)),
            Self::Timestamp(t) => Some(Version::Timestamp(*t)),
            _ => None,
        }
    }

    /// Converts a scalar to its stored form; `None` for associations.
    #[must_use]
    pub fn to_stored_scalar(&self) -> Option<StoredValue> {
        Some(match self {
            Self::Null => StoredValue::Null,
            Self::Bool(b) => StoredValue::Bool(*b),
            Self::Integer(n) => StoredValue::Integer(*n),
            Self::Text(s) => StoredValue::Text(s.clone()),
            Self::Bytes(b) => StoredValue::Bytes(b.clone()),
            Self::Timestamp(t) => StoredValue::Timestamp(*t),
            Self::Unfetched => StoredValue::Unfetched,
            Self::Entity(_) | Self::Collection(_) => return None,
        })
    }
}

impl From<Version> for Value {
    fn from(version: Version) -> Self {
        match version {
            Version::Integer(n) => Self::Integer(n),
            Version::Timestamp(t) => Self::Timestamp(t),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::Unfetched, Self::Unfetched) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) | (Self::Timestamp(a), Self::Timestamp(b)) => {
                a == b
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a.same_instance(b),
            (Self::Collection(a), Self::Collection(b)) => a.same_instance(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Text(s) => write!(f, "Text({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Timestamp(t) => write!(f, "Timestamp({t})"),
            Self::Entity(handle) => write!(f, "Entity({handle:?})"),
            Self::Collection(collection) => write!(f, "Collection({collection:?})"),
            Self::Unfetched => write!(f, "Unfetched"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<EntityRef> for Value {
    fn from(entity: EntityRef) -> Self {
        Self::Entity(EntityHandle::Entity(entity))
    }
}

impl From<&EntityRef> for Value {
    fn from(entity: &EntityRef) -> Self {
        Self::Entity(EntityHandle::Entity(entity.clone()))
    }
}

impl From<EntityHandle> for Value {
    fn from(handle: EntityHandle) -> Self {
        Self::Entity(handle)
    }
}

impl From<CollectionRef> for Value {
    fn from(collection: CollectionRef) -> Self {
        Self::Collection(collection)
    }
}

/// A property value as persisters and cache regions see it.
///
/// Entity references are reduced to identifiers and collection values to a
/// marker, so a stored row never holds live objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Text string.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Millisecond timestamp.
    Timestamp(i64),
    /// Foreign key to another entity.
    Reference(Identifier),
    /// Collection-valued property, stored by its collection persister.
    Collection,
    /// Lazy attribute that was not selected.
    Unfetched,
}

impl StoredValue {
    /// Converts a stored scalar back to a [`Value`]; `None` for references
    /// and collection markers, which need the session to resolve.
    #[must_use]
    pub fn to_scalar_value(&self) -> Option<Value> {
        Some(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(n) => Value::Integer(*n),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Bytes(b) => Value::Bytes(b.clone()),
            Self::Timestamp(t) => Value::Timestamp(*t),
            Self::Unfetched => Value::Unfetched,
            Self::Reference(_) | Self::Collection => return None,
        })
    }

    /// Interprets the value as a version.
    #[must_use]
    pub const fn as_version(&self) -> Option<Version> {
        match self {
            Self::Integer(n) => Some(Version::Integer(*n)),
            Self::Timestamp(t) => Some(Version::Timestamp(*t)),
            _ => None,
        }
    }
}

/// A row of stored values, one per mapped property.
pub type Row = Vec<StoredValue>;

/// Deep copy of an entity's property values.
///
/// Loaded and deleted states are always captured through this type so that
/// later mutation of the live instance never leaks into the baseline used
/// by dirty checking.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot(Vec<Value>);

impl Snapshot {
    /// Captures a deep copy of `values`.
    #[must_use]
    pub fn capture(values: &[Value]) -> Self {
        Self(values.iter().map(Value::deep_copy).collect())
    }

    /// Returns the captured values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Returns one captured value.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Returns the number of captured values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the values, consuming the snapshot.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}
