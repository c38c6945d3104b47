//! Identifier and key types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Persistent identifier of an entity row.
///
/// Identifiers are opaque to the engine: they are compared, hashed and
/// handed to persisters, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// Numeric identifier (sequences, identity columns).
    Integer(i64),
    /// Textual identifier (natural keys).
    Text(String),
    /// UUID identifier.
    Uuid(Uuid),
}

impl Identifier {
    /// Creates a new random UUID identifier.
    #[must_use]
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    /// Returns the numeric value, if this is an integer identifier.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

/// How entity instances are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntityMode {
    /// Typed objects.
    #[default]
    Pojo,
    /// Name/value maps.
    DynamicMap,
}

/// Unique key of a tracked entity: `(identifier, entity name, mode)`.
///
/// At most one instance per key may be tracked by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    identifier: Identifier,
    entity_name: String,
    mode: EntityMode,
}

impl EntityKey {
    /// Creates a key in the default entity mode.
    pub fn new(identifier: Identifier, entity_name: impl Into<String>) -> Self {
        Self {
            identifier,
            entity_name: entity_name.into(),
            mode: EntityMode::Pojo,
        }
    }

    /// Returns a copy of this key with a different entity mode.
    #[must_use]
    pub fn with_mode(mut self, mode: EntityMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the identifier.
    #[must_use]
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the entity mode.
    #[must_use]
    pub const fn mode(&self) -> EntityMode {
        self.mode
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.identifier)
    }
}

/// Key of a collection: `(role, owner identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    role: String,
    key: Identifier,
}

impl CollectionKey {
    /// Creates a collection key.
    pub fn new(role: impl Into<String>, key: Identifier) -> Self {
        Self {
            role: role.into(),
            key,
        }
    }

    /// Returns the role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the owner key.
    #[must_use]
    pub fn key(&self) -> &Identifier {
        &self.key
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.key)
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of an in-memory object.
///
/// The registry keys its identity maps by this handle, so two instances
/// holding equal values are still distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw handle value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identifier of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Optimistic-lock version of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Counter version.
    Integer(i64),
    /// Millisecond timestamp version.
    Timestamp(i64),
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Timestamp(t) => write!(f, "ts:{t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn entity_key_display() {
        let key = EntityKey::new(Identifier::from(42), "Order");
        assert_eq!(key.to_string(), "Order#42");
        assert_eq!(key.mode(), EntityMode::Pojo);
    }

    #[test]
    fn keys_differ_by_mode() {
        let a = EntityKey::new(Identifier::from(1), "Order");
        let b = a.clone().with_mode(EntityMode::DynamicMap);
        assert_ne!(a, b);
    }

    #[test]
    fn identifier_serde_roundtrip() {
        let id = Identifier::new_uuid();
        let json = serde_json::to_string(&id).unwrap();
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn version_ordering() {
        assert!(Version::Integer(3) < Version::Integer(4));
    }
}
