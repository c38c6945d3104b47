//! Second-level cache contracts.
//!
//! A cache region is shared by every unit of work of a factory. Entries hold
//! dehydrated rows only. Writers take a soft lock on a key before touching
//! the store and release it afterwards; while a key is soft-locked the
//! region must not serve or accept entries for it.

pub(crate) mod coordinator;

use crate::error::CoreResult;
use crate::types::{Identifier, Version};
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a cache entry: entity name (or collection role) plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    name: String,
    id: Identifier,
}

impl CacheKey {
    /// Creates a key.
    pub fn new(name: impl Into<String>, id: Identifier) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Returns the entity name or collection role.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> &Identifier {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Cached state of an entity row or collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entity name or collection role.
    pub name: String,
    /// Dehydrated state (entity row or collection elements).
    pub state: Row,
    /// Version of the row when cached.
    pub version: Option<Version>,
}

/// Token returned by [`CacheAccessStrategy::lock_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftLock(u64);

impl SoftLock {
    /// Creates a token.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw token.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Access strategy of one cache region.
pub trait CacheAccessStrategy: Send + Sync {
    /// Returns the region name.
    fn region_name(&self) -> &str;

    /// Reads an entry cached before `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region fails.
    fn get(&self, key: &CacheKey, timestamp: i64) -> CoreResult<Option<CacheEntry>>;

    /// Caches state just read from the store.
    ///
    /// Returns false if the region declined (for instance because the key
    /// is soft-locked).
    ///
    /// # Errors
    ///
    /// Returns an error if the region fails.
    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        timestamp: i64,
        version: Option<Version>,
    ) -> CoreResult<bool>;

    /// Soft-locks a key ahead of a store write.
    ///
    /// # Errors
    ///
    /// Returns an error if the region fails.
    fn lock_item(&self, key: &CacheKey, version: Option<Version>) -> CoreResult<Option<SoftLock>>;

    /// Releases a soft lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the region fails.
    fn unlock_item(&self, key: &CacheKey, lock: Option<SoftLock>) -> CoreResult<()>;

    /// Removes an entry outright.
    ///
    /// # Errors
    ///
    /// Returns an error if the region fails.
    fn evict(&self, key: &CacheKey) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StoredValue;

    #[test]
    fn entries_serialize() {
        let entry = CacheEntry {
            name: "Order".into(),
            state: vec![StoredValue::Text("A".into()), StoredValue::Reference(Identifier::from(3))],
            version: Some(Version::Integer(2)),
        };
        let json = serde_json::to_vec(&entry).unwrap();
        let back: CacheEntry = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn key_display() {
        assert_eq!(CacheKey::new("Order", Identifier::from(1)).to_string(), "Order#1");
    }
}
