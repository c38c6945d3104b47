//! In-memory second-level cache region.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{CacheAccessStrategy, CacheEntry, CacheKey, CoreError, CoreResult, SoftLock, Version};

struct Stored {
    json: String,
    timestamp: i64,
    version: Option<Version>,
}

#[derive(Default)]
struct RegionState {
    entries: HashMap<CacheKey, Stored>,
    locks: HashMap<CacheKey, Vec<u64>>,
}

/// Call counters of an [`InMemoryCacheRegion`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounters {
    /// Reads that returned an entry.
    pub hits: u64,
    /// Reads that returned nothing.
    pub misses: u64,
    /// Entries accepted.
    pub puts: u64,
    /// Entries declined.
    pub declined_puts: u64,
    /// Soft locks taken.
    pub locks: u64,
    /// Soft locks released.
    pub unlocks: u64,
    /// Explicit evictions.
    pub evictions: u64,
}

/// Read-write cache region keeping entries serialized as JSON.
///
/// A soft-locked key is neither served nor accepted until every lock on it
/// is released. Entries are only served to units of work that started after
/// the entry was cached.
pub struct InMemoryCacheRegion {
    name: String,
    state: Mutex<RegionState>,
    counters: Mutex<RegionCounters>,
    next_lock: AtomicU64,
}

impl InMemoryCacheRegion {
    /// Creates an empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RegionState::default()),
            counters: Mutex::new(RegionCounters::default()),
            next_lock: AtomicU64::new(1),
        }
    }

    /// Returns true if an entry is cached under `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns the number of soft locks not released yet.
    #[must_use]
    pub fn outstanding_locks(&self) -> usize {
        self.state.lock().locks.values().map(Vec::len).sum()
    }

    /// Returns true if `key` is soft-locked.
    #[must_use]
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        self.state.lock().locks.get(key).map_or(false, |locks| !locks.is_empty())
    }

    /// Returns the cached entry without counting a read.
    ///
    /// # Errors
    ///
    /// Fails if the stored JSON cannot be decoded.
    pub fn peek(&self, key: &CacheKey) -> CoreResult<Option<CacheEntry>> {
        let state = self.state.lock();
        state.entries.get(key).map(|stored| decode(&stored.json)).transpose()
    }

    /// Returns the call counters.
    #[must_use]
    pub fn counters(&self) -> RegionCounters {
        *self.counters.lock()
    }

    /// Drops every entry and lock.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.locks.clear();
    }
}

fn decode(json: &str) -> CoreResult<CacheEntry> {
    serde_json::from_str(json).map_err(|err| CoreError::cache(format!("corrupt cache entry: {err}")))
}

impl CacheAccessStrategy for InMemoryCacheRegion {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey, timestamp: i64) -> CoreResult<Option<CacheEntry>> {
        let entry = {
            let state = self.state.lock();
            let locked = state.locks.get(key).map_or(false, |locks| !locks.is_empty());
            match state.entries.get(key) {
                Some(stored) if !locked && stored.timestamp <= timestamp => Some(decode(&stored.json)?),
                _ => None,
            }
        };
        let mut counters = self.counters.lock();
        if entry.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        Ok(entry)
    }

    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        timestamp: i64,
        version: Option<Version>,
    ) -> CoreResult<bool> {
        let json = serde_json::to_string(&entry).map_err(|err| CoreError::cache(err.to_string()))?;
        let accepted = {
            let mut state = self.state.lock();
            let locked = state.locks.get(key).map_or(false, |locks| !locks.is_empty());
            // minimal puts: an entry already cached for this version stays
            let present = state
                .entries
                .get(key)
                .map_or(false, |stored| stored.version == version);
            if locked || present {
                false
            } else {
                state.entries.insert(
                    key.clone(),
                    Stored {
                        json,
                        timestamp,
                        version,
                    },
                );
                true
            }
        };
        let mut counters = self.counters.lock();
        if accepted {
            counters.puts += 1;
        } else {
            counters.declined_puts += 1;
        }
        tracing::trace!(region = %self.name, %key, accepted, "put from load");
        Ok(accepted)
    }

    fn lock_item(&self, key: &CacheKey, _version: Option<Version>) -> CoreResult<Option<SoftLock>> {
        let id = self.next_lock.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.entries.remove(key);
            state.locks.entry(key.clone()).or_default().push(id);
        }
        self.counters.lock().locks += 1;
        Ok(Some(SoftLock::new(id)))
    }

    fn unlock_item(&self, key: &CacheKey, lock: Option<SoftLock>) -> CoreResult<()> {
        let Some(lock) = lock else {
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            let released = state
                .locks
                .get_mut(key)
                .and_then(|locks| locks.iter().position(|id| *id == lock.id()).map(|at| locks.remove(at)));
            if released.is_none() {
                return Err(CoreError::cache(format!("{key} is not locked by {}", lock.id())));
            }
            if state.locks.get(key).map_or(false, Vec::is_empty) {
                state.locks.remove(key);
            }
        }
        self.counters.lock().unlocks += 1;
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> CoreResult<()> {
        self.state.lock().entries.remove(key);
        self.counters.lock().evictions += 1;
        Ok(())
    }
}

impl fmt::Debug for InMemoryCacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheRegion")
            .field("name", &self.name)
            .field("entries", &self.entry_count())
            .field("outstanding_locks", &self.outstanding_locks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Identifier, StoredValue};

    fn entry(version: i64) -> CacheEntry {
        CacheEntry {
            name: "Order".into(),
            state: vec![StoredValue::Text("NEW".into()), StoredValue::Integer(version)],
            version: Some(Version::Integer(version)),
        }
    }

    #[test]
    fn soft_lock_blocks_reads_and_puts() {
        let region = InMemoryCacheRegion::new("orders");
        let key = CacheKey::new("Order", Identifier::from(1));
        assert!(region.put_from_load(&key, entry(0), 10, Some(Version::Integer(0))).unwrap());

        let lock = region.lock_item(&key, Some(Version::Integer(0))).unwrap();
        assert!(region.get(&key, 20).unwrap().is_none());
        assert!(!region.put_from_load(&key, entry(0), 20, Some(Version::Integer(0))).unwrap());

        region.unlock_item(&key, lock).unwrap();
        assert_eq!(region.outstanding_locks(), 0);
        assert!(region.put_from_load(&key, entry(1), 30, Some(Version::Integer(1))).unwrap());
        assert_eq!(region.get(&key, 30).unwrap(), Some(entry(1)));
    }

    #[test]
    fn entries_are_not_served_to_older_units_of_work() {
        let region = InMemoryCacheRegion::new("orders");
        let key = CacheKey::new("Order", Identifier::from(1));
        region.put_from_load(&key, entry(0), 50, Some(Version::Integer(0))).unwrap();
        assert!(region.get(&key, 40).unwrap().is_none());
        assert!(region.get(&key, 50).unwrap().is_some());
        assert_eq!(region.counters().hits, 1);
        assert_eq!(region.counters().misses, 1);
    }

    #[test]
    fn releasing_an_unknown_lock_fails() {
        let region = InMemoryCacheRegion::new("orders");
        let key = CacheKey::new("Order", Identifier::from(1));
        assert!(region.unlock_item(&key, Some(SoftLock::new(99))).is_err());
        assert!(region.unlock_item(&key, None).is_ok());
    }
}
