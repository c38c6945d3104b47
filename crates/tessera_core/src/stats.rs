//! Factory-wide statistics.
//!
//! Counters are shared by every unit of work opened from one factory and
//! can be read while sessions are running.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct Statistics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,

    entity_loads: AtomicU64,
    entity_fetches: AtomicU64,
    entity_inserts: AtomicU64,
    entity_updates: AtomicU64,
    entity_deletes: AtomicU64,

    collection_loads: AtomicU64,
    collection_recreates: AtomicU64,
    collection_updates: AtomicU64,
    collection_removes: AtomicU64,

    flushes: AtomicU64,
    optimistic_failures: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_puts: AtomicU64,
}

impl Statistics {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    // === Recorders (internal use) ===

    pub(crate) fn record_session_open(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_close(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an instance handed out by a load, from any tier.
    pub(crate) fn record_entity_load(&self) {
        self.entity_loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a row read from the store.
    pub(crate) fn record_entity_fetch(&self) {
        self.entity_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_insert(&self) {
        self.entity_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_update(&self) {
        self.entity_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_delete(&self) {
        self.entity_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_load(&self) {
        self.collection_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_recreate(&self) {
        self.collection_recreates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_update(&self) {
        self.collection_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_remove(&self) {
        self.collection_removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_optimistic_failure(&self) {
        self.optimistic_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_put(&self) {
        self.cache_puts.fetch_add(1, Ordering::Relaxed);
    }

    // === Getters ===

    /// Returns the number of sessions opened.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions closed.
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Returns the number of entity loads.
    pub fn entity_loads(&self) -> u64 {
        self.entity_loads.load(Ordering::Relaxed)
    }

    /// Returns the number of rows fetched from the store.
    pub fn entity_fetches(&self) -> u64 {
        self.entity_fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of inserted rows.
    pub fn entity_inserts(&self) -> u64 {
        self.entity_inserts.load(Ordering::Relaxed)
    }

    /// Returns the number of updated rows.
    pub fn entity_updates(&self) -> u64 {
        self.entity_updates.load(Ordering::Relaxed)
    }

    /// Returns the number of deleted rows.
    pub fn entity_deletes(&self) -> u64 {
        self.entity_deletes.load(Ordering::Relaxed)
    }

    /// Returns the number of collections loaded.
    pub fn collection_loads(&self) -> u64 {
        self.collection_loads.load(Ordering::Relaxed)
    }

    /// Returns the number of collections recreated.
    pub fn collection_recreates(&self) -> u64 {
        self.collection_recreates.load(Ordering::Relaxed)
    }

    /// Returns the number of collections updated.
    pub fn collection_updates(&self) -> u64 {
        self.collection_updates.load(Ordering::Relaxed)
    }

    /// Returns the number of collections removed.
    pub fn collection_removes(&self) -> u64 {
        self.collection_removes.load(Ordering::Relaxed)
    }

    /// Returns the number of flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of optimistic-concurrency failures.
    pub fn optimistic_failures(&self) -> u64 {
        self.optimistic_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of second-level cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of second-level cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of entries put into the second-level cache.
    pub fn cache_puts(&self) -> u64 {
        self.cache_puts.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_opened: self.sessions_opened(),
            sessions_closed: self.sessions_closed(),
            entity_loads: self.entity_loads(),
            entity_fetches: self.entity_fetches(),
            entity_inserts: self.entity_inserts(),
            entity_updates: self.entity_updates(),
            entity_deletes: self.entity_deletes(),
            collection_loads: self.collection_loads(),
            collection_recreates: self.collection_recreates(),
            collection_updates: self.collection_updates(),
            collection_removes: self.collection_removes(),
            flushes: self.flushes(),
            optimistic_failures: self.optimistic_failures(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_puts: self.cache_puts(),
        }
    }
}

/// A point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Sessions closed.
    pub sessions_closed: u64,
    /// Entity loads.
    pub entity_loads: u64,
    /// Rows fetched from the store.
    pub entity_fetches: u64,
    /// Rows inserted.
    pub entity_inserts: u64,
    /// Rows updated.
    pub entity_updates: u64,
    /// Rows deleted.
    pub entity_deletes: u64,
    /// Collections loaded.
    pub collection_loads: u64,
    /// Collections recreated.
    pub collection_recreates: u64,
    /// Collections updated.
    pub collection_updates: u64,
    /// Collections removed.
    pub collection_removes: u64,
    /// Flushes.
    pub flushes: u64,
    /// Optimistic-concurrency failures.
    pub optimistic_failures: u64,
    /// Second-level cache hits.
    pub cache_hits: u64,
    /// Second-level cache misses.
    pub cache_misses: u64,
    /// Second-level cache puts.
    pub cache_puts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = Statistics::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_writes() {
        let stats = Statistics::new();
        stats.record_entity_insert();
        stats.record_entity_insert();
        stats.record_entity_update();
        stats.record_flush();

        let snap = stats.snapshot();
        assert_eq!(snap.entity_inserts, 2);
        assert_eq!(snap.entity_updates, 1);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.entity_deletes, 0);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(Statistics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_cache_hit();
                    s.record_cache_miss();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.cache_hits(), 800);
        assert_eq!(stats.cache_misses(), 800);
    }
}
