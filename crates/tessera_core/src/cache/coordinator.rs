//! Soft-lock coordination between units of work and cache regions.

use super::{CacheAccessStrategy, CacheEntry, CacheKey};
use crate::error::CoreResult;
use crate::persister::CollectionPersister;
use crate::stats::Statistics;
use crate::types::{Identifier, Version};
use std::sync::Arc;

/// Runs `work` while `key` is soft-locked in `region`.
///
/// The lock is released whatever `work` returns. A failure to release is
/// logged and does not replace the result of `work`.
pub(crate) fn with_soft_lock<T>(
    region: Option<&Arc<dyn CacheAccessStrategy>>,
    key: &CacheKey,
    version: Option<Version>,
    work: impl FnOnce() -> CoreResult<T>,
) -> CoreResult<T> {
    let Some(region) = region else {
        return work();
    };
    let lock = region.lock_item(key, version)?;
    tracing::trace!(region = region.region_name(), %key, "soft lock acquired");
    let result = work();
    if let Err(err) = region.unlock_item(key, lock) {
        tracing::warn!(region = region.region_name(), %key, error = %err, "failed to release soft lock");
    }
    result
}

/// Reads an entry, counting the hit or miss.
pub(crate) fn get(
    region: &Arc<dyn CacheAccessStrategy>,
    key: &CacheKey,
    timestamp: i64,
    stats: &Statistics,
) -> CoreResult<Option<CacheEntry>> {
    let entry = region.get(key, timestamp)?;
    if entry.is_some() {
        stats.record_cache_hit();
        tracing::trace!(region = region.region_name(), %key, "cache hit");
    } else {
        stats.record_cache_miss();
    }
    Ok(entry)
}

/// Offers state just read from the store to a region.
pub(crate) fn put_from_load(
    region: &Arc<dyn CacheAccessStrategy>,
    key: &CacheKey,
    entry: CacheEntry,
    timestamp: i64,
    stats: &Statistics,
) -> CoreResult<bool> {
    let version = entry.version;
    let accepted = region.put_from_load(key, entry, timestamp, version)?;
    if accepted {
        stats.record_cache_put();
    }
    Ok(accepted)
}

/// Evicts an entity and every collection it owns.
pub(crate) fn evict_entity_and_collections(
    region: Option<&Arc<dyn CacheAccessStrategy>>,
    key: &CacheKey,
    collections: &[Arc<dyn CollectionPersister>],
) -> CoreResult<()> {
    if let Some(region) = region {
        region.evict(key)?;
    }
    evict_collections(collections, key.id())
}

/// Evicts the cached elements of each role owned by `owner`.
pub(crate) fn evict_collections(
    collections: &[Arc<dyn CollectionPersister>],
    owner: &Identifier,
) -> CoreResult<()> {
    for persister in collections {
        if let Some(region) = persister.cache_access() {
            region.evict(&CacheKey::new(persister.role(), owner.clone()))?;
        }
    }
    Ok(())
}
