//! Queue of keys that can be fetched together.

use crate::types::{EntityKey, Identifier};
use std::collections::HashMap;

/// Keys of placeholders that were handed out but not yet loaded.
///
/// When one of them is initialized, the loader asks the queue for more keys
/// of the same entity so that a single store round trip loads several rows.
/// Keys are kept in the order they were queued.
#[derive(Debug, Default)]
pub struct BatchFetchQueue {
    entity_keys: HashMap<String, Vec<EntityKey>>,
}

impl BatchFetchQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a key unless it is already queued.
    pub fn add_batch_loadable_entity_key(&mut self, key: EntityKey) {
        let keys = self
            .entity_keys
            .entry(key.entity_name().to_string())
            .or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Removes a key once its row has been loaded.
    pub fn remove_batch_loadable_entity_key(&mut self, key: &EntityKey) {
        if let Some(keys) = self.entity_keys.get_mut(key.entity_name()) {
            keys.retain(|queued| queued != key);
            if keys.is_empty() {
                self.entity_keys.remove(key.entity_name());
            }
        }
    }

    /// Returns true if the key is queued.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entity_keys
            .get(key.entity_name())
            .map_or(false, |keys| keys.contains(key))
    }

    /// Returns up to `batch_size` identifiers to load together, starting
    /// with the requested one.
    #[must_use]
    pub fn get_entity_batch(
        &self,
        entity_name: &str,
        id: &Identifier,
        batch_size: usize,
    ) -> Vec<Identifier> {
        let mut ids = vec![id.clone()];
        if batch_size <= 1 {
            return ids;
        }
        if let Some(keys) = self.entity_keys.get(entity_name) {
            for key in keys {
                if ids.len() >= batch_size {
                    break;
                }
                if key.identifier() != id {
                    ids.push(key.identifier().clone());
                }
            }
        }
        ids
    }

    /// Returns the number of queued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entity_keys.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entity_keys.is_empty()
    }

    /// Drops every queued key.
    pub fn clear(&mut self) {
        self.entity_keys.clear();
    }
}
