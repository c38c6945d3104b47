//! Original-to-copy map of one merge operation.

use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::types::InstanceId;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CopyEntry {
    original: EntityRef,
    copy: EntityRef,
    operated_on: bool,
}

/// Maps each merged instance to its managed copy.
///
/// The mapping is one-to-one in both directions. An entry is "operated on"
/// once the merge of its original has run; copies created ahead of that
/// (while resolving references) are not.
#[derive(Debug, Default)]
pub struct CopyCache {
    by_original: HashMap<InstanceId, CopyEntry>,
    originals_by_copy: HashMap<InstanceId, InstanceId>,
    order: Vec<InstanceId>,
}

impl CopyCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the copy of `original`.
    #[must_use]
    pub fn get(&self, original: &EntityRef) -> Option<EntityRef> {
        self.by_original
            .get(&original.instance_id())
            .map(|e| e.copy.clone())
    }

    /// Returns true if `original` has a copy.
    #[must_use]
    pub fn contains_original(&self, original: &EntityRef) -> bool {
        self.by_original.contains_key(&original.instance_id())
    }

    /// Returns true if `entity` is the copy of some original.
    #[must_use]
    pub fn contains_copy(&self, entity: &EntityRef) -> bool {
        self.originals_by_copy.contains_key(&entity.instance_id())
    }

    /// Records `copy` as the copy of `original`.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure if either side is already mapped to a
    /// different instance.
    pub fn put(&mut self, original: &EntityRef, copy: &EntityRef, operated_on: bool) -> CoreResult<()> {
        let original_id = original.instance_id();
        if let Some(existing) = self.by_original.get_mut(&original_id) {
            if !existing.copy.same_instance(copy) {
                return Err(CoreError::assertion_failure(format!(
                    "{original:?} is already mapped to copy {:?}",
                    existing.copy
                )));
            }
            existing.operated_on |= operated_on;
            return Ok(());
        }
        if let Some(other) = self.originals_by_copy.get(&copy.instance_id()) {
            if *other != original_id {
                return Err(CoreError::assertion_failure(format!(
                    "copy {copy:?} is already mapped to another original"
                )));
            }
        }
        self.originals_by_copy
            .insert(copy.instance_id(), original_id);
        self.by_original.insert(
            original_id,
            CopyEntry {
                original: original.clone(),
                copy: copy.clone(),
                operated_on,
            },
        );
        self.order.push(original_id);
        Ok(())
    }

    /// Returns true once the merge of `original` ran.
    #[must_use]
    pub fn is_operated_on(&self, original: &EntityRef) -> bool {
        self.by_original
            .get(&original.instance_id())
            .map_or(false, |e| e.operated_on)
    }

    /// Marks the merge of `original` as run.
    pub fn set_operated_on(&mut self, original: &EntityRef, operated_on: bool) {
        if let Some(entry) = self.by_original.get_mut(&original.instance_id()) {
            entry.operated_on = operated_on;
        }
    }

    /// Returns `(original, copy, operated_on)` triples in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<(EntityRef, EntityRef, bool)> {
        self.order
            .iter()
            .filter_map(|id| self.by_original.get(id))
            .map(|e| (e.original.clone(), e.copy.clone(), e.operated_on))
            .collect()
    }

    /// Returns the number of mapped originals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_original.len()
    }

    /// Returns true if nothing was merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_original.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> EntityRef {
        EntityRef::new("Child", vec![])
    }

    #[test]
    fn maps_both_directions() {
        let mut cache = CopyCache::new();
        let (original, copy) = (entity(), entity());
        cache.put(&original, &copy, false).unwrap();
        assert!(cache.get(&original).unwrap().same_instance(&copy));
        assert!(cache.contains_copy(&copy));
        assert!(!cache.contains_copy(&original));
        assert!(!cache.is_operated_on(&original));
        cache.set_operated_on(&original, true);
        assert!(cache.is_operated_on(&original));
    }

    #[test]
    fn remapping_is_rejected() {
        let mut cache = CopyCache::new();
        let (original, copy, other) = (entity(), entity(), entity());
        cache.put(&original, &copy, true).unwrap();
        assert!(cache.put(&original, &other, true).is_err());
        assert!(cache.put(&other, &copy, true).is_err());
        cache.put(&original, &copy, false).unwrap();
        assert!(cache.is_operated_on(&original));
    }

    #[test]
    fn self_copies_are_allowed() {
        let mut cache = CopyCache::new();
        let managed = entity();
        cache.put(&managed, &managed, true).unwrap();
        assert!(cache.contains_copy(&managed));
        assert_eq!(cache.entries().len(), 1);
    }
}
