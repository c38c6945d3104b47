//! Registry entries for collections.

use super::CollectionRef;
use crate::types::Identifier;
use crate::value::Value;

/// Registry entry of one tracked collection.
///
/// Besides the loaded role, key and snapshot, the entry carries the
/// per-flush bookkeeping: whether the collection was reached from a live
/// owner and which collection action, if any, the flush scheduled.
#[derive(Debug, Clone, Default)]
pub struct CollectionEntry {
    role: Option<String>,
    loaded_key: Option<Identifier>,
    snapshot: Option<Vec<Value>>,
    dirty: bool,
    initialized: bool,
    pub(crate) current_role: Option<String>,
    pub(crate) current_key: Option<Identifier>,
    pub(crate) reached: bool,
    pub(crate) processed: bool,
    pub(crate) do_update: bool,
    pub(crate) do_remove: bool,
    pub(crate) do_recreate: bool,
}

impl CollectionEntry {
    /// Entry for a collection created in this unit of work.
    pub(crate) fn new_collection(role: &str) -> Self {
        Self {
            current_role: Some(role.to_string()),
            initialized: true,
            dirty: true,
            snapshot: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Entry for a collection loaded (or to be loaded) from the store.
    pub(crate) fn loaded(role: &str, key: Identifier, collection: &CollectionRef) -> Self {
        Self {
            role: Some(role.to_string()),
            loaded_key: Some(key),
            initialized: collection.is_initialized(),
            snapshot: collection.stored_snapshot(),
            ..Self::default()
        }
    }

    /// Entry for a detached collection being reattached.
    pub(crate) fn detached(collection: &CollectionRef) -> Self {
        Self {
            role: collection.role(),
            loaded_key: collection.key(),
            initialized: collection.is_initialized(),
            snapshot: collection.stored_snapshot(),
            ..Self::default()
        }
    }

    /// Returns the role the collection was loaded under.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Returns the owner key the collection was loaded under.
    #[must_use]
    pub fn loaded_key(&self) -> Option<&Identifier> {
        self.loaded_key.as_ref()
    }

    /// Returns the element snapshot taken at load or last flush.
    #[must_use]
    pub fn snapshot(&self) -> Option<&[Value]> {
        self.snapshot.as_deref()
    }

    /// Returns true if the collection needs writing.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns true if the elements are loaded.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true if the snapshot holds no elements.
    #[must_use]
    pub fn is_snapshot_empty(&self) -> bool {
        self.snapshot.as_ref().map_or(true, Vec::is_empty)
    }

    pub(crate) fn post_initialize(&mut self, collection: &CollectionRef) {
        self.initialized = true;
        self.snapshot = collection.stored_snapshot();
    }

    /// Resets the per-flush flags and recomputes dirtiness.
    pub(crate) fn pre_flush(&mut self, collection: &CollectionRef) {
        if collection.is_initialized() && !collection.is_dirty() {
            if let Some(snapshot) = &self.snapshot {
                let current = collection.loaded_elements();
                if snapshot.len() != current.len()
                    || snapshot.iter().zip(current.iter()).any(|(a, b)| a != b)
                {
                    collection.mark_dirty();
                }
            }
        }
        self.dirty = collection.is_dirty();
        self.initialized = collection.is_initialized();
        self.reached = false;
        self.processed = false;
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
    }

    /// Adopts the current role and key after the flush executed.
    pub(crate) fn post_flush(&mut self, collection: &CollectionRef) {
        self.role = self.current_role.clone();
        self.loaded_key = self.current_key.clone();
        self.dirty = false;
        collection.post_action();
        if collection.is_initialized() {
            self.snapshot = collection.stored_snapshot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_collections_start_dirty() {
        let entry = CollectionEntry::new_collection("Order.lines");
        assert!(entry.is_dirty());
        assert!(entry.loaded_key().is_none());
        assert!(entry.is_snapshot_empty());
    }

    #[test]
    fn pre_flush_detects_replaced_elements() {
        let collection = CollectionRef::new(vec![Value::from(1)]);
        collection.post_action();
        let mut entry = CollectionEntry::detached(&collection);
        entry.pre_flush(&collection);
        assert!(!entry.is_dirty());

        collection.push(2).unwrap();
        entry.pre_flush(&collection);
        assert!(entry.is_dirty());
        assert!(!entry.reached);
    }

    #[test]
    fn post_flush_adopts_current_key() {
        let collection = CollectionRef::new(vec![Value::from(1)]);
        let mut entry = CollectionEntry::new_collection("Order.lines");
        entry.current_key = Some(Identifier::from(9));
        entry.post_flush(&collection);
        assert_eq!(entry.loaded_key(), Some(&Identifier::from(9)));
        assert_eq!(entry.role(), Some("Order.lines"));
        assert_eq!(entry.snapshot().map(<[Value]>::len), Some(1));
    }
}
