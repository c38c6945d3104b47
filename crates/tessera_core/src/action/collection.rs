//! Collection recreate, update and remove actions.

use crate::cache::coordinator;
use crate::cache::CacheKey;
use crate::collection::CollectionRef;
use crate::engine::hydrate;
use crate::error::CoreResult;
use crate::persister::CollectionPersister;
use crate::session::Session;
use crate::types::Identifier;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

fn with_region<T>(
    session: &Session,
    persister: &Arc<dyn CollectionPersister>,
    key: &Identifier,
    work: impl FnOnce() -> CoreResult<T>,
) -> CoreResult<T> {
    let region = session.collection_region(persister.as_ref());
    let cache_key = CacheKey::new(persister.role(), key.clone());
    coordinator::with_soft_lock(region.as_ref(), &cache_key, None, || {
        let result = work()?;
        if let Some(region) = &region {
            region.evict(&cache_key)?;
        }
        Ok(result)
    })
}

/// Elements of `from` missing from `other`, counting duplicates.
fn difference(from: &[Value], other: &[Value]) -> Vec<Value> {
    let mut remaining: Vec<Option<&Value>> = other.iter().map(Some).collect();
    from.iter()
        .filter(|value| {
            match remaining.iter_mut().find(|slot| slot.map_or(false, |v| v == *value)) {
                Some(slot) => {
                    *slot = None;
                    false
                }
                None => true,
            }
        })
        .cloned()
        .collect()
}

/// Writes every element of a new (or re-owned) collection.
pub struct CollectionRecreateAction {
    collection: CollectionRef,
    key: Identifier,
    persister: Arc<dyn CollectionPersister>,
}

impl CollectionRecreateAction {
    pub(crate) fn new(collection: CollectionRef, key: Identifier, persister: Arc<dyn CollectionPersister>) -> Self {
        Self {
            collection,
            key,
            persister,
        }
    }

    /// Returns the collection.
    #[must_use]
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    /// Returns the owner key.
    #[must_use]
    pub fn key(&self) -> &Identifier {
        &self.key
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metadata().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let role = self.persister.role().to_string();
        let elements = hydrate::dehydrate_elements(&self.collection.loaded_elements(), &role)?;
        let persister = &self.persister;
        let key = &self.key;
        with_region(session, persister, key, || {
            if elements.is_empty() {
                Ok(())
            } else {
                persister.recreate(key, &elements)
            }
        })?;
        session.statistics().record_collection_recreate();
        tracing::trace!(role = %role, key = %self.key, elements = elements.len(), "collection recreated");
        Ok(())
    }
}

impl fmt::Debug for CollectionRecreateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionRecreateAction[{}#{}]", self.persister.role(), self.key)
    }
}

/// Writes the element changes of a dirty collection.
pub struct CollectionUpdateAction {
    collection: CollectionRef,
    key: Identifier,
    snapshot: Vec<Value>,
    persister: Arc<dyn CollectionPersister>,
}

impl CollectionUpdateAction {
    pub(crate) fn new(
        collection: CollectionRef,
        key: Identifier,
        snapshot: Vec<Value>,
        persister: Arc<dyn CollectionPersister>,
    ) -> Self {
        Self {
            collection,
            key,
            snapshot,
            persister,
        }
    }

    /// Returns the collection.
    #[must_use]
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    /// Returns the owner key.
    #[must_use]
    pub fn key(&self) -> &Identifier {
        &self.key
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metadata().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        if !self.collection.is_initialized() {
            return Ok(());
        }
        let role = self.persister.role().to_string();
        let current = self.collection.loaded_elements();
        let removed = hydrate::dehydrate_elements(&difference(&self.snapshot, &current), &role)?;
        let added = hydrate::dehydrate_elements(&difference(&current, &self.snapshot), &role)?;
        let had_rows = !self.snapshot.is_empty();
        let persister = &self.persister;
        let key = &self.key;
        with_region(session, persister, key, || {
            if current.is_empty() {
                if had_rows {
                    persister.remove(key)?;
                }
                return Ok(());
            }
            if !removed.is_empty() {
                persister.delete_rows(key, &removed)?;
            }
            if !added.is_empty() {
                persister.insert_rows(key, &added)?;
            }
            Ok(())
        })?;
        session.statistics().record_collection_update();
        tracing::trace!(
            role = %role,
            key = %self.key,
            removed = removed.len(),
            added = added.len(),
            "collection updated"
        );
        Ok(())
    }
}

impl fmt::Debug for CollectionUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionUpdateAction[{}#{}]", self.persister.role(), self.key)
    }
}

/// Deletes every stored element of a dereferenced collection.
pub struct CollectionRemoveAction {
    collection: Option<CollectionRef>,
    key: Identifier,
    empty_snapshot: bool,
    persister: Arc<dyn CollectionPersister>,
}

impl CollectionRemoveAction {
    pub(crate) fn new(
        collection: Option<CollectionRef>,
        key: Identifier,
        empty_snapshot: bool,
        persister: Arc<dyn CollectionPersister>,
    ) -> Self {
        Self {
            collection,
            key,
            empty_snapshot,
            persister,
        }
    }

    /// Returns the collection, if it is still in memory.
    #[must_use]
    pub fn collection(&self) -> Option<&CollectionRef> {
        self.collection.as_ref()
    }

    /// Returns the owner key the elements are stored under.
    #[must_use]
    pub fn key(&self) -> &Identifier {
        &self.key
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metadata().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let persister = &self.persister;
        let key = &self.key;
        let empty = self.empty_snapshot;
        with_region(session, persister, key, || if empty { Ok(()) } else { persister.remove(key) })?;
        session.statistics().record_collection_remove();
        tracing::trace!(role = persister.role(), key = %self.key, "collection removed");
        Ok(())
    }
}

impl fmt::Debug for CollectionRemoveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionRemoveAction[{}#{}]", self.persister.role(), self.key)
    }
}
