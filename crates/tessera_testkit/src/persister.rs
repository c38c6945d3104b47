//! Persisters over an [`InMemoryStore`].

use crate::store::{InMemoryStore, Operation};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tessera_core::{
    CacheAccessStrategy, CollectionMetadata, CollectionPersister, CoreError, CoreResult, EntityMetamodel,
    EntityPersister, Identifier, LockOptions, Row, StoredValue, Version,
};

/// Entity persister writing rows to an [`InMemoryStore`].
///
/// Versioned updates, deletes and locks compare the stored version with the
/// expected one and fail with a stale-state error on mismatch, like a
/// `where version = ?` clause that matched no row. Lazy properties are
/// left out of loaded rows and served by
/// [`EntityPersister::load_property`].
pub struct InMemoryEntityPersister {
    meta: EntityMetamodel,
    store: Arc<InMemoryStore>,
    cache: Option<Arc<dyn CacheAccessStrategy>>,
    sequence: AtomicI64,
}

impl InMemoryEntityPersister {
    /// Creates a persister without a cache region.
    #[must_use]
    pub fn new(meta: EntityMetamodel, store: Arc<InMemoryStore>) -> Self {
        Self {
            meta,
            store,
            cache: None,
            sequence: AtomicI64::new(0),
        }
    }

    /// Attaches a second-level cache region.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheAccessStrategy>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Starts the identifier sequence after `last`.
    #[must_use]
    pub fn with_sequence_after(self, last: i64) -> Self {
        self.sequence.store(last, Ordering::Relaxed);
        self
    }

    fn name(&self) -> &str {
        self.meta.name()
    }

    fn stale(&self, id: &Identifier) -> CoreError {
        CoreError::stale_state(self.name(), id.clone())
    }

    fn stored_version(&self, row: &Row) -> Option<Version> {
        let index = self.meta.version_metadata()?.index;
        row.get(index).and_then(StoredValue::as_version)
    }

    fn check_version(&self, id: &Identifier, row: &Row, expected: Option<Version>) -> CoreResult<()> {
        if self.meta.is_versioned() && self.stored_version(row) != expected {
            tracing::debug!(entity = self.name(), %id, stored = ?self.stored_version(row), ?expected, "version mismatch");
            return Err(self.stale(id));
        }
        Ok(())
    }

    /// Replaces lazy columns with the unfetched marker.
    fn select(&self, row: &Row) -> Row {
        row.iter()
            .zip(self.meta.properties())
            .map(|(value, property)| {
                if property.is_lazy() {
                    StoredValue::Unfetched
                } else {
                    value.clone()
                }
            })
            .collect()
    }

    /// Keeps the stored lazy columns a row does not carry.
    fn merge_unfetched(row: &Row, stored: Option<&Row>) -> Row {
        row.iter()
            .enumerate()
            .map(|(index, value)| match (value, stored.and_then(|s| s.get(index))) {
                (StoredValue::Unfetched, Some(previous)) => previous.clone(),
                (StoredValue::Unfetched, None) => StoredValue::Null,
                (value, _) => value.clone(),
            })
            .collect()
    }
}

impl EntityPersister for InMemoryEntityPersister {
    fn metamodel(&self) -> &EntityMetamodel {
        &self.meta
    }

    fn load(&self, id: &Identifier, lock: &LockOptions) -> CoreResult<Option<Row>> {
        self.store.with_tables(|t| {
            t.record(Operation::Load {
                entity: self.name().to_string(),
                id: id.clone(),
                lock: lock.lock_mode(),
            })?;
            Ok(t.table(self.name()).get(id).map(|row| self.select(row)))
        })
    }

    fn load_batch(&self, ids: &[Identifier], _lock: &LockOptions) -> CoreResult<Vec<(Identifier, Row)>> {
        self.store.with_tables(|t| {
            t.record(Operation::LoadBatch {
                entity: self.name().to_string(),
                ids: ids.to_vec(),
            })?;
            let table = t.table(self.name());
            Ok(ids
                .iter()
                .filter_map(|id| table.get(id).map(|row| (id.clone(), self.select(row))))
                .collect())
        })
    }

    fn load_property(&self, id: &Identifier, index: usize) -> CoreResult<StoredValue> {
        self.store.with_tables(|t| {
            t.record(Operation::LoadProperty {
                entity: self.name().to_string(),
                id: id.clone(),
                index,
            })?;
            let row = t.table(self.name()).get(id).ok_or_else(|| self.stale(id))?;
            Ok(row.get(index).cloned().unwrap_or(StoredValue::Null))
        })
    }

    fn insert(&self, id: &Identifier, row: &Row) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::Insert {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            let table = t.table(self.name());
            if table.contains_key(id) {
                return Err(CoreError::store(format!("duplicate key {}#{id}", self.name())));
            }
            table.insert(id.clone(), Self::merge_unfetched(row, None));
            Ok(())
        })
    }

    fn insert_generated(&self, row: &Row) -> CoreResult<Identifier> {
        self.store.with_tables(|t| {
            let next = t.identities.get(self.name()).copied().unwrap_or(0) + 1;
            let id = Identifier::from(next);
            t.record(Operation::Insert {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            t.identities.insert(self.name().to_string(), next);
            t.table(self.name()).insert(id.clone(), Self::merge_unfetched(row, None));
            Ok(id)
        })
    }

    fn update(
        &self,
        id: &Identifier,
        row: &Row,
        _dirty: Option<&[usize]>,
        previous_version: Option<Version>,
    ) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::Update {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            let table = t.table(self.name());
            let current = table.get(id).ok_or_else(|| self.stale(id))?;
            self.check_version(id, current, previous_version)?;
            let merged = Self::merge_unfetched(row, Some(current));
            table.insert(id.clone(), merged);
            Ok(())
        })
    }

    fn delete(&self, id: &Identifier, version: Option<Version>) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::Delete {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            let table = t.table(self.name());
            let current = table.get(id).ok_or_else(|| self.stale(id))?;
            self.check_version(id, current, version)?;
            table.remove(id);
            Ok(())
        })
    }

    fn lock(&self, id: &Identifier, version: Option<Version>, lock: &LockOptions) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::Lock {
                entity: self.name().to_string(),
                id: id.clone(),
                mode: lock.lock_mode(),
            })?;
            let current = t.table(self.name()).get(id).ok_or_else(|| self.stale(id))?;
            self.check_version(id, current, version)
        })
    }

    fn database_snapshot(&self, id: &Identifier) -> CoreResult<Option<Row>> {
        self.store.with_tables(|t| {
            t.record(Operation::Load {
                entity: self.name().to_string(),
                id: id.clone(),
                lock: tessera_core::LockMode::None,
            })?;
            Ok(t.table(self.name()).get(id).map(|row| self.select(row)))
        })
    }

    fn current_version(&self, id: &Identifier) -> CoreResult<Option<Version>> {
        self.store.with_tables(|t| {
            t.record(Operation::VersionCheck {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            Ok(t.table(self.name()).get(id).and_then(|row| self.stored_version(row)))
        })
    }

    fn force_version_increment(&self, id: &Identifier, current: Version) -> CoreResult<Version> {
        let metadata = self
            .meta
            .version_metadata()
            .ok_or_else(|| CoreError::mapping(format!("{} is not versioned", self.name())))?;
        self.store.with_tables(|t| {
            t.record(Operation::VersionIncrement {
                entity: self.name().to_string(),
                id: id.clone(),
            })?;
            let row = t.table(self.name()).get_mut(id).ok_or_else(|| self.stale(id))?;
            let stored = row.get(metadata.index).and_then(StoredValue::as_version);
            if stored != Some(current) {
                return Err(self.stale(id));
            }
            let next = metadata.ty.next(&current);
            row[metadata.index] = match next {
                Version::Integer(n) => StoredValue::Integer(n),
                Version::Timestamp(ms) => StoredValue::Timestamp(ms),
            };
            Ok(next)
        })
    }

    fn next_identifier(&self) -> CoreResult<Identifier> {
        Ok(Identifier::from(self.sequence.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn cache_access(&self) -> Option<Arc<dyn CacheAccessStrategy>> {
        self.cache.clone()
    }
}

impl fmt::Debug for InMemoryEntityPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEntityPersister")
            .field("entity", &self.name())
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Collection persister writing elements to an [`InMemoryStore`].
pub struct InMemoryCollectionPersister {
    metadata: CollectionMetadata,
    store: Arc<InMemoryStore>,
    cache: Option<Arc<dyn CacheAccessStrategy>>,
}

impl InMemoryCollectionPersister {
    /// Creates a persister without a cache region.
    #[must_use]
    pub fn new(metadata: CollectionMetadata, store: Arc<InMemoryStore>) -> Self {
        Self {
            metadata,
            store,
            cache: None,
        }
    }

    /// Attaches a second-level cache region.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheAccessStrategy>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn role_name(&self) -> String {
        self.metadata.role().to_string()
    }
}

impl CollectionPersister for InMemoryCollectionPersister {
    fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }

    fn load(&self, key: &Identifier) -> CoreResult<Vec<StoredValue>> {
        self.store.with_tables(|t| {
            t.record(Operation::CollectionLoad {
                role: self.role_name(),
                key: key.clone(),
            })?;
            Ok(t.collection(self.metadata.role()).get(key).cloned().unwrap_or_default())
        })
    }

    fn recreate(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::CollectionRecreate {
                role: self.role_name(),
                key: key.clone(),
            })?;
            t.collection(self.metadata.role()).insert(key.clone(), elements.to_vec());
            Ok(())
        })
    }

    fn remove(&self, key: &Identifier) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::CollectionRemove {
                role: self.role_name(),
                key: key.clone(),
            })?;
            t.collection(self.metadata.role()).remove(key);
            Ok(())
        })
    }

    fn delete_rows(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::CollectionDeleteRows {
                role: self.role_name(),
                key: key.clone(),
                count: elements.len(),
            })?;
            let stored = t.collection(self.metadata.role()).entry(key.clone()).or_default();
            for element in elements {
                if let Some(position) = stored.iter().position(|e| e == element) {
                    stored.remove(position);
                }
            }
            Ok(())
        })
    }

    fn insert_rows(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()> {
        self.store.with_tables(|t| {
            t.record(Operation::CollectionInsertRows {
                role: self.role_name(),
                key: key.clone(),
                count: elements.len(),
            })?;
            t.collection(self.metadata.role())
                .entry(key.clone())
                .or_default()
                .extend_from_slice(elements);
            Ok(())
        })
    }

    fn cache_access(&self) -> Option<Arc<dyn CacheAccessStrategy>> {
        self.cache.clone()
    }
}

impl fmt::Debug for InMemoryCollectionPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCollectionPersister")
            .field("role", &self.metadata.role())
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{PropertyMetadata, VersionType};

    fn document(store: &Arc<InMemoryStore>) -> InMemoryEntityPersister {
        let meta = EntityMetamodel::new("Doc")
            .property(PropertyMetadata::basic("title"))
            .property(PropertyMetadata::basic("body").lazy())
            .version(PropertyMetadata::basic("version"), VersionType::Integer);
        InMemoryEntityPersister::new(meta, Arc::clone(store))
    }

    fn row(title: &str, body: &str, version: i64) -> Row {
        vec![
            StoredValue::Text(title.into()),
            StoredValue::Text(body.into()),
            StoredValue::Integer(version),
        ]
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let persister = document(&store);
        let id = Identifier::from(1);
        store.put_row("Doc", 1, row("a", "text", 3));
        let err = persister
            .update(&id, &row("b", "text", 4), None, Some(Version::Integer(2)))
            .unwrap_err();
        assert!(err.is_optimistic_failure());
        persister
            .update(&id, &row("b", "text", 4), None, Some(Version::Integer(3)))
            .unwrap();
        assert_eq!(store.row("Doc", 1), Some(row("b", "text", 4)));
    }

    #[test]
    fn lazy_columns_are_left_out_and_kept() {
        let store = Arc::new(InMemoryStore::new());
        let persister = document(&store);
        let id = Identifier::from(1);
        store.put_row("Doc", 1, row("a", "long text", 0));
        let loaded = persister.load(&id, &LockOptions::none()).unwrap().unwrap();
        assert_eq!(loaded[1], StoredValue::Unfetched);
        assert_eq!(
            persister.load_property(&id, 1).unwrap(),
            StoredValue::Text("long text".into())
        );

        let mut changed = loaded;
        changed[0] = StoredValue::Text("b".into());
        changed[2] = StoredValue::Integer(1);
        persister.update(&id, &changed, None, Some(Version::Integer(0))).unwrap();
        assert_eq!(store.row("Doc", 1), Some(row("b", "long text", 1)));
    }

    #[test]
    fn forced_increment_bumps_stored_version() {
        let store = Arc::new(InMemoryStore::new());
        let persister = document(&store);
        let id = Identifier::from(1);
        store.put_row("Doc", 1, row("a", "x", 3));
        assert_eq!(
            persister.force_version_increment(&id, Version::Integer(3)).unwrap(),
            Version::Integer(4)
        );
        assert!(persister.force_version_increment(&id, Version::Integer(3)).is_err());
    }

    #[test]
    fn identity_inserts_number_rows() {
        let store = Arc::new(InMemoryStore::new());
        let persister = document(&store);
        let first = persister.insert_generated(&row("a", "x", 0)).unwrap();
        let second = persister.insert_generated(&row("b", "y", 0)).unwrap();
        assert_eq!(first, Identifier::from(1));
        assert_eq!(second, Identifier::from(2));
        assert_eq!(store.row_count("Doc"), 2);
    }

    #[test]
    fn collection_rows_are_edited_in_place() {
        use tessera_core::ElementType;
        let store = Arc::new(InMemoryStore::new());
        let persister = InMemoryCollectionPersister::new(
            CollectionMetadata::new("Doc.tags", "Doc", ElementType::Basic),
            Arc::clone(&store),
        );
        let key = Identifier::from(1);
        let tag = |s: &str| StoredValue::Text(s.into());
        persister.recreate(&key, &[tag("a"), tag("b")]).unwrap();
        persister.delete_rows(&key, &[tag("a")]).unwrap();
        persister.insert_rows(&key, &[tag("c")]).unwrap();
        assert_eq!(persister.load(&key).unwrap(), vec![tag("b"), tag("c")]);
        persister.remove(&key).unwrap();
        assert!(store.elements("Doc.tags", 1).is_empty());
    }
}
