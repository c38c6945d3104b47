//! Persister contracts.
//!
//! Persisters own all store I/O. The engine hands them dehydrated rows
//! ([`Row`]) in which entity references are identifiers, and never sees how
//! rows are written. Implementations must be thread-safe: one persister is
//! shared by every unit of work of a factory.

use crate::cache::CacheAccessStrategy;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockOptions;
use crate::metadata::EntityMetamodel;
use crate::types::{Identifier, Version};
use crate::value::{Row, StoredValue};
use std::sync::Arc;

/// Store access for one entity.
pub trait EntityPersister: Send + Sync {
    /// Returns the mapping of the entity.
    fn metamodel(&self) -> &EntityMetamodel;

    /// Returns the entity name.
    fn entity_name(&self) -> &str {
        self.metamodel().name()
    }

    /// Loads a row, acquiring the requested lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the lock cannot be acquired.
    fn load(&self, id: &Identifier, lock: &LockOptions) -> CoreResult<Option<Row>>;

    /// Loads several rows in one round trip; missing rows are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn load_batch(
        &self,
        ids: &[Identifier],
        lock: &LockOptions,
    ) -> CoreResult<Vec<(Identifier, Row)>> {
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load(id, lock)? {
                rows.push((id.clone(), row));
            }
        }
        Ok(rows)
    }

    /// Loads one lazy property.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is gone or lazy loading is unsupported.
    fn load_property(&self, id: &Identifier, index: usize) -> CoreResult<StoredValue> {
        let _ = (id, index);
        Err(CoreError::mapping(format!(
            "{} does not support lazy properties",
            self.entity_name()
        )))
    }

    /// Inserts a row under a known identifier.
    ///
    /// # Errors
    ///
    /// Returns an error on constraint violations or store failures.
    fn insert(&self, id: &Identifier, row: &Row) -> CoreResult<()>;

    /// Inserts a row and returns the identifier the store generated.
    ///
    /// # Errors
    ///
    /// Returns an error on constraint violations or store failures.
    fn insert_generated(&self, row: &Row) -> CoreResult<Identifier> {
        let _ = row;
        Err(CoreError::mapping(format!(
            "{} does not support store-generated identifiers",
            self.entity_name()
        )))
    }

    /// Updates a row.
    ///
    /// `dirty` lists the changed properties when known; `previous_version`
    /// is checked for versioned entities.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleObjectState`] if the stored version differs
    /// or the row is gone.
    fn update(
        &self,
        id: &Identifier,
        row: &Row,
        dirty: Option<&[usize]>,
        previous_version: Option<Version>,
    ) -> CoreResult<()>;

    /// Deletes a row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleObjectState`] if the stored version differs
    /// or the row is gone.
    fn delete(&self, id: &Identifier, version: Option<Version>) -> CoreResult<()>;

    /// Acquires a lock on a row, checking its version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleObjectState`] on a version mismatch.
    fn lock(&self, id: &Identifier, version: Option<Version>, lock: &LockOptions)
        -> CoreResult<()>;

    /// Reads the current row bypassing every cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn database_snapshot(&self, id: &Identifier) -> CoreResult<Option<Row>>;

    /// Reads the current version of a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn current_version(&self, id: &Identifier) -> CoreResult<Option<Version>>;

    /// Increments the version of a row and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleObjectState`] if `current` is outdated.
    fn force_version_increment(&self, id: &Identifier, current: Version) -> CoreResult<Version>;

    /// Returns the next identifier for sequence-generated entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence cannot be advanced.
    fn next_identifier(&self) -> CoreResult<Identifier>;

    /// Returns the second-level cache region of the entity, if cached.
    fn cache_access(&self) -> Option<Arc<dyn CacheAccessStrategy>> {
        None
    }
}

/// Element type of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    /// Scalar elements.
    Basic,
    /// References to entities.
    Entity(String),
}

/// Mapping of a collection role.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    role: String,
    owner: String,
    element: ElementType,
    versionable: bool,
    mutable: bool,
    spaces: Vec<String>,
}

impl CollectionMetadata {
    /// Creates a mutable, versionable collection mapping.
    pub fn new(role: impl Into<String>, owner: impl Into<String>, element: ElementType) -> Self {
        let role = role.into();
        Self {
            spaces: vec![role.clone()],
            role,
            owner: owner.into(),
            element,
            versionable: true,
            mutable: true,
        }
    }

    /// Changes to the collection do not bump the owner's version.
    #[must_use]
    pub fn excluded_from_versioning(mut self) -> Self {
        self.versionable = false;
        self
    }

    /// Marks the collection immutable.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Returns the role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the owning entity name.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the element type.
    #[must_use]
    pub fn element(&self) -> &ElementType {
        &self.element
    }

    /// Returns true if a dirty collection bumps the owner's version.
    #[must_use]
    pub const fn is_versionable(&self) -> bool {
        self.versionable
    }

    /// Returns true if the collection may change.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Returns the query spaces (tables) the collection lives in.
    #[must_use]
    pub fn spaces(&self) -> &[String] {
        &self.spaces
    }
}

/// Store access for one collection role.
pub trait CollectionPersister: Send + Sync {
    /// Returns the mapping of the role.
    fn metadata(&self) -> &CollectionMetadata;

    /// Returns the role.
    fn role(&self) -> &str {
        self.metadata().role()
    }

    /// Loads the elements owned by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn load(&self, key: &Identifier) -> CoreResult<Vec<StoredValue>>;

    /// Writes all elements of a new collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn recreate(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()>;

    /// Removes every element owned by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn remove(&self, key: &Identifier) -> CoreResult<()>;

    /// Deletes individual element rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn delete_rows(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()>;

    /// Inserts individual element rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn insert_rows(&self, key: &Identifier, elements: &[StoredValue]) -> CoreResult<()>;

    /// Returns the second-level cache region of the role, if cached.
    fn cache_access(&self) -> Option<Arc<dyn CacheAccessStrategy>> {
        None
    }
}
