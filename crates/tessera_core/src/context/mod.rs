//! The persistence context: identity registry of one unit of work.
//!
//! The context maps entity keys to the single instance tracked for them,
//! keeps one [`EntityEntry`] per tracked instance and one
//! [`CollectionEntry`] per tracked collection, and remembers the lazy
//! placeholders handed out for keys that were not loaded yet.
//!
//! ## Invariants
//!
//! - At most one instance is tracked per [`EntityKey`].
//! - Every entry belongs to exactly one instance; instances are identified
//!   by handle, never by value.
//! - Iteration follows registration order, so flushes are deterministic.

mod batch;

pub use batch::BatchFetchQueue;

use crate::collection::{CollectionEntry, CollectionRef};
use crate::entity::{EntityEntry, EntityHandle, EntityRef, ProxyRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::persister::EntityPersister;
use crate::types::{CollectionKey, EntityKey, Identifier, InstanceId, SessionId, Version};
use crate::value::{Row, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct TrackedEntity {
    entity: EntityRef,
    entry: EntityEntry,
    seq: u64,
}

struct TrackedCollection {
    collection: CollectionRef,
    entry: CollectionEntry,
    seq: u64,
}

/// Identity registry of one unit of work.
pub struct PersistenceContext {
    session_id: SessionId,
    entities: HashMap<InstanceId, TrackedEntity>,
    entities_by_key: HashMap<EntityKey, EntityRef>,
    proxies_by_key: HashMap<EntityKey, ProxyRef>,
    collections: HashMap<InstanceId, TrackedCollection>,
    collections_by_key: HashMap<CollectionKey, CollectionRef>,
    /// Rows read straight from the store; `None` records that no row exists.
    entity_snapshots: HashMap<EntityKey, Option<Row>>,
    nullifiable_keys: HashSet<EntityKey>,
    batch_queue: BatchFetchQueue,
    cascade_level: usize,
    flushing: bool,
    default_read_only: bool,
    next_seq: u64,
}

impl PersistenceContext {
    /// Creates an empty context for a session.
    pub fn new(session_id: SessionId, default_read_only: bool) -> Self {
        Self {
            session_id,
            entities: HashMap::new(),
            entities_by_key: HashMap::new(),
            proxies_by_key: HashMap::new(),
            collections: HashMap::new(),
            collections_by_key: HashMap::new(),
            entity_snapshots: HashMap::new(),
            nullifiable_keys: HashSet::new(),
            batch_queue: BatchFetchQueue::new(),
            cascade_level: 0,
            flushing: false,
            default_read_only,
            next_seq: 0,
        }
    }

    /// Returns the owning session.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    // === Entities ===

    /// Registers an instance under its key and creates its entry.
    ///
    /// `from_reload` allows replacing the entry of an instance that is
    /// already tracked (refresh); otherwise only a `Saving` placeholder may
    /// be replaced.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonUniqueObject`] if another instance is tracked
    /// under `key`, or an assertion failure if the instance already has an
    /// entry that may not be replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entity(
        &mut self,
        entity: &EntityRef,
        status: Status,
        loaded_state: Option<Snapshot>,
        key: Option<EntityKey>,
        version: Option<Version>,
        lock_mode: LockMode,
        exists_in_database: bool,
        persister: Arc<dyn EntityPersister>,
        disable_version_increment: bool,
        from_reload: bool,
    ) -> CoreResult<&mut EntityEntry> {
        let instance_id = entity.instance_id();
        let existing_seq = match self.entities.get(&instance_id) {
            Some(tracked) if from_reload || tracked.entry.status() == Status::Saving => {
                Some(tracked.seq)
            }
            Some(tracked) => {
                return Err(CoreError::assertion_failure(format!(
                    "instance {entity:?} is already tracked with status {}",
                    tracked.entry.status()
                )));
            }
            None => None,
        };
        if let Some(key) = &key {
            self.check_uniqueness(key, entity)?;
            self.entities_by_key.insert(key.clone(), entity.clone());
        }
        let id = key
            .as_ref()
            .map(|k| k.identifier().clone())
            .or_else(|| entity.identifier());
        let entry = EntityEntry::new(
            status,
            loaded_state,
            id,
            version,
            lock_mode,
            exists_in_database,
            persister,
            disable_version_increment,
        );
        tracing::trace!(entity = ?entity, %status, from_reload, "entity registered");
        let seq = existing_seq.unwrap_or_else(|| self.bump_seq());
        let tracked = TrackedEntity {
            entity: entity.clone(),
            entry,
            seq,
        };
        let slot = match self.entities.entry(instance_id) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                occupied.insert(tracked);
                occupied.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(vacant) => vacant.insert(tracked),
        };
        Ok(&mut slot.entry)
    }

    /// Maps a key to an instance without creating an entry.
    ///
    /// Used while a row is being assembled, so that references back to the
    /// row being loaded resolve to the same instance, and once a
    /// store-generated identifier is known.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonUniqueObject`] if another instance holds the key.
    pub fn add_entity_key(&mut self, key: EntityKey, entity: &EntityRef) -> CoreResult<()> {
        self.check_uniqueness(&key, entity)?;
        if let Some(tracked) = self.entities.get_mut(&entity.instance_id()) {
            tracked.entry.set_id(key.identifier().clone());
        }
        self.entities_by_key.insert(key, entity.clone());
        Ok(())
    }

    /// Fails if a different instance is tracked under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonUniqueObject`] on conflict.
    pub fn check_uniqueness(&self, key: &EntityKey, entity: &EntityRef) -> CoreResult<()> {
        match self.entities_by_key.get(key) {
            Some(existing) if !existing.same_instance(entity) => {
                Err(CoreError::non_unique(key.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Returns the instance tracked under `key`.
    #[must_use]
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entities_by_key.get(key).cloned()
    }

    /// Returns true if an instance is tracked under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entities_by_key.contains_key(key)
    }

    /// Returns the entry of a tracked instance.
    #[must_use]
    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entities.get(&entity.instance_id()).map(|t| &t.entry)
    }

    pub(crate) fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entities
            .get_mut(&entity.instance_id())
            .map(|t| &mut t.entry)
    }

    /// Returns true if the instance has an entry.
    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entities.contains_key(&entity.instance_id())
    }

    /// Removes the instance tracked under `key` together with its entry.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let entity = self.entities_by_key.remove(key)?;
        self.entities.remove(&entity.instance_id());
        self.entity_snapshots.remove(key);
        self.nullifiable_keys.remove(key);
        self.batch_queue.remove_batch_loadable_entity_key(key);
        tracing::trace!(%key, "entity removed from context");
        Some(entity)
    }

    /// Removes the entry of an instance that has no key yet.
    pub(crate) fn remove_entry(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        self.entities
            .remove(&entity.instance_id())
            .map(|tracked| tracked.entry)
    }

    /// Returns every tracked instance in registration order.
    #[must_use]
    pub fn entities_in_order(&self) -> Vec<EntityRef> {
        let mut tracked: Vec<_> = self.entities.values().collect();
        tracked.sort_by_key(|t| t.seq);
        tracked.into_iter().map(|t| t.entity.clone()).collect()
    }

    /// Returns the number of tracked instances.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // === Proxies ===

    /// Returns the placeholder handed out for `key`.
    #[must_use]
    pub fn get_proxy(&self, key: &EntityKey) -> Option<ProxyRef> {
        self.proxies_by_key.get(key).cloned()
    }

    /// Remembers a placeholder for `key`.
    pub fn add_proxy(&mut self, key: EntityKey, proxy: ProxyRef) {
        self.proxies_by_key.insert(key, proxy);
    }

    /// Forgets the placeholder of `key`.
    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<ProxyRef> {
        self.proxies_by_key.remove(key)
    }

    /// Checks a placeholder against the requested key and binds its target.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WrongClass`] if the placeholder stands for a
    /// different entity.
    pub fn narrow_proxy(
        &mut self,
        proxy: &ProxyRef,
        key: &EntityKey,
        target: Option<&EntityRef>,
    ) -> CoreResult<EntityHandle> {
        if proxy.entity_name() != key.entity_name() {
            return Err(CoreError::WrongClass {
                id: key.identifier().clone(),
                expected: key.entity_name().to_string(),
                actual: proxy.entity_name().to_string(),
            });
        }
        if let Some(target) = target {
            proxy.set_implementation(target.clone());
        }
        Ok(EntityHandle::Proxy(proxy.clone()))
    }

    /// Returns the placeholder of `key` if one was handed out, bound to
    /// `entity`; otherwise the instance itself.
    pub fn proxy_for(&mut self, key: &EntityKey, entity: &EntityRef) -> EntityHandle {
        match self.proxies_by_key.get(key) {
            Some(proxy) => {
                proxy.set_implementation(entity.clone());
                EntityHandle::Proxy(proxy.clone())
            }
            None => EntityHandle::Entity(entity.clone()),
        }
    }

    /// Binds a detached placeholder to this context.
    ///
    /// # Errors
    ///
    /// Returns an error if the placeholder belongs to another open session.
    pub fn reassociate_proxy(&mut self, proxy: &ProxyRef) -> CoreResult<()> {
        match proxy.session_id() {
            Some(owner) if owner != self.session_id => Err(CoreError::invalid_operation(format!(
                "illegally attempted to associate proxy {proxy:?} with two open sessions"
            ))),
            _ => {
                proxy.set_session(Some(self.session_id));
                let key = EntityKey::new(proxy.identifier().clone(), proxy.entity_name());
                self.proxies_by_key.entry(key).or_insert_with(|| proxy.clone());
                Ok(())
            }
        }
    }

    // === Collections ===

    /// Tracks a collection created in this unit of work.
    pub fn add_new_collection(&mut self, collection: &CollectionRef, role: &str) {
        collection.attach(role, collection.key(), self.session_id);
        let entry = CollectionEntry::new_collection(role);
        self.track_collection(collection, entry);
    }

    /// Tracks a collection whose elements live in the store under `key`.
    pub fn add_uninitialized_collection(
        &mut self,
        collection: &CollectionRef,
        role: &str,
        key: Identifier,
    ) {
        collection.attach(role, Some(key.clone()), self.session_id);
        let entry = CollectionEntry::loaded(role, key.clone(), collection);
        self.collections_by_key
            .insert(CollectionKey::new(role, key), collection.clone());
        self.track_collection(collection, entry);
    }

    /// Tracks a collection that was loaded by another unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is attached to another open session.
    pub fn add_detached_collection(&mut self, collection: &CollectionRef) -> CoreResult<()> {
        if let Some(owner) = collection.session_id() {
            if owner != self.session_id {
                return Err(CoreError::invalid_operation(format!(
                    "illegal attempt to associate collection {collection:?} with two open sessions"
                )));
            }
        }
        let entry = CollectionEntry::detached(collection);
        if let (Some(role), Some(key)) = (collection.role(), collection.key()) {
            collection.attach(&role, Some(key.clone()), self.session_id);
            self.collections_by_key
                .insert(CollectionKey::new(role, key), collection.clone());
        }
        self.track_collection(collection, entry);
        Ok(())
    }

    fn track_collection(&mut self, collection: &CollectionRef, entry: CollectionEntry) {
        let seq = self.bump_seq();
        tracing::trace!(collection = ?collection, "collection registered");
        self.collections.insert(
            collection.instance_id(),
            TrackedCollection {
                collection: collection.clone(),
                entry,
                seq,
            },
        );
    }

    /// Returns the collection loaded under `key`.
    #[must_use]
    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections_by_key.get(key).cloned()
    }

    /// Returns the entry of a tracked collection.
    #[must_use]
    pub fn get_collection_entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collections
            .get(&collection.instance_id())
            .map(|t| &t.entry)
    }

    pub(crate) fn get_collection_entry_mut(
        &mut self,
        collection: &CollectionRef,
    ) -> Option<&mut CollectionEntry> {
        self.collections
            .get_mut(&collection.instance_id())
            .map(|t| &mut t.entry)
    }

    /// Stops tracking a collection.
    pub fn remove_collection(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        let tracked = self.collections.remove(&collection.instance_id())?;
        if let (Some(role), Some(key)) = (tracked.entry.role(), tracked.entry.loaded_key()) {
            let collection_key = CollectionKey::new(role, key.clone());
            if self
                .collections_by_key
                .get(&collection_key)
                .map_or(false, |c| c.same_instance(collection))
            {
                self.collections_by_key.remove(&collection_key);
            }
        }
        collection.unset_session();
        Some(tracked.entry)
    }

    /// Returns every tracked collection in registration order.
    #[must_use]
    pub fn collections_in_order(&self) -> Vec<CollectionRef> {
        let mut tracked: Vec<_> = self.collections.values().collect();
        tracked.sort_by_key(|t| t.seq);
        tracked.into_iter().map(|t| t.collection.clone()).collect()
    }

    /// Returns the number of tracked collections.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    // === Store snapshots ===

    /// Returns the current store row of an entity, reading it at most once
    /// per unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the persister fails.
    pub fn get_database_snapshot(
        &mut self,
        persister: &dyn EntityPersister,
        id: &Identifier,
    ) -> CoreResult<Option<Row>> {
        let key = EntityKey::new(id.clone(), persister.entity_name())
            .with_mode(persister.metamodel().entity_mode());
        if let Some(cached) = self.entity_snapshots.get(&key) {
            return Ok(cached.clone());
        }
        let snapshot = persister.database_snapshot(id)?;
        self.entity_snapshots.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    /// Returns the cached store row, `Some(None)` if the row is known to be
    /// missing, `None` if the store was never asked.
    #[must_use]
    pub fn get_cached_database_snapshot(&self, key: &EntityKey) -> Option<Option<&Row>> {
        self.entity_snapshots.get(key).map(Option::as_ref)
    }

    // === Flush bookkeeping ===

    /// Keys whose references must be written as null.
    #[must_use]
    pub fn nullifiable_keys(&self) -> &HashSet<EntityKey> {
        &self.nullifiable_keys
    }

    pub(crate) fn register_nullifiable(&mut self, key: EntityKey) {
        self.nullifiable_keys.insert(key);
    }

    /// Returns the batch-fetch queue.
    #[must_use]
    pub fn batch_queue(&self) -> &BatchFetchQueue {
        &self.batch_queue
    }

    pub(crate) fn batch_queue_mut(&mut self) -> &mut BatchFetchQueue {
        &mut self.batch_queue
    }

    /// Returns the nesting depth of the cascade in progress.
    #[must_use]
    pub const fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub(crate) fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    pub(crate) fn decrement_cascade_level(&mut self) -> usize {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    /// Returns true while a flush executes.
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub(crate) fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Cleans up after a successful flush.
    ///
    /// Rows deleted by the flush leave the registry, collections adopt the
    /// role and key they were flushed under, and dereferenced collections
    /// are forgotten.
    pub(crate) fn post_flush(&mut self) {
        let gone: Vec<EntityRef> = self
            .entities
            .values()
            .filter(|t| t.entry.status() == Status::Gone)
            .map(|t| t.entity.clone())
            .collect();
        for entity in gone {
            let key = self
                .get_entry(&entity)
                .and_then(EntityEntry::entity_key);
            match key {
                Some(key) => {
                    self.remove_entity(&key);
                    self.proxies_by_key.remove(&key);
                }
                None => {
                    self.remove_entry(&entity);
                }
            }
        }
        self.nullifiable_keys.clear();
        self.entity_snapshots.clear();

        self.collections_by_key.clear();
        let mut dereferenced = Vec::new();
        for tracked in self.collections.values_mut() {
            tracked.entry.post_flush(&tracked.collection);
            match (tracked.entry.role(), tracked.entry.loaded_key()) {
                (Some(role), Some(key)) => {
                    self.collections_by_key.insert(
                        CollectionKey::new(role, key.clone()),
                        tracked.collection.clone(),
                    );
                }
                (None, _) => dereferenced.push(tracked.collection.clone()),
                (Some(_), None) => {}
            }
        }
        for collection in dereferenced {
            self.collections.remove(&collection.instance_id());
            collection.unset_session();
        }
        for tracked in self.entities.values() {
            tracked.entity.clear_written();
        }
    }

    // === Read-only mode ===

    /// Returns true if loaded instances start out read-only.
    #[must_use]
    pub const fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Sets whether loaded instances start out read-only.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Returns true if a tracked instance is read-only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransientObject`] if the instance is not tracked.
    pub fn is_read_only(&self, entity: &EntityRef) -> CoreResult<bool> {
        self.get_entry(entity)
            .map(EntityEntry::is_read_only)
            .ok_or_else(|| {
                CoreError::transient_object(format!(
                    "instance {entity:?} is not associated with the session"
                ))
            })
    }

    /// Switches an instance (or a placeholder and its target) between
    /// read-only and modifiable.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not tracked or cannot change mode.
    pub fn set_read_only(&mut self, handle: &EntityHandle, read_only: bool) -> CoreResult<()> {
        let entity = match handle {
            EntityHandle::Entity(entity) => entity.clone(),
            EntityHandle::Proxy(proxy) => {
                proxy.set_read_only(read_only);
                match proxy.target() {
                    Some(target) => target,
                    None => return Ok(()),
                }
            }
        };
        let entry = self.get_entry_mut(&entity).ok_or_else(|| {
            CoreError::transient_object(format!(
                "instance {entity:?} is not associated with the session"
            ))
        })?;
        entry.set_read_only(read_only, &entity)
    }

    // === Lifecycle ===

    /// Downgrades every held lock once the transaction ended.
    pub(crate) fn after_transaction_completion(&mut self) {
        for tracked in self.entities.values_mut() {
            tracked.entry.set_lock_mode(LockMode::None);
        }
    }

    /// Forgets everything and detaches placeholders and collections.
    pub fn clear(&mut self) {
        for proxy in self.proxies_by_key.values() {
            proxy.set_session(None);
        }
        for tracked in self.collections.values() {
            tracked.collection.unset_session();
        }
        self.entities.clear();
        self.entities_by_key.clear();
        self.proxies_by_key.clear();
        self.collections.clear();
        self.collections_by_key.clear();
        self.entity_snapshots.clear();
        self.nullifiable_keys.clear();
        self.batch_queue.clear();
        self.cascade_level = 0;
        self.flushing = false;
        tracing::debug!(session = %self.session_id, "persistence context cleared");
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("session", &self.session_id)
            .field("entities", &self.entities.len())
            .field("proxies", &self.proxies_by_key.len())
            .field("collections", &self.collections.len())
            .field("cascade_level", &self.cascade_level)
            .finish()
    }
}
