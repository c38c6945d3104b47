//! The unit of work.
//!
//! A [`Session`] owns one persistence context and one action queue. Every
//! public operation is turned into an event, handed to the factory's
//! listeners and, once the cascade returns to the top, checked for inserts
//! still waiting on unsaved references.
//!
//! Sessions are single-threaded: tracked instances are reference counted
//! without atomics, so a session can never cross threads. The
//! [`CancellationHandle`] is the only piece that may.

mod factory;

pub use factory::{SessionFactory, SessionFactoryBuilder};

use crate::action::ActionQueue;
use crate::cache::{coordinator, CacheAccessStrategy, CacheEntry, CacheKey};
use crate::collection::CollectionRef;
use crate::config::{CacheMode, FlushMode, Settings};
use crate::context::PersistenceContext;
use crate::engine::hydrate;
use crate::entity::{EntityHandle, EntityRef, ProxyRef};
use crate::error::{CoreError, CoreResult};
use crate::event::{
    self, AutoFlushEvent, DeleteEvent, DirtyCheckEvent, EvictEvent, FlushEntityEvent, FlushEvent,
    FlushReport, LoadEvent, LoadType, LockEvent, MergeEvent, OperationContext, PersistEvent,
    RefreshEvent, SaveKind, SaveOrUpdateEvent,
};
use crate::interceptor::Interceptor;
use crate::lock::LockOptions;
use crate::metadata::{EntityMetamodel, PropertyType};
use crate::persister::{CollectionPersister, EntityPersister};
use crate::stats::Statistics;
use crate::types::{Identifier, SessionId};
use crate::value::{Snapshot, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe handle that asks a session to stop at its next store round
/// trip.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Requests cancellation of the running operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if a cancellation is pending.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.cancelled.swap(false, Ordering::SeqCst)
    }
}

/// A unit of work.
///
/// # Example
///
/// ```rust,ignore
/// let mut session = factory.open_session();
/// let order = session.get("Order", Identifier::from(1))?.expect("order 1");
/// order.set(0, "shipped");
/// session.flush()?;
/// session.close();
/// ```
pub struct Session {
    id: SessionId,
    factory: SessionFactory,
    interceptor: Arc<dyn Interceptor>,
    context: PersistenceContext,
    action_queue: ActionQueue,
    flush_mode: FlushMode,
    cache_mode: CacheMode,
    cancellation: CancellationHandle,
    timestamp: i64,
    is_open: bool,
}

impl Session {
    pub(crate) fn open(factory: SessionFactory, interceptor: Arc<dyn Interceptor>) -> Self {
        let id = SessionId::next();
        let settings = factory.settings();
        let session = Self {
            id,
            context: PersistenceContext::new(id, settings.default_read_only),
            action_queue: ActionQueue::new(),
            flush_mode: settings.default_flush_mode,
            cache_mode: settings.default_cache_mode,
            cancellation: CancellationHandle::default(),
            timestamp: now_millis(),
            is_open: true,
            interceptor,
            factory,
        };
        session.statistics().record_session_open();
        tracing::debug!(session = %id, "session opened");
        session
    }

    // === Accessors ===

    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the factory that opened this session.
    #[must_use]
    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// Returns the factory settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        self.factory.settings()
    }

    /// Returns the factory statistics.
    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        self.factory.statistics()
    }

    /// Returns the interceptor of this session.
    #[must_use]
    pub fn interceptor(&self) -> Arc<dyn Interceptor> {
        Arc::clone(&self.interceptor)
    }

    /// Returns the identity registry.
    #[must_use]
    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    /// Returns the pending writes.
    #[must_use]
    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    pub(crate) fn action_queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.action_queue
    }

    /// Returns the flush mode.
    #[must_use]
    pub const fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Sets the flush mode.
    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    /// Returns the cache mode.
    #[must_use]
    pub const fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    /// Sets the cache mode.
    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.cache_mode = mode;
    }

    /// Returns the time the session was opened, in milliseconds since the
    /// epoch. Cache entries newer than this are not visible to the session.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns a handle that cancels the running operation.
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Fails with [`CoreError::Cancelled`] if cancellation was requested,
    /// consuming the request.
    pub(crate) fn check_cancelled(&self) -> CoreResult<()> {
        if self.cancellation.take() {
            tracing::debug!(session = %self.id, "operation cancelled");
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    // === Mapping lookups ===

    pub(crate) fn entity_persister(&self, entity_name: &str) -> CoreResult<Arc<dyn EntityPersister>> {
        self.factory.entity_persister(entity_name)
    }

    pub(crate) fn collection_persister(&self, role: &str) -> CoreResult<Arc<dyn CollectionPersister>> {
        self.factory.collection_persister(role)
    }

    /// Returns the persisters of every collection role an entity owns.
    pub(crate) fn owned_collection_persisters(
        &self,
        meta: &EntityMetamodel,
    ) -> CoreResult<Vec<Arc<dyn CollectionPersister>>> {
        meta.properties()
            .iter()
            .filter_map(|property| match property.ty() {
                PropertyType::Collection { role } => Some(self.collection_persister(role)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn entity_region(&self, persister: &dyn EntityPersister) -> Option<Arc<dyn CacheAccessStrategy>> {
        if self.settings().use_second_level_cache {
            persister.cache_access()
        } else {
            None
        }
    }

    pub(crate) fn collection_region(
        &self,
        persister: &dyn CollectionPersister,
    ) -> Option<Arc<dyn CacheAccessStrategy>> {
        if self.settings().use_second_level_cache {
            persister.cache_access()
        } else {
            None
        }
    }

    // === Lifecycle ===

    /// Returns true until [`Session::close`] is called.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.is_open
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(CoreError::SessionClosed)
        }
    }

    /// Closes the session, detaching every tracked instance, placeholder and
    /// collection. Pending writes are discarded.
    pub fn close(&mut self) {
        if !self.is_open {
            return;
        }
        if self.action_queue.has_any_queued_actions() {
            tracing::debug!(session = %self.id, "closing with unflushed actions");
        }
        self.context.clear();
        self.action_queue.clear();
        self.is_open = false;
        self.statistics().record_session_close();
        tracing::debug!(session = %self.id, "session closed");
    }

    /// Detaches everything and discards pending writes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SessionClosed`] if the session is closed.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        self.context.clear();
        self.action_queue.clear();
        Ok(())
    }

    /// Returns true if `entity` is tracked and not scheduled for deletion.
    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.context
            .get_entry(entity)
            .map_or(false, |entry| !entry.status().is_deleted_or_gone())
    }

    /// Runs one top-level operation.
    fn top_level<T>(
        &mut self,
        ctx: &mut OperationContext,
        operation: impl FnOnce(&mut Self, &mut OperationContext) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        let result = operation(self, ctx)?;
        if self.context.cascade_level() == 0 {
            self.action_queue.check_no_unresolved_actions_after_operation()?;
        }
        Ok(result)
    }

    // === Save, update, persist ===

    fn save_or_update_event(&mut self, mut event: SaveOrUpdateEvent) -> CoreResult<Option<Identifier>> {
        let mut ctx = OperationContext::new();
        self.top_level(&mut ctx, |session, ctx| {
            ctx.mark_visited(&event.entity);
            session.fire_save_or_update(&mut event, ctx)?;
            Ok(event.result_id.take())
        })
    }

    /// Makes a new instance persistent and returns its identifier.
    ///
    /// # Errors
    ///
    /// Fails if the instance is scheduled for deletion, if an identifier
    /// cannot be obtained, or if a non-nullable reference is still unsaved
    /// once the cascade completes.
    pub fn save(&mut self, entity: &EntityRef) -> CoreResult<Identifier> {
        let id = self.save_or_update_event(SaveOrUpdateEvent::new(entity.clone(), SaveKind::Save))?;
        id.ok_or_else(|| CoreError::assertion_failure(format!("save of {entity:?} produced no identifier")))
    }

    /// Saves a new instance under the given identifier.
    ///
    /// # Errors
    ///
    /// See [`Session::save`].
    pub fn save_with_id(&mut self, entity: &EntityRef, id: Identifier) -> CoreResult<Identifier> {
        let mut event = SaveOrUpdateEvent::new(entity.clone(), SaveKind::Save);
        event.requested_id = Some(id);
        let id = self.save_or_update_event(event)?;
        id.ok_or_else(|| CoreError::assertion_failure(format!("save of {entity:?} produced no identifier")))
    }

    /// Reattaches a detached instance; its state is written at the next
    /// flush.
    ///
    /// # Errors
    ///
    /// Fails for unsaved instances unless `lenient_update` is set, and for
    /// instances scheduled for deletion.
    pub fn update(&mut self, entity: &EntityRef) -> CoreResult<()> {
        self.save_or_update_event(SaveOrUpdateEvent::new(entity.clone(), SaveKind::Update))
            .map(|_| ())
    }

    /// Saves an unsaved instance or reattaches a detached one.
    ///
    /// # Errors
    ///
    /// See [`Session::save`] and [`Session::update`].
    pub fn save_or_update(&mut self, entity: &EntityRef) -> CoreResult<()> {
        self.save_or_update_event(SaveOrUpdateEvent::new(entity.clone(), SaveKind::SaveOrUpdate))
            .map(|_| ())
    }

    /// Makes a new instance persistent without returning its identifier.
    ///
    /// # Errors
    ///
    /// Fails for detached instances and instances scheduled for deletion.
    pub fn persist(&mut self, entity: &EntityRef) -> CoreResult<()> {
        let mut event = PersistEvent {
            entity: entity.clone(),
            on_flush: false,
        };
        let mut ctx = OperationContext::new();
        self.top_level(&mut ctx, |session, ctx| {
            ctx.mark_visited(&event.entity);
            session.fire_persist(&mut event, ctx)
        })
    }

    // === Delete, merge ===

    /// Schedules an instance (or the instance behind a placeholder) for
    /// deletion.
    ///
    /// # Errors
    ///
    /// Fails if the instance cannot be resolved or a cascade fails.
    pub fn delete(&mut self, entity: impl Into<EntityHandle>) -> CoreResult<()> {
        let mut event = DeleteEvent {
            entity: entity.into(),
            orphan_removal: false,
        };
        let mut ctx = OperationContext::new();
        self.top_level(&mut ctx, |session, ctx| {
            if let Some(entity) = event.entity.peek_implementation() {
                ctx.mark_visited(&entity);
            }
            session.fire_delete(&mut event, ctx)
        })
    }

    /// Copies the state of `entity` onto the managed instance with the same
    /// identity and returns that instance.
    ///
    /// `entity` itself is never attached. Unsaved instances in the graph get
    /// new managed copies.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StaleObjectState`] if a versioned detached
    /// instance is out of date, and with [`CoreError::TransientObjects`] if
    /// copies are still waiting on unsaved references after the retries.
    pub fn merge(&mut self, entity: &EntityRef) -> CoreResult<EntityRef> {
        let mut event = MergeEvent::new(entity.clone());
        let mut ctx = OperationContext::new();
        self.top_level(&mut ctx, |session, ctx| {
            session.fire_merge(&mut event, ctx)?;
            event::resolve_transient_copies(session, ctx)?;
            event
                .result
                .take()
                .ok_or_else(|| CoreError::assertion_failure(format!("merge of {entity:?} produced no copy")))
        })
    }

    // === Refresh, lock, evict ===

    /// Re-reads an instance from the store, discarding unflushed changes.
    ///
    /// # Errors
    ///
    /// Fails if the instance is unsaved, scheduled for deletion, or its row
    /// no longer exists.
    pub fn refresh(&mut self, entity: &EntityRef) -> CoreResult<()> {
        self.refresh_with_lock(entity, LockOptions::none())
    }

    /// Re-reads an instance while acquiring a lock.
    ///
    /// # Errors
    ///
    /// See [`Session::refresh`].
    pub fn refresh_with_lock(&mut self, entity: &EntityRef, lock_options: LockOptions) -> CoreResult<()> {
        let mut event = RefreshEvent {
            entity: entity.clone(),
            lock_options: lock_options.clone(),
        };
        let mut ctx = OperationContext::with_lock_options(lock_options);
        self.top_level(&mut ctx, |session, ctx| {
            ctx.mark_visited(&event.entity);
            session.fire_refresh(&mut event, ctx)
        })
    }

    /// Acquires a lock on an instance, reattaching it unmodified if it is
    /// detached.
    ///
    /// # Errors
    ///
    /// Fails for unsaved or deleted instances, for `Write` requests and for
    /// optimistic modes on unversioned entities.
    pub fn lock(&mut self, entity: &EntityRef, lock_options: LockOptions) -> CoreResult<()> {
        let mut event = LockEvent {
            entity: entity.clone(),
            lock_options: lock_options.clone(),
        };
        let mut ctx = OperationContext::with_lock_options(lock_options);
        self.top_level(&mut ctx, |session, ctx| {
            ctx.mark_visited(&event.entity);
            session.fire_lock(&mut event, ctx)
        })
    }

    /// Stops tracking an instance or placeholder. Unflushed changes to it
    /// are not written.
    ///
    /// # Errors
    ///
    /// Fails if a cascade fails.
    pub fn evict(&mut self, entity: impl Into<EntityHandle>) -> CoreResult<()> {
        let mut event = EvictEvent { entity: entity.into() };
        let mut ctx = OperationContext::new();
        self.top_level(&mut ctx, |session, ctx| {
            if let Some(entity) = event.entity.peek_implementation() {
                ctx.mark_visited(&entity);
            }
            session.fire_evict(&mut event, ctx)
        })
    }

    /// Sets whether an instance (or placeholder) is read-only.
    ///
    /// # Errors
    ///
    /// Fails if the instance is not tracked.
    pub fn set_read_only(&mut self, entity: impl Into<EntityHandle>, read_only: bool) -> CoreResult<()> {
        self.ensure_open()?;
        self.context.set_read_only(&entity.into(), read_only)
    }

    /// Returns true if a tracked instance is read-only.
    ///
    /// # Errors
    ///
    /// Fails if the instance is not tracked.
    pub fn is_read_only(&self, entity: &EntityRef) -> CoreResult<bool> {
        self.ensure_open()?;
        self.context.is_read_only(entity)
    }

    /// Sets whether instances loaded from now on start out read-only.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    // === Loading ===

    /// Returns the instance with the given identifier, or `None` if no row
    /// exists or the instance is scheduled for deletion.
    ///
    /// # Errors
    ///
    /// Fails if the entity is not mapped or the store fails.
    pub fn get(&mut self, entity_name: &str, id: impl Into<Identifier>) -> CoreResult<Option<EntityRef>> {
        self.get_with_lock(entity_name, id, LockOptions::none())
    }

    /// Like [`Session::get`], acquiring a lock.
    ///
    /// # Errors
    ///
    /// See [`Session::get`].
    pub fn get_with_lock(
        &mut self,
        entity_name: &str,
        id: impl Into<Identifier>,
        lock_options: LockOptions,
    ) -> CoreResult<Option<EntityRef>> {
        self.ensure_open()?;
        let mut event = LoadEvent::new(entity_name, id.into(), LoadType::Get).with_lock(lock_options);
        self.fire_load(&mut event)?;
        match event.result {
            None => Ok(None),
            Some(EntityHandle::Entity(entity)) => Ok(Some(entity)),
            Some(EntityHandle::Proxy(proxy)) => match proxy.target() {
                Some(target) => Ok(Some(target)),
                None => self.initialize_proxy(&proxy).map(Some),
            },
        }
    }

    /// Returns the instance with the given identifier, or a placeholder if
    /// the entity allows them. A placeholder fails on initialization if the
    /// row does not exist.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::ObjectNotFound`] if the row was read and does
    /// not exist.
    pub fn load(&mut self, entity_name: &str, id: impl Into<Identifier>) -> CoreResult<EntityHandle> {
        self.ensure_open()?;
        let id = id.into();
        let mut event = LoadEvent::new(entity_name, id.clone(), LoadType::Load);
        self.fire_load(&mut event)?;
        event
            .result
            .ok_or_else(|| CoreError::not_found(entity_name, id))
    }

    /// Resolves an association target.
    pub(crate) fn internal_load(
        &mut self,
        entity_name: &str,
        id: Identifier,
        eager: bool,
        nullable: bool,
    ) -> CoreResult<Option<EntityHandle>> {
        let load_type = match (eager, nullable) {
            (_, true) => LoadType::InternalLoadNullable,
            (true, false) => LoadType::InternalLoadEager,
            (false, false) => LoadType::InternalLoadLazy,
        };
        let mut event = LoadEvent::new(entity_name, id, load_type);
        self.fire_load(&mut event)?;
        Ok(event.result)
    }

    /// Loads the instance behind a placeholder handed out by this session.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::LazyInitialization`] if the placeholder
    /// belongs to no session or another one, or this session is closed, and
    /// with [`CoreError::ObjectNotFound`] if the row does not exist.
    pub fn initialize_proxy(&mut self, proxy: &ProxyRef) -> CoreResult<EntityRef> {
        if let Some(target) = proxy.target() {
            return Ok(target);
        }
        let what = format!("{}#{}", proxy.entity_name(), proxy.identifier());
        if !self.is_open {
            return Err(CoreError::lazy_initialization(what, "the session was closed"));
        }
        if proxy.session_id() != Some(self.id) {
            return Err(CoreError::lazy_initialization(what, "no session or not owned by this session"));
        }
        tracing::trace!(proxy = %what, "initializing placeholder");
        let mut event = LoadEvent::new(proxy.entity_name(), proxy.identifier().clone(), LoadType::ImmediateLoad);
        self.fire_load(&mut event)?;
        let target = match event.result {
            Some(EntityHandle::Entity(entity)) => entity,
            Some(EntityHandle::Proxy(_)) | None => proxy
                .target()
                .ok_or_else(|| CoreError::not_found(proxy.entity_name(), proxy.identifier().clone()))?,
        };
        proxy.set_implementation(target.clone());
        Ok(target)
    }

    /// Loads the elements of a lazy collection owned by this session.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::LazyInitialization`] if the collection is
    /// not attached to this open session.
    pub fn initialize_collection(&mut self, collection: &CollectionRef) -> CoreResult<()> {
        if collection.is_initialized() {
            return Ok(());
        }
        let what = format!("collection {collection:?}");
        if !self.is_open {
            return Err(CoreError::lazy_initialization(what, "the session was closed"));
        }
        if collection.session_id() != Some(self.id) || self.context.get_collection_entry(collection).is_none() {
            return Err(CoreError::lazy_initialization(what, "no session or not owned by this session"));
        }
        let (Some(role), Some(key)) = (collection.role(), collection.key()) else {
            return Err(CoreError::assertion_failure(format!("{what} has no role or key")));
        };
        let persister = self.collection_persister(&role)?;
        let region = self.collection_region(persister.as_ref());
        let cache_key = CacheKey::new(role.as_str(), key.clone());

        let mut stored = None;
        if self.cache_mode.is_get_enabled() {
            if let Some(region) = &region {
                stored = coordinator::get(region, &cache_key, self.timestamp, self.statistics())?
                    .filter(|entry| entry.name == role)
                    .map(|entry| entry.state);
            }
        }
        let stored = match stored {
            Some(stored) => stored,
            None => {
                self.check_cancelled()?;
                let stored = persister.load(&key)?;
                self.statistics().record_collection_load();
                if self.cache_mode.is_put_enabled() {
                    if let Some(region) = &region {
                        let entry = CacheEntry {
                            name: role.clone(),
                            state: stored.clone(),
                            version: None,
                        };
                        coordinator::put_from_load(region, &cache_key, entry, self.timestamp, self.statistics())?;
                    }
                }
                stored
            }
        };
        let elements = hydrate::assemble_elements(self, &stored, persister.metadata().element(), &role)?;
        collection.initialize_with(elements);
        if let Some(entry) = self.context.get_collection_entry_mut(collection) {
            entry.post_initialize(collection);
        }
        tracing::trace!(collection = ?collection, "collection initialized");
        Ok(())
    }

    /// Loads one lazily fetched property of a tracked instance and returns
    /// its value.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::LazyInitialization`] if the instance is not
    /// tracked by this open session.
    pub fn fetch_lazy_property(&mut self, entity: &EntityRef, property: &str) -> CoreResult<Value> {
        let what = format!("{}.{property}", entity.entity_name());
        if !self.is_open {
            return Err(CoreError::lazy_initialization(what, "the session was closed"));
        }
        let Some(entry) = self.context.get_entry(entity) else {
            return Err(CoreError::lazy_initialization(what, "instance is not associated with the session"));
        };
        let persister = Arc::clone(entry.persister());
        let id = entry
            .id()
            .cloned()
            .ok_or_else(|| CoreError::assertion_failure(format!("{what} owner has no identifier")))?;
        let meta = persister.metamodel();
        let index = meta
            .property_index(property)
            .ok_or_else(|| CoreError::mapping(format!("{} has no property {property}", meta.name())))?;
        if entity.is_property_initialized(index) {
            return Ok(entity.get(index));
        }
        self.check_cancelled()?;
        let stored = persister.load_property(&id, index)?;
        let value = hydrate::assemble_property(self, &stored, &meta.properties()[index], meta.name(), &id)?;
        entity.put_value(index, value.clone());
        if let Some(entry) = self.context.get_entry_mut(entity) {
            if let Some(loaded) = entry.loaded_state() {
                let mut values = loaded.values().to_vec();
                if let Some(slot) = values.get_mut(index) {
                    *slot = value.deep_copy();
                }
                entry.set_loaded_state(Some(Snapshot::capture(&values)));
            }
        }
        tracing::trace!(property = %what, "lazy property fetched");
        Ok(value)
    }

    // === Flushing ===

    /// Writes every pending change to the store.
    ///
    /// # Errors
    ///
    /// The first failing write aborts the flush; writes already executed
    /// are not undone.
    pub fn flush(&mut self) -> CoreResult<FlushReport> {
        self.ensure_open()?;
        let mut event = FlushEvent::default();
        self.fire_flush(&mut event)?;
        Ok(event.report)
    }

    /// Flushes if pending changes touch any of `spaces`, as before a query
    /// over them. Returns true if a flush ran.
    ///
    /// # Errors
    ///
    /// See [`Session::flush`].
    pub fn auto_flush_if_required(&mut self, spaces: &[&str]) -> CoreResult<bool> {
        self.ensure_open()?;
        let mut event = AutoFlushEvent {
            spaces: spaces.iter().map(|s| (*s).to_string()).collect(),
            flush_required: false,
        };
        let factory = self.factory.clone();
        for listener in &factory.listeners().auto_flush {
            listener.on_auto_flush(self, &mut event)?;
        }
        Ok(event.flush_required)
    }

    /// Returns true if a flush would write anything.
    ///
    /// # Errors
    ///
    /// Fails if planning the flush fails.
    pub fn is_dirty(&mut self) -> CoreResult<bool> {
        self.ensure_open()?;
        if self.action_queue.has_any_queued_actions() {
            return Ok(true);
        }
        let mut event = DirtyCheckEvent::default();
        let factory = self.factory.clone();
        for listener in &factory.listeners().dirty_check {
            listener.on_dirty_check(self, &mut event)?;
        }
        Ok(event.dirty)
    }

    /// Flushes (unless the flush mode is manual) and runs deferred version
    /// checks and increments. Call before committing.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StaleObjectState`] if a deferred version
    /// check fails.
    pub fn before_transaction_completion(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.flush_mode != FlushMode::Manual {
            self.flush()?;
        }
        ActionQueue::before_transaction_completion(self)
    }

    /// Releases every held lock. Pending writes are discarded if the
    /// transaction did not commit.
    pub fn after_transaction_completion(&mut self, committed: bool) {
        self.context.after_transaction_completion();
        if !committed {
            self.action_queue.clear();
        }
        tracing::debug!(session = %self.id, committed, "transaction completed");
    }

    // === Event dispatch ===

    pub(crate) fn fire_load(&mut self, event: &mut LoadEvent) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().load {
            listener.on_load(self, event)?;
        }
        Ok(())
    }

    pub(crate) fn fire_save_or_update(
        &mut self,
        event: &mut SaveOrUpdateEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().save_or_update {
            listener.on_save_or_update(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_persist(&mut self, event: &mut PersistEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().persist {
            listener.on_persist(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_delete(&mut self, event: &mut DeleteEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().delete {
            listener.on_delete(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_merge(&mut self, event: &mut MergeEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().merge {
            listener.on_merge(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_refresh(&mut self, event: &mut RefreshEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().refresh {
            listener.on_refresh(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_lock(&mut self, event: &mut LockEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().lock {
            listener.on_lock(self, event, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_evict(&mut self, event: &mut EvictEvent, ctx: &mut OperationContext) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().evict {
            listener.on_evict(self, event, ctx)?;
        }
        Ok(())
    }

    fn fire_flush(&mut self, event: &mut FlushEvent) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().flush {
            listener.on_flush(self, event)?;
        }
        Ok(())
    }

    pub(crate) fn fire_flush_entity(&mut self, event: &mut FlushEntityEvent) -> CoreResult<()> {
        let factory = self.factory.clone();
        for listener in &factory.listeners().flush_entity {
            listener.on_flush_entity(self, event)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("is_open", &self.is_open)
            .field("flush_mode", &self.flush_mode)
            .field("cache_mode", &self.cache_mode)
            .field("context", &self.context)
            .field("action_queue", &self.action_queue)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetamodel, PropertyMetadata};
    use crate::test_support::entity_persister;

    fn factory() -> SessionFactory {
        SessionFactory::builder()
            .entity_persister(entity_persister(
                EntityMetamodel::new("Note").property(PropertyMetadata::basic("text")),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn open_and_close_are_counted() {
        let factory = factory();
        let mut session = factory.open_session();
        assert!(session.is_open());
        session.close();
        session.close();
        assert!(!session.is_open());
        let stats = factory.statistics().snapshot();
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[test]
    fn closed_session_rejects_operations() {
        let factory = factory();
        let mut session = factory.open_session();
        session.close();
        let note = EntityRef::new("Note", vec![Value::from("x")]);
        assert!(matches!(session.persist(&note), Err(CoreError::SessionClosed)));
        assert!(matches!(session.flush(), Err(CoreError::SessionClosed)));
    }

    #[test]
    fn cancellation_is_consumed_once() {
        let factory = factory();
        let session = factory.open_session();
        let handle = session.cancellation_handle();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(session.check_cancelled(), Err(CoreError::Cancelled)));
        assert!(session.check_cancelled().is_ok());
    }

    #[test]
    fn cancellation_handle_is_send() {
        fn assert_send<T: Send + Sync>() {}
        assert_send::<CancellationHandle>();
        assert_send::<SessionFactory>();
    }

    #[test]
    fn unmapped_entity_is_reported() {
        let factory = factory();
        let mut session = factory.open_session();
        assert!(matches!(
            session.get("Invoice", 1),
            Err(CoreError::UnknownEntity { .. })
        ));
    }
}
