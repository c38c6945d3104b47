//! Event pipeline.
//!
//! Every session operation is turned into an event and handed to the
//! ordered listener list registered for its kind. The default listeners
//! implement the engine semantics; applications may append or prepend their
//! own. Listeners receive the session mutably and, for operations that
//! cascade, the [`OperationContext`] of the top-level call.

mod copy_cache;
mod delete;
mod evict;
mod flush;
mod flush_entity;
mod load;
mod lock;
mod merge;
mod persist;
mod refresh;
mod save;

pub use copy_cache::CopyCache;
pub use delete::DefaultDeleteEventListener;
pub use evict::DefaultEvictEventListener;
pub use flush::{
    DefaultAutoFlushEventListener, DefaultDirtyCheckEventListener, DefaultFlushEventListener,
    FlushReport,
};
pub use flush_entity::DefaultFlushEntityEventListener;
pub use load::DefaultLoadEventListener;
pub use lock::DefaultLockEventListener;
pub use merge::DefaultMergeEventListener;
pub use persist::DefaultPersistEventListener;
pub use refresh::DefaultRefreshEventListener;
pub use save::DefaultSaveOrUpdateEventListener;

pub(crate) use lock::upgrade_lock;
pub(crate) use merge::resolve_transient_copies;

use crate::engine::transient;
use crate::entity::{EntityHandle, EntityRef};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockOptions;
use crate::session::Session;
use crate::types::{Identifier, InstanceId};
use crate::value::{Row, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of an instance relative to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Tracked and not deleted.
    Persistent,
    /// Never saved.
    Transient,
    /// Saved by another unit of work, not tracked here.
    Detached,
    /// Tracked and scheduled for deletion.
    Deleted,
}

/// Classifies an instance.
///
/// Tracked instances are decided by their entry; untracked ones by the
/// transient policy chain, with `assumed` standing in before the store is
/// consulted.
pub(crate) fn entity_state(
    session: &mut Session,
    entity: &EntityRef,
    assumed: Option<bool>,
) -> CoreResult<EntityState> {
    if let Some(entry) = session.persistence_context().get_entry(entity) {
        return Ok(if entry.status().is_deleted_or_gone() {
            EntityState::Deleted
        } else {
            EntityState::Persistent
        });
    }
    if transient::is_transient(session, entity, assumed)? {
        Ok(EntityState::Transient)
    } else {
        Ok(EntityState::Detached)
    }
}

/// Error for an operation on an instance scheduled for deletion.
pub(crate) fn deleted_instance(session: &Session, entity: &EntityRef, operation: &'static str) -> CoreError {
    let id = session
        .persistence_context()
        .get_entry(entity)
        .and_then(|entry| entry.id().cloned())
        .or_else(|| entity.identifier());
    match id {
        Some(id) => CoreError::object_deleted(entity.entity_name(), id, operation),
        None => CoreError::assertion_failure(format!("deleted instance {entity:?} has no identifier")),
    }
}

/// State shared by every event fired for one top-level operation.
#[derive(Debug, Default)]
pub struct OperationContext {
    visited: HashSet<InstanceId>,
    copy_cache: CopyCache,
    lock_options: Option<LockOptions>,
}

impl OperationContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that cascades lock requests.
    pub fn with_lock_options(lock_options: LockOptions) -> Self {
        Self {
            lock_options: Some(lock_options),
            ..Self::default()
        }
    }

    /// Marks an instance as visited; returns false if it already was.
    pub fn mark_visited(&mut self, entity: &EntityRef) -> bool {
        self.visited.insert(entity.instance_id())
    }

    /// Returns true if the instance was visited.
    #[must_use]
    pub fn is_visited(&self, entity: &EntityRef) -> bool {
        self.visited.contains(&entity.instance_id())
    }

    /// Returns the merge copy cache.
    #[must_use]
    pub fn copy_cache(&self) -> &CopyCache {
        &self.copy_cache
    }

    /// Returns the merge copy cache mutably.
    pub fn copy_cache_mut(&mut self) -> &mut CopyCache {
        &mut self.copy_cache
    }

    /// Returns the lock options cascaded by a lock or refresh.
    #[must_use]
    pub fn lock_options(&self) -> Option<&LockOptions> {
        self.lock_options.as_ref()
    }
}

// === Events ===

/// How a load may be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Eager load that returns nothing for a missing row.
    Get,
    /// Load that may hand out a placeholder.
    Load,
    /// Eager load of an association target.
    InternalLoadEager,
    /// Load of an association target that may hand out a placeholder.
    InternalLoadLazy,
    /// Eager load of an association target that may be missing.
    InternalLoadNullable,
    /// Initialization of a placeholder.
    ImmediateLoad,
}

impl LoadType {
    /// Returns true if a placeholder may be returned instead of loading.
    #[must_use]
    pub const fn allows_proxy_creation(self) -> bool {
        matches!(self, Self::Load | Self::InternalLoadLazy)
    }

    /// Returns true if a missing row yields no result instead of an error.
    #[must_use]
    pub const fn is_nullable(self) -> bool {
        matches!(self, Self::Get | Self::InternalLoadNullable)
    }

    /// Returns true if instances scheduled for deletion count as missing.
    #[must_use]
    pub const fn checks_deleted(self) -> bool {
        matches!(self, Self::Get | Self::Load)
    }
}

/// Request to load an entity by identifier.
#[derive(Debug, Clone)]
pub struct LoadEvent {
    /// Entity name.
    pub entity_name: String,
    /// Identifier to load.
    pub id: Identifier,
    /// Lock to acquire.
    pub lock_options: LockOptions,
    /// How the load may be satisfied.
    pub load_type: LoadType,
    /// Loaded instance or placeholder.
    pub result: Option<EntityHandle>,
}

impl LoadEvent {
    /// Creates a load event.
    pub fn new(entity_name: impl Into<String>, id: Identifier, load_type: LoadType) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            lock_options: LockOptions::none(),
            load_type,
            result: None,
        }
    }

    /// Sets the lock to acquire.
    #[must_use]
    pub fn with_lock(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }
}

/// Which of save, update and save-or-update was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// Make a new instance persistent.
    Save,
    /// Reattach a detached instance.
    Update,
    /// Either, depending on the instance state.
    SaveOrUpdate,
}

impl SaveKind {
    /// Returns the operation name used in errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Update => "update",
            Self::SaveOrUpdate => "save-or-update",
        }
    }
}

/// Request to save, update or save-or-update an instance.
#[derive(Debug, Clone)]
pub struct SaveOrUpdateEvent {
    /// The instance.
    pub entity: EntityRef,
    /// Identifier to use instead of generating one.
    pub requested_id: Option<Identifier>,
    /// Requested operation.
    pub kind: SaveKind,
    /// Identifier of the instance once handled.
    pub result_id: Option<Identifier>,
}

impl SaveOrUpdateEvent {
    /// Creates an event.
    pub fn new(entity: EntityRef, kind: SaveKind) -> Self {
        Self {
            entity,
            requested_id: None,
            kind,
            result_id: None,
        }
    }
}

/// Request to make a new instance persistent.
#[derive(Debug, Clone)]
pub struct PersistEvent {
    /// The instance.
    pub entity: EntityRef,
    /// True when fired by the flush cascade.
    pub on_flush: bool,
}

/// Request to delete an instance.
#[derive(Debug, Clone)]
pub struct DeleteEvent {
    /// The instance or its placeholder.
    pub entity: EntityHandle,
    /// True when the instance is an orphan removed from a collection.
    pub orphan_removal: bool,
}

/// Request to copy the state of an instance onto its managed copy.
#[derive(Debug, Clone)]
pub struct MergeEvent {
    /// The instance whose state is merged.
    pub original: EntityRef,
    /// Identifier to use for a transient original.
    pub requested_id: Option<Identifier>,
    /// The managed copy.
    pub result: Option<EntityRef>,
}

impl MergeEvent {
    /// Creates an event.
    pub fn new(original: EntityRef) -> Self {
        Self {
            original,
            requested_id: None,
            result: None,
        }
    }
}

/// Request to re-read an instance from the store.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    /// The instance.
    pub entity: EntityRef,
    /// Lock to acquire while reading.
    pub lock_options: LockOptions,
}

/// Request to lock an instance.
#[derive(Debug, Clone)]
pub struct LockEvent {
    /// The instance.
    pub entity: EntityRef,
    /// Requested lock.
    pub lock_options: LockOptions,
}

/// Request to stop tracking an instance.
#[derive(Debug, Clone)]
pub struct EvictEvent {
    /// The instance or its placeholder.
    pub entity: EntityHandle,
}

/// Explicit flush.
#[derive(Debug, Clone, Default)]
pub struct FlushEvent {
    /// What the flush planned and executed.
    pub report: FlushReport,
}

/// Flush that runs only if pending writes touch the queried spaces.
#[derive(Debug, Clone, Default)]
pub struct AutoFlushEvent {
    /// Query spaces about to be read.
    pub spaces: Vec<String>,
    /// Set when the flush was executed.
    pub flush_required: bool,
}

/// Probe for pending changes.
#[derive(Debug, Clone, Default)]
pub struct DirtyCheckEvent {
    /// Set when a flush would write something.
    pub dirty: bool,
}

/// Flush of a single tracked instance.
#[derive(Debug, Clone)]
pub struct FlushEntityEvent {
    /// The instance.
    pub entity: EntityRef,
    /// State being flushed.
    pub property_values: Vec<Value>,
    /// Dirty property indices; `None` when every property counts as dirty.
    pub dirty_properties: Option<Vec<usize>>,
    /// True if a versionable collection of the instance changed.
    pub has_dirty_collection: bool,
    /// False when no loaded state was available to compare against.
    pub dirty_check_possible: bool,
    /// True if the interceptor decided dirtiness.
    pub dirty_check_handled_by_interceptor: bool,
    /// Store row read for the dirty check, if any.
    pub database_snapshot: Option<Row>,
}

impl FlushEntityEvent {
    /// Creates an event for `entity`.
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            property_values: Vec::new(),
            dirty_properties: None,
            has_dirty_collection: false,
            dirty_check_possible: true,
            dirty_check_handled_by_interceptor: false,
            database_snapshot: None,
        }
    }
}

// === Listener contracts ===

/// Handles [`LoadEvent`]s.
pub trait LoadEventListener: Send + Sync {
    /// Handles a load.
    ///
    /// # Errors
    ///
    /// An error aborts the load.
    fn on_load(&self, session: &mut Session, event: &mut LoadEvent) -> CoreResult<()>;
}

/// Handles [`SaveOrUpdateEvent`]s.
pub trait SaveOrUpdateEventListener: Send + Sync {
    /// Handles a save, update or save-or-update.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_save_or_update(
        &self,
        session: &mut Session,
        event: &mut SaveOrUpdateEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`PersistEvent`]s.
pub trait PersistEventListener: Send + Sync {
    /// Handles a persist.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_persist(
        &self,
        session: &mut Session,
        event: &mut PersistEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`DeleteEvent`]s.
pub trait DeleteEventListener: Send + Sync {
    /// Handles a delete.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_delete(
        &self,
        session: &mut Session,
        event: &mut DeleteEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`MergeEvent`]s.
pub trait MergeEventListener: Send + Sync {
    /// Handles a merge.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_merge(
        &self,
        session: &mut Session,
        event: &mut MergeEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`RefreshEvent`]s.
pub trait RefreshEventListener: Send + Sync {
    /// Handles a refresh.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_refresh(
        &self,
        session: &mut Session,
        event: &mut RefreshEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`LockEvent`]s.
pub trait LockEventListener: Send + Sync {
    /// Handles a lock request.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_lock(
        &self,
        session: &mut Session,
        event: &mut LockEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`EvictEvent`]s.
pub trait EvictEventListener: Send + Sync {
    /// Handles an eviction.
    ///
    /// # Errors
    ///
    /// An error aborts the operation.
    fn on_evict(
        &self,
        session: &mut Session,
        event: &mut EvictEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()>;
}

/// Handles [`FlushEvent`]s.
pub trait FlushEventListener: Send + Sync {
    /// Handles a flush.
    ///
    /// # Errors
    ///
    /// An error aborts the flush; actions already executed stay executed.
    fn on_flush(&self, session: &mut Session, event: &mut FlushEvent) -> CoreResult<()>;
}

/// Handles [`AutoFlushEvent`]s.
pub trait AutoFlushEventListener: Send + Sync {
    /// Handles an auto-flush.
    ///
    /// # Errors
    ///
    /// An error aborts the flush.
    fn on_auto_flush(&self, session: &mut Session, event: &mut AutoFlushEvent) -> CoreResult<()>;
}

/// Handles [`DirtyCheckEvent`]s.
pub trait DirtyCheckEventListener: Send + Sync {
    /// Handles a dirty check.
    ///
    /// # Errors
    ///
    /// An error aborts the check.
    fn on_dirty_check(&self, session: &mut Session, event: &mut DirtyCheckEvent) -> CoreResult<()>;
}

/// Handles [`FlushEntityEvent`]s.
pub trait FlushEntityEventListener: Send + Sync {
    /// Handles the flush of one instance.
    ///
    /// # Errors
    ///
    /// An error aborts the flush.
    fn on_flush_entity(&self, session: &mut Session, event: &mut FlushEntityEvent) -> CoreResult<()>;
}

/// Ordered listener lists, one per event kind.
///
/// [`EventListeners::default`] installs the engine's default listeners.
#[derive(Clone)]
pub struct EventListeners {
    /// Load listeners.
    pub load: Vec<Arc<dyn LoadEventListener>>,
    /// Save, update and save-or-update listeners.
    pub save_or_update: Vec<Arc<dyn SaveOrUpdateEventListener>>,
    /// Persist listeners.
    pub persist: Vec<Arc<dyn PersistEventListener>>,
    /// Delete listeners.
    pub delete: Vec<Arc<dyn DeleteEventListener>>,
    /// Merge listeners.
    pub merge: Vec<Arc<dyn MergeEventListener>>,
    /// Refresh listeners.
    pub refresh: Vec<Arc<dyn RefreshEventListener>>,
    /// Lock listeners.
    pub lock: Vec<Arc<dyn LockEventListener>>,
    /// Evict listeners.
    pub evict: Vec<Arc<dyn EvictEventListener>>,
    /// Flush listeners.
    pub flush: Vec<Arc<dyn FlushEventListener>>,
    /// Auto-flush listeners.
    pub auto_flush: Vec<Arc<dyn AutoFlushEventListener>>,
    /// Dirty-check listeners.
    pub dirty_check: Vec<Arc<dyn DirtyCheckEventListener>>,
    /// Per-instance flush listeners.
    pub flush_entity: Vec<Arc<dyn FlushEntityEventListener>>,
}

impl EventListeners {
    /// Creates the default listener set.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for EventListeners {
    fn default() -> Self {
        Self {
            load: vec![Arc::new(DefaultLoadEventListener)],
            save_or_update: vec![Arc::new(DefaultSaveOrUpdateEventListener)],
            persist: vec![Arc::new(DefaultPersistEventListener)],
            delete: vec![Arc::new(DefaultDeleteEventListener)],
            merge: vec![Arc::new(DefaultMergeEventListener)],
            refresh: vec![Arc::new(DefaultRefreshEventListener)],
            lock: vec![Arc::new(DefaultLockEventListener)],
            evict: vec![Arc::new(DefaultEvictEventListener)],
            flush: vec![Arc::new(DefaultFlushEventListener)],
            auto_flush: vec![Arc::new(DefaultAutoFlushEventListener)],
            dirty_check: vec![Arc::new(DefaultDirtyCheckEventListener)],
            flush_entity: vec![Arc::new(DefaultFlushEntityEventListener)],
        }
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("load", &self.load.len())
            .field("save_or_update", &self.save_or_update.len())
            .field("persist", &self.persist.len())
            .field("delete", &self.delete.len())
            .field("merge", &self.merge.len())
            .field("refresh", &self.refresh.len())
            .field("lock", &self.lock.len())
            .field("evict", &self.evict.len())
            .field("flush", &self.flush.len())
            .field("auto_flush", &self.auto_flush.len())
            .field("dirty_check", &self.dirty_check.len())
            .field("flush_entity", &self.flush_entity.len())
            .finish()
    }
}
