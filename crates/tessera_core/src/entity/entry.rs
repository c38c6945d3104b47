//! Per-instance registry entries.

use super::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::persister::EntityPersister;
use crate::types::{EntityKey, Identifier, Version};
use crate::value::{Snapshot, Value};
use crate::versioning;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Tracked and dirty-checked at flush.
    Managed,
    /// Tracked but never dirty-checked.
    ReadOnly,
    /// Insert requested but still waiting for its dependencies.
    Saving,
    /// Scheduled for deletion.
    Deleted,
    /// Row deleted during this unit of work.
    Gone,
}

impl Status {
    /// Returns true for `Deleted` and `Gone`.
    #[must_use]
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, Self::Deleted | Self::Gone)
    }

    const fn may_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Saving, Self::Managed | Self::ReadOnly | Self::Deleted)
                | (Self::Managed, Self::ReadOnly | Self::Deleted)
                | (Self::ReadOnly, Self::Managed | Self::Deleted)
                | (Self::Deleted, Self::Gone)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Managed => "MANAGED",
            Self::ReadOnly => "READ_ONLY",
            Self::Saving => "SAVING",
            Self::Deleted => "DELETED",
            Self::Gone => "GONE",
        };
        f.write_str(name)
    }
}

/// Registry entry of one tracked instance.
///
/// The entry holds everything the flush needs to decide what to write: the
/// state as last synchronized with the store, the version, the held lock
/// and the persister of the instance.
#[derive(Clone)]
pub struct EntityEntry {
    status: Status,
    previous_status: Option<Status>,
    entity_name: String,
    id: Option<Identifier>,
    loaded_state: Option<Snapshot>,
    deleted_state: Option<Snapshot>,
    version: Option<Version>,
    lock_mode: LockMode,
    persister: Arc<dyn EntityPersister>,
    exists_in_database: bool,
    disable_version_increment: bool,
}

impl EntityEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: Status,
        loaded_state: Option<Snapshot>,
        id: Option<Identifier>,
        version: Option<Version>,
        lock_mode: LockMode,
        exists_in_database: bool,
        persister: Arc<dyn EntityPersister>,
        disable_version_increment: bool,
    ) -> Self {
        Self {
            status,
            previous_status: None,
            entity_name: persister.entity_name().to_string(),
            id,
            loaded_state,
            deleted_state: None,
            version,
            lock_mode,
            persister,
            exists_in_database,
            disable_version_increment,
        }
    }

    /// Returns the status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the status before the last transition.
    #[must_use]
    pub const fn previous_status(&self) -> Option<Status> {
        self.previous_status
    }

    /// Moves the entry along a lifecycle edge.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure for transitions outside the lifecycle.
    pub(crate) fn set_status(&mut self, next: Status) -> CoreResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.may_become(next) {
            return Err(CoreError::assertion_failure(format!(
                "illegal status transition {} -> {} for {}",
                self.status,
                next,
                self.describe()
            )));
        }
        tracing::trace!(entity = %self.describe(), from = %self.status, to = %next, "status transition");
        if next == Status::ReadOnly {
            self.loaded_state = None;
        }
        self.previous_status = Some(self.status);
        self.status = next;
        Ok(())
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the identifier (absent for identity inserts still pending).
    #[must_use]
    pub fn id(&self) -> Option<&Identifier> {
        self.id.as_ref()
    }

    /// Returns the key, once the identifier is known.
    #[must_use]
    pub fn entity_key(&self) -> Option<EntityKey> {
        self.id.as_ref().map(|id| {
            EntityKey::new(id.clone(), self.entity_name.clone())
                .with_mode(self.persister.metamodel().entity_mode())
        })
    }

    pub(crate) fn set_id(&mut self, id: Identifier) {
        self.id = Some(id);
    }

    /// Returns the state last synchronized with the store.
    #[must_use]
    pub fn loaded_state(&self) -> Option<&Snapshot> {
        self.loaded_state.as_ref()
    }

    /// Returns one loaded value.
    #[must_use]
    pub fn loaded_value(&self, index: usize) -> Option<&Value> {
        self.loaded_state.as_ref().and_then(|s| s.get(index))
    }

    pub(crate) fn set_loaded_state(&mut self, state: Option<Snapshot>) {
        self.loaded_state = state;
    }

    /// Returns the state captured when the instance was deleted.
    #[must_use]
    pub fn deleted_state(&self) -> Option<&Snapshot> {
        self.deleted_state.as_ref()
    }

    pub(crate) fn set_deleted_state(&mut self, state: Option<Snapshot>) {
        self.deleted_state = state;
    }

    /// Returns the version.
    #[must_use]
    pub const fn version(&self) -> Option<Version> {
        self.version
    }

    /// Returns the held lock mode.
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub(crate) fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    /// Returns the persister.
    #[must_use]
    pub fn persister(&self) -> &Arc<dyn EntityPersister> {
        &self.persister
    }

    /// Returns true once the row exists in the store.
    #[must_use]
    pub const fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Returns true if version increments are suppressed.
    #[must_use]
    pub const fn is_version_increment_disabled(&self) -> bool {
        self.disable_version_increment
    }

    /// Returns true if the instance can be modified through this unit of work.
    #[must_use]
    pub fn is_modifiable(&self) -> bool {
        self.persister.metamodel().is_mutable()
            && self.status != Status::ReadOnly
            && !(self.status == Status::Deleted && self.previous_status == Some(Status::ReadOnly))
    }

    /// Returns true if the flush has to dirty-check the instance.
    ///
    /// Read-only and immutable instances are skipped, as are instances of
    /// write-tracking entities that recorded no write.
    #[must_use]
    pub fn requires_dirty_check(&self, entity: &EntityRef) -> bool {
        if !self.is_modifiable() {
            return false;
        }
        !self.persister.metamodel().is_tracking_dirtiness()
            || !entity.written_properties().is_empty()
            || self.loaded_state.is_none()
    }

    /// Returns true if the entry is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    /// Switches between `Managed` and `ReadOnly`.
    ///
    /// Leaving read-only mode re-captures the loaded state from the
    /// instance, so changes made while read-only are never written.
    pub(crate) fn set_read_only(&mut self, read_only: bool, entity: &EntityRef) -> CoreResult<()> {
        match (self.status, read_only) {
            (Status::ReadOnly, true) | (Status::Managed, false) => Ok(()),
            (Status::Managed, true) => self.set_status(Status::ReadOnly),
            (Status::ReadOnly, false) => {
                if !self.persister.metamodel().is_mutable() {
                    return Err(CoreError::invalid_operation(format!(
                        "cannot make an immutable {} modifiable",
                        self.entity_name
                    )));
                }
                self.set_status(Status::Managed)?;
                self.loaded_state = Some(Snapshot::capture(&entity.values()));
                Ok(())
            }
            (status, _) => Err(CoreError::transient_object(format!(
                "instance {} is {status}; read-only mode applies to managed instances only",
                self.describe()
            ))),
        }
    }

    /// Returns true if references to this instance must be written as null.
    #[must_use]
    pub fn is_nullifiable(&self, early_insert: bool, nullifiable_keys: &HashSet<EntityKey>) -> bool {
        if self.status == Status::Saving {
            return true;
        }
        if early_insert {
            !self.exists_in_database
        } else {
            self.entity_key()
                .map_or(false, |key| nullifiable_keys.contains(&key))
        }
    }

    pub(crate) fn post_insert(&mut self, state: Snapshot) {
        self.exists_in_database = true;
        self.loaded_state = Some(state);
    }

    pub(crate) fn post_update(
        &mut self,
        entity: &EntityRef,
        updated_state: Snapshot,
        next_version: Option<Version>,
    ) {
        self.loaded_state = Some(updated_state);
        self.lock_mode = LockMode::Write;
        if let (Some(version), Some(metadata)) =
            (next_version, self.persister.metamodel().version_metadata())
        {
            self.version = Some(version);
            entity.put_value(metadata.index, Value::from(version));
        }
    }

    pub(crate) fn post_delete(&mut self) -> CoreResult<()> {
        self.set_status(Status::Gone)?;
        self.exists_in_database = false;
        Ok(())
    }

    pub(crate) fn force_locked(&mut self, entity: &EntityRef, next_version: Version) {
        self.version = Some(next_version);
        self.lock_mode = LockMode::Force;
        let meta = self.persister.metamodel();
        if let Some(state) = self.loaded_state.as_mut() {
            let mut values = state.values().to_vec();
            versioning::set_version(&mut values, next_version, meta);
            *state = Snapshot::capture(&values);
        }
        if let Some(metadata) = meta.version_metadata() {
            entity.put_value(metadata.index, Value::from(next_version));
        }
    }

    pub(crate) fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{}#{}", self.entity_name, id),
            None => format!("{}#<pending>", self.entity_name),
        }
    }
}

impl fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry")
            .field("entity_name", &self.entity_name)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("version", &self.version)
            .field("lock_mode", &self.lock_mode)
            .field("exists_in_database", &self.exists_in_database)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entity_persister, order_metamodel};

    fn entry(status: Status) -> EntityEntry {
        EntityEntry::new(
            status,
            Some(Snapshot::default()),
            Some(Identifier::from(1)),
            Some(Version::Integer(0)),
            LockMode::None,
            true,
            entity_persister(order_metamodel()),
            false,
        )
    }

    #[test]
    fn lifecycle_edges() {
        let mut e = entry(Status::Saving);
        e.set_status(Status::Managed).unwrap();
        e.set_status(Status::Deleted).unwrap();
        e.post_delete().unwrap();
        assert_eq!(e.status(), Status::Gone);
        assert!(!e.exists_in_database());
    }

    #[test]
    fn deleted_cannot_return_to_managed() {
        let mut e = entry(Status::Deleted);
        let err = e.set_status(Status::Managed).unwrap_err();
        assert!(matches!(err, CoreError::AssertionFailure { .. }));
        assert_eq!(e.status(), Status::Deleted);
    }

    #[test]
    fn read_only_drops_and_recaptures_loaded_state() {
        let entity = EntityRef::with_identifier(
            "Order",
            Identifier::from(1),
            vec![Value::from("A"), Value::Null, Value::Null, Value::from(0)],
        );
        let mut e = entry(Status::Managed);
        e.set_read_only(true, &entity).unwrap();
        assert!(e.loaded_state().is_none());
        assert!(!e.is_modifiable());
        e.set_read_only(false, &entity).unwrap();
        assert_eq!(e.loaded_value(0), Some(&Value::from("A")));
    }

    #[test]
    fn saving_is_nullifiable() {
        let e = entry(Status::Saving);
        assert!(e.is_nullifiable(false, &HashSet::new()));
        let managed = entry(Status::Managed);
        assert!(!managed.is_nullifiable(false, &HashSet::new()));
        let mut keys = HashSet::new();
        keys.insert(managed.entity_key().unwrap());
        assert!(managed.is_nullifiable(false, &keys));
    }

    #[test]
    fn write_tracking_entities_skip_untouched_instances() {
        let tracked = EntityEntry::new(
            Status::Managed,
            Some(Snapshot::default()),
            Some(Identifier::from(1)),
            Some(Version::Integer(0)),
            LockMode::None,
            true,
            entity_persister(order_metamodel().tracks_dirtiness()),
            false,
        );
        let order = EntityRef::with_identifier("Order", Identifier::from(1), vec![Value::Null; 4]);
        assert!(!tracked.requires_dirty_check(&order));
        order.set(0, "PAID");
        assert!(tracked.requires_dirty_check(&order));

        // untracked entities are always compared
        let plain = EntityRef::with_identifier("Order", Identifier::from(2), vec![Value::Null; 4]);
        assert!(entry(Status::Managed).requires_dirty_check(&plain));
        assert!(!entry(Status::ReadOnly).requires_dirty_check(&plain));
    }
}
