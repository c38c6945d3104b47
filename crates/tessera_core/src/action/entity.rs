//! Entity insert, update and delete actions.

use crate::cache::coordinator;
use crate::cache::CacheKey;
use crate::engine::{foreign_keys, hydrate};
use crate::entity::{EntityEntry, EntityRef};
use crate::error::{CoreError, CoreResult};
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::types::{EntityKey, Identifier, Version};
use crate::value::{Snapshot, Value};
use std::fmt;
use std::sync::Arc;

fn entry_after_execution<'a>(session: &'a mut Session, entity: &EntityRef) -> CoreResult<&'a mut EntityEntry> {
    session.context_mut().get_entry_mut(entity).ok_or_else(|| {
        CoreError::assertion_failure(format!(
            "possible non-threadsafe access to the session: {entity:?} lost its entry"
        ))
    })
}

fn record_optimistic_failure(session: &Session, err: &CoreError) {
    if err.is_optimistic_failure() {
        session.statistics().record_optimistic_failure();
    }
}

/// Insert of an instance whose identifier is known.
pub struct EntityInsertAction {
    entity: EntityRef,
    id: Identifier,
    state: Vec<Value>,
    version: Option<Version>,
    persister: Arc<dyn EntityPersister>,
}

impl EntityInsertAction {
    pub(crate) fn new(
        entity: EntityRef,
        id: Identifier,
        state: Vec<Value>,
        version: Option<Version>,
        persister: Arc<dyn EntityPersister>,
    ) -> Self {
        Self {
            entity,
            id,
            state,
            version,
            persister,
        }
    }

    /// Returns the instance.
    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Returns the state to insert.
    #[must_use]
    pub fn state(&self) -> &[Value] {
        &self.state
    }

    /// Returns the version written with the row.
    #[must_use]
    pub const fn version(&self) -> Option<Version> {
        self.version
    }

    pub(crate) fn state_mut(&mut self) -> &mut Vec<Value> {
        &mut self.state
    }

    pub(crate) fn persister(&self) -> &Arc<dyn EntityPersister> {
        &self.persister
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metamodel().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let meta = self.persister.metamodel();
        foreign_keys::nullify_transient_references(session, &mut self.state, meta, false)?;
        let row = hydrate::dehydrate(&self.state, meta)?;
        self.persister.insert(&self.id, &row)?;
        session.statistics().record_entity_insert();
        tracing::trace!(entity = %EntityKey::new(self.id.clone(), meta.name()), "inserted");
        entry_after_execution(session, &self.entity)?.post_insert(Snapshot::capture(&self.state));
        Ok(())
    }
}

impl fmt::Debug for EntityInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityInsertAction[{}#{}]", self.persister.entity_name(), self.id)
    }
}

/// Insert of an instance whose identifier the store generates.
///
/// Identity inserts run as soon as they are resolved, since nothing can
/// reference the row before its identifier exists.
pub struct EntityIdentityInsertAction {
    entity: EntityRef,
    state: Vec<Value>,
    persister: Arc<dyn EntityPersister>,
    generated_id: Option<Identifier>,
}

impl EntityIdentityInsertAction {
    pub(crate) fn new(entity: EntityRef, state: Vec<Value>, persister: Arc<dyn EntityPersister>) -> Self {
        Self {
            entity,
            state,
            persister,
            generated_id: None,
        }
    }

    /// Returns the instance.
    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Returns the identifier generated by the store, once executed.
    #[must_use]
    pub fn generated_id(&self) -> Option<&Identifier> {
        self.generated_id.as_ref()
    }

    pub(crate) fn state(&self) -> &[Value] {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut Vec<Value> {
        &mut self.state
    }

    pub(crate) fn persister(&self) -> &Arc<dyn EntityPersister> {
        &self.persister
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metamodel().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let meta = self.persister.metamodel();
        foreign_keys::nullify_transient_references(session, &mut self.state, meta, true)?;
        let row = hydrate::dehydrate(&self.state, meta)?;
        let id = self.persister.insert_generated(&row)?;
        session.statistics().record_entity_insert();
        self.entity.set_identifier(Some(id.clone()));
        let key = EntityKey::new(id.clone(), meta.name()).with_mode(meta.entity_mode());
        tracing::trace!(entity = %key, "inserted with generated identifier");
        session.context_mut().add_entity_key(key, &self.entity)?;
        entry_after_execution(session, &self.entity)?.post_insert(Snapshot::capture(&self.state));
        for value in &self.state {
            if let Value::Collection(collection) = value {
                if collection.key().is_none() {
                    collection.set_key(Some(id.clone()));
                }
            }
        }
        self.generated_id = Some(id);
        Ok(())
    }
}

impl fmt::Debug for EntityIdentityInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityIdentityInsertAction[{}]", self.persister.entity_name())
    }
}

/// Update of a dirty instance.
pub struct EntityUpdateAction {
    entity: EntityRef,
    id: Identifier,
    state: Vec<Value>,
    dirty_properties: Option<Vec<usize>>,
    has_dirty_collection: bool,
    previous_state: Option<Snapshot>,
    previous_version: Option<Version>,
    next_version: Option<Version>,
    persister: Arc<dyn EntityPersister>,
}

impl EntityUpdateAction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        entity: EntityRef,
        id: Identifier,
        state: Vec<Value>,
        dirty_properties: Option<Vec<usize>>,
        has_dirty_collection: bool,
        previous_state: Option<Snapshot>,
        previous_version: Option<Version>,
        next_version: Option<Version>,
        persister: Arc<dyn EntityPersister>,
    ) -> Self {
        Self {
            entity,
            id,
            state,
            dirty_properties,
            has_dirty_collection,
            previous_state,
            previous_version,
            next_version,
            persister,
        }
    }

    /// Returns the instance.
    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Returns the dirty property indices; `None` when unknown.
    #[must_use]
    pub fn dirty_properties(&self) -> Option<&[usize]> {
        self.dirty_properties.as_deref()
    }

    /// Returns true if a dirty collection triggered the update.
    #[must_use]
    pub const fn has_dirty_collection(&self) -> bool {
        self.has_dirty_collection
    }

    /// Returns the state before the update, if known.
    #[must_use]
    pub fn previous_state(&self) -> Option<&Snapshot> {
        self.previous_state.as_ref()
    }

    /// Returns the version the update is checked against.
    #[must_use]
    pub const fn previous_version(&self) -> Option<Version> {
        self.previous_version
    }

    /// Returns the version written by the update.
    #[must_use]
    pub const fn next_version(&self) -> Option<Version> {
        self.next_version
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metamodel().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let meta = self.persister.metamodel();
        let row = hydrate::dehydrate(&self.state, meta)?;
        let region = session.entity_region(self.persister.as_ref());
        let cache_key = CacheKey::new(meta.name(), self.id.clone());
        let persister = &self.persister;
        let (id, dirty, previous_version) = (&self.id, self.dirty_properties.as_deref(), self.previous_version);
        let result = coordinator::with_soft_lock(region.as_ref(), &cache_key, previous_version, || {
            persister.update(id, &row, dirty, previous_version)?;
            if let Some(region) = &region {
                region.evict(&cache_key)?;
            }
            Ok(())
        });
        if let Err(err) = &result {
            record_optimistic_failure(session, err);
        }
        result?;
        session.statistics().record_entity_update();
        tracing::trace!(
            entity = %cache_key,
            previous = ?self.previous_version,
            next = ?self.next_version,
            "updated"
        );
        let snapshot = Snapshot::capture(&self.state);
        entry_after_execution(session, &self.entity)?.post_update(&self.entity, snapshot, self.next_version);
        Ok(())
    }
}

impl fmt::Debug for EntityUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityUpdateAction[{}#{}]", self.persister.entity_name(), self.id)
    }
}

/// Delete of a removed instance.
pub struct EntityDeleteAction {
    entity: EntityRef,
    id: Identifier,
    version: Option<Version>,
    state: Vec<Value>,
    orphan_removal: bool,
    persister: Arc<dyn EntityPersister>,
}

impl EntityDeleteAction {
    pub(crate) fn new(
        entity: EntityRef,
        id: Identifier,
        version: Option<Version>,
        state: Vec<Value>,
        orphan_removal: bool,
        persister: Arc<dyn EntityPersister>,
    ) -> Self {
        Self {
            entity,
            id,
            version,
            state,
            orphan_removal,
            persister,
        }
    }

    /// Returns the instance.
    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Returns the state at deletion time.
    #[must_use]
    pub fn state(&self) -> &[Value] {
        &self.state
    }

    /// Returns true if the delete removes an orphan.
    #[must_use]
    pub const fn is_orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    pub(crate) fn spaces(&self) -> &[String] {
        self.persister.metamodel().spaces()
    }

    pub(crate) fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        session.check_cancelled()?;
        let meta = self.persister.metamodel();
        let region = session.entity_region(self.persister.as_ref());
        let owned = session.owned_collection_persisters(meta)?;
        let cache_key = CacheKey::new(meta.name(), self.id.clone());
        let persister = &self.persister;
        let (id, version) = (&self.id, self.version);
        let result = coordinator::with_soft_lock(region.as_ref(), &cache_key, version, || {
            persister.delete(id, version)?;
            coordinator::evict_entity_and_collections(region.as_ref(), &cache_key, &owned)
        });
        if let Err(err) = &result {
            record_optimistic_failure(session, err);
        }
        result?;
        session.statistics().record_entity_delete();
        tracing::trace!(entity = %cache_key, orphan = self.orphan_removal, "deleted");
        entry_after_execution(session, &self.entity)?.post_delete()
    }
}

impl fmt::Debug for EntityDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityDeleteAction[{}#{}]", self.persister.entity_name(), self.id)
    }
}
