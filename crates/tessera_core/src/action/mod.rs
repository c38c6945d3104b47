//! Queued store writes.
//!
//! A flush turns the registry into a list of actions and executes them in a
//! fixed order: inserts, updates, collection removals, collection updates,
//! collection recreations and finally deletes. Inserts whose non-nullable
//! references are still unsaved wait in [`UnresolvedInserts`] until the
//! referenced instances are saved.

mod collection;
mod entity;
mod sorter;
mod unresolved;

pub use collection::{CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction};
pub use entity::{EntityDeleteAction, EntityIdentityInsertAction, EntityInsertAction, EntityUpdateAction};
pub use unresolved::UnresolvedInserts;

use crate::engine::{foreign_keys, nullability};
use crate::entity::{EntityRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::value::{Snapshot, Value};
use crate::versioning;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Kind of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Entity insert.
    Insert,
    /// Entity insert with a store-generated identifier.
    IdentityInsert,
    /// Entity update.
    Update,
    /// Entity delete.
    Delete,
    /// Collection recreation.
    CollectionRecreate,
    /// Collection element update.
    CollectionUpdate,
    /// Collection removal.
    CollectionRemove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One store write.
pub enum Action {
    /// Insert with a known identifier.
    Insert(EntityInsertAction),
    /// Insert with a store-generated identifier.
    IdentityInsert(EntityIdentityInsertAction),
    /// Update.
    Update(EntityUpdateAction),
    /// Delete.
    Delete(EntityDeleteAction),
    /// Collection recreation.
    CollectionRecreate(CollectionRecreateAction),
    /// Collection element update.
    CollectionUpdate(CollectionUpdateAction),
    /// Collection removal.
    CollectionRemove(CollectionRemoveAction),
}

impl Action {
    /// Returns the kind.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Insert(_) => ActionKind::Insert,
            Self::IdentityInsert(_) => ActionKind::IdentityInsert,
            Self::Update(_) => ActionKind::Update,
            Self::Delete(_) => ActionKind::Delete,
            Self::CollectionRecreate(_) => ActionKind::CollectionRecreate,
            Self::CollectionUpdate(_) => ActionKind::CollectionUpdate,
            Self::CollectionRemove(_) => ActionKind::CollectionRemove,
        }
    }

    /// Returns the instance of an entity action.
    #[must_use]
    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Insert(a) => Some(a.entity()),
            Self::IdentityInsert(a) => Some(a.entity()),
            Self::Update(a) => Some(a.entity()),
            Self::Delete(a) => Some(a.entity()),
            _ => None,
        }
    }

    /// Returns the query spaces the action writes to.
    #[must_use]
    pub fn spaces(&self) -> &[String] {
        match self {
            Self::Insert(a) => a.spaces(),
            Self::IdentityInsert(a) => a.spaces(),
            Self::Update(a) => a.spaces(),
            Self::Delete(a) => a.spaces(),
            Self::CollectionRecreate(a) => a.spaces(),
            Self::CollectionUpdate(a) => a.spaces(),
            Self::CollectionRemove(a) => a.spaces(),
        }
    }

    fn execute(&mut self, session: &mut Session) -> CoreResult<()> {
        match self {
            Self::Insert(a) => a.execute(session),
            Self::IdentityInsert(a) => a.execute(session),
            Self::Update(a) => a.execute(session),
            Self::Delete(a) => a.execute(session),
            Self::CollectionRecreate(a) => a.execute(session),
            Self::CollectionUpdate(a) => a.execute(session),
            Self::CollectionRemove(a) => a.execute(session),
        }
    }

    /// Instance, persister and early-insert flag of an insert.
    fn insert_target(&self) -> CoreResult<(EntityRef, Arc<dyn EntityPersister>, bool)> {
        match self {
            Self::Insert(a) => Ok((a.entity().clone(), Arc::clone(a.persister()), false)),
            Self::IdentityInsert(a) => Ok((a.entity().clone(), Arc::clone(a.persister()), true)),
            other => Err(CoreError::assertion_failure(format!("{other:?} is not an insert"))),
        }
    }

    fn insert_state_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Self::Insert(a) => Some(a.state_mut()),
            Self::IdentityInsert(a) => Some(a.state_mut()),
            _ => None,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert(a) => fmt::Debug::fmt(a, f),
            Self::IdentityInsert(a) => fmt::Debug::fmt(a, f),
            Self::Update(a) => fmt::Debug::fmt(a, f),
            Self::Delete(a) => fmt::Debug::fmt(a, f),
            Self::CollectionRecreate(a) => fmt::Debug::fmt(a, f),
            Self::CollectionUpdate(a) => fmt::Debug::fmt(a, f),
            Self::CollectionRemove(a) => fmt::Debug::fmt(a, f),
        }
    }
}

/// Work deferred to the end of the transaction by optimistic lock modes.
#[derive(Debug, Clone)]
pub(crate) enum BeforeCompletion {
    /// Re-read the version and fail if another unit of work changed it.
    VerifyVersion(EntityRef),
    /// Bump the version even though nothing changed.
    IncrementVersion(EntityRef),
}

#[derive(Clone, Copy)]
enum Category {
    Insertions,
    Updates,
    CollectionRemovals,
    CollectionUpdates,
    CollectionCreations,
    Deletions,
}

const EXECUTION_ORDER: [Category; 6] = [
    Category::Insertions,
    Category::Updates,
    Category::CollectionRemovals,
    Category::CollectionUpdates,
    Category::CollectionCreations,
    Category::Deletions,
];

/// Pending store writes of one unit of work.
#[derive(Default)]
pub struct ActionQueue {
    insertions: Vec<Action>,
    updates: Vec<Action>,
    collection_removals: Vec<Action>,
    collection_updates: Vec<Action>,
    collection_creations: Vec<Action>,
    deletions: Vec<Action>,
    unresolved: UnresolvedInserts,
    before_completion: Vec<BeforeCompletion>,
}

impl ActionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, category: Category) -> &Vec<Action> {
        match category {
            Category::Insertions => &self.insertions,
            Category::Updates => &self.updates,
            Category::CollectionRemovals => &self.collection_removals,
            Category::CollectionUpdates => &self.collection_updates,
            Category::CollectionCreations => &self.collection_creations,
            Category::Deletions => &self.deletions,
        }
    }

    fn list_mut(&mut self, category: Category) -> &mut Vec<Action> {
        match category {
            Category::Insertions => &mut self.insertions,
            Category::Updates => &mut self.updates,
            Category::CollectionRemovals => &mut self.collection_removals,
            Category::CollectionUpdates => &mut self.collection_updates,
            Category::CollectionCreations => &mut self.collection_creations,
            Category::Deletions => &mut self.deletions,
        }
    }

    /// Queues a resolved action.
    pub(crate) fn add_action(&mut self, action: Action) {
        let category = match action.kind() {
            ActionKind::Insert | ActionKind::IdentityInsert => Category::Insertions,
            ActionKind::Update => Category::Updates,
            ActionKind::Delete => Category::Deletions,
            ActionKind::CollectionRecreate => Category::CollectionCreations,
            ActionKind::CollectionUpdate => Category::CollectionUpdates,
            ActionKind::CollectionRemove => Category::CollectionRemovals,
        };
        tracing::trace!(action = ?action, "action queued");
        self.list_mut(category).push(action);
    }

    /// Returns the number of queued inserts.
    #[must_use]
    pub fn insertion_count(&self) -> usize {
        self.insertions.len()
    }

    /// Returns the number of queued updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// Returns the number of queued deletes.
    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.deletions.len()
    }

    /// Returns the number of queued collection recreations.
    #[must_use]
    pub fn collection_creation_count(&self) -> usize {
        self.collection_creations.len()
    }

    /// Returns the number of queued collection updates.
    #[must_use]
    pub fn collection_update_count(&self) -> usize {
        self.collection_updates.len()
    }

    /// Returns the number of queued collection removals.
    #[must_use]
    pub fn collection_removal_count(&self) -> usize {
        self.collection_removals.len()
    }

    /// Returns the parked inserts.
    #[must_use]
    pub fn unresolved_inserts(&self) -> &UnresolvedInserts {
        &self.unresolved
    }

    /// Returns the queued actions in execution order.
    pub fn queued(&self) -> impl Iterator<Item = &Action> + '_ {
        EXECUTION_ORDER
            .iter()
            .flat_map(move |category| self.list(*category).iter())
    }

    /// Returns the kinds of the queued actions in execution order.
    #[must_use]
    pub fn queued_kinds(&self) -> Vec<ActionKind> {
        self.queued().map(Action::kind).collect()
    }

    /// Returns true if any write is queued or parked.
    #[must_use]
    pub fn has_any_queued_actions(&self) -> bool {
        EXECUTION_ORDER
            .iter()
            .any(|category| !self.list(*category).is_empty())
            || !self.unresolved.is_empty()
    }

    /// Returns true if a queued action writes to one of `spaces`.
    #[must_use]
    pub fn are_tables_to_be_updated(&self, spaces: &[String]) -> bool {
        self.queued()
            .any(|action| action.spaces().iter().any(|space| spaces.contains(space)))
    }

    /// Drops the actions a speculative flush queued.
    ///
    /// Inserts and deletes are kept: they were queued by save and delete
    /// calls, not by the flush itself.
    pub(crate) fn clear_from_flush_needed_check(&mut self, previous_collection_removals: usize) {
        self.updates.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        self.collection_removals.truncate(previous_collection_removals);
    }

    fn clear_pending(&mut self) {
        for category in EXECUTION_ORDER {
            self.list_mut(category).clear();
        }
    }

    /// Drops everything, including parked inserts and deferred checks.
    pub(crate) fn clear(&mut self) {
        self.clear_pending();
        self.unresolved.clear();
        self.before_completion.clear();
    }

    pub(crate) fn register_before_completion(&mut self, process: BeforeCompletion) {
        self.before_completion.push(process);
    }

    /// Fails if an insert is still parked when a flush starts.
    pub(crate) fn check_no_unresolved_actions_before_operation(&self) -> CoreResult<()> {
        if self.unresolved.is_empty() {
            Ok(())
        } else {
            Err(CoreError::assertion_failure(format!(
                "flushing with {} unresolved insert(s) parked",
                self.unresolved.len()
            )))
        }
    }

    /// Fails if a top-level operation left an insert parked.
    pub(crate) fn check_no_unresolved_actions_after_operation(&self) -> CoreResult<()> {
        match self.unresolved.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // === Insert resolution ===

    /// Queues an insert, or parks it while a non-nullable reference is unsaved.
    pub(crate) fn add_insert_action(session: &mut Session, action: Action) -> CoreResult<()> {
        let (_, persister, early_insert) = action.insert_target()?;
        let state = match &action {
            Action::Insert(a) => a.state(),
            Action::IdentityInsert(a) => a.state(),
            _ => &[],
        };
        let dependencies = foreign_keys::find_non_nullable_transient_entities(
            session,
            state,
            persister.metamodel(),
            early_insert,
        )?;
        if dependencies.is_empty() {
            Self::add_resolved_insert_action(session, action)
        } else {
            session.action_queue_mut().unresolved.park(action, dependencies);
            Ok(())
        }
    }

    fn add_resolved_insert_action(session: &mut Session, mut action: Action) -> CoreResult<()> {
        let (entity, persister, early_insert) = action.insert_target()?;
        let meta = persister.metamodel();
        let state = action
            .insert_state_mut()
            .ok_or_else(|| CoreError::assertion_failure("insert without state"))?;
        foreign_keys::nullify_transient_references(session, state, meta, early_insert)?;
        if session.settings().check_nullability {
            nullability::check_nullability(state, meta, false)?;
        }
        let snapshot = Snapshot::capture(state);
        let version = versioning::get_version(state, meta);
        let entry = session.context_mut().get_entry_mut(&entity).ok_or_else(|| {
            CoreError::assertion_failure(format!("insert of untracked instance {entity:?}"))
        })?;
        if meta.is_mutable() {
            entry.set_status(Status::Managed)?;
            entry.set_loaded_state(Some(snapshot));
        } else {
            entry.set_status(Status::ReadOnly)?;
        }
        entry.set_version(version);
        entry.set_lock_mode(LockMode::Write);

        if let Action::IdentityInsert(_) = action {
            Self::execute_inserts(session)?;
            action.execute(session)?;
        } else {
            session.action_queue_mut().add_action(action);
        }

        let released = session.action_queue_mut().unresolved.resolve_dependents(&entity);
        for dependent in released {
            tracing::debug!(action = ?dependent, "parked insert resolved");
            Self::add_resolved_insert_action(session, dependent)?;
        }
        Ok(())
    }

    /// Re-evaluates the parked insert of `entity` against its current state.
    pub(crate) fn retry_unresolved_insert(session: &mut Session, entity: &EntityRef) -> CoreResult<()> {
        let Some(mut action) = session.action_queue_mut().unresolved.take(entity) else {
            return Ok(());
        };
        if let Some(state) = action.insert_state_mut() {
            *state = entity.values();
        }
        Self::add_insert_action(session, action)
    }

    // === Execution ===

    fn execute_list(session: &mut Session, actions: Vec<Action>) -> CoreResult<()> {
        for mut action in actions {
            if let Err(err) = action.execute(session) {
                tracing::debug!(action = ?action, error = %err, "action failed; dropping the rest of the queue");
                session.action_queue_mut().clear_pending();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Executes the queued inserts only.
    pub(crate) fn execute_inserts(session: &mut Session) -> CoreResult<()> {
        let inserts = mem::take(&mut session.action_queue_mut().insertions);
        Self::execute_list(session, inserts)
    }

    /// Executes every queued action in order.
    ///
    /// The first failure aborts execution and drops the remaining actions;
    /// actions already executed are not undone.
    pub(crate) fn execute_actions(session: &mut Session) -> CoreResult<()> {
        session.action_queue().check_no_unresolved_actions_before_operation()?;
        if session.settings().order_inserts {
            let queue = session.action_queue_mut();
            queue.insertions = sorter::sort_insertions(mem::take(&mut queue.insertions));
        }
        for category in EXECUTION_ORDER {
            let actions = mem::take(session.action_queue_mut().list_mut(category));
            Self::execute_list(session, actions)?;
        }
        Ok(())
    }

    /// Runs the version checks and increments deferred by optimistic locks.
    pub(crate) fn before_transaction_completion(session: &mut Session) -> CoreResult<()> {
        let processes = mem::take(&mut session.action_queue_mut().before_completion);
        for process in processes {
            let (BeforeCompletion::VerifyVersion(entity) | BeforeCompletion::IncrementVersion(entity)) =
                &process;
            let Some(entry) = session.persistence_context().get_entry(entity) else {
                continue;
            };
            if !entry.exists_in_database() || entry.status().is_deleted_or_gone() {
                continue;
            }
            let persister = Arc::clone(entry.persister());
            let version = entry.version();
            let Some(id) = entry.id().cloned() else {
                continue;
            };
            session.check_cancelled()?;
            let name = persister.entity_name().to_string();
            match process {
                BeforeCompletion::VerifyVersion(entity) => {
                    let current = persister.current_version(&id)?;
                    if current != version {
                        session.statistics().record_optimistic_failure();
                        tracing::debug!(entity = ?entity, ?current, expected = ?version, "version check failed");
                        return Err(CoreError::stale_state(name, id));
                    }
                }
                BeforeCompletion::IncrementVersion(entity) => {
                    let version = version.ok_or_else(|| {
                        CoreError::assertion_failure(format!("forced increment of unversioned {name}"))
                    })?;
                    let next = match persister.force_version_increment(&id, version) {
                        Ok(next) => next,
                        Err(err) => {
                            if err.is_optimistic_failure() {
                                session.statistics().record_optimistic_failure();
                            }
                            return Err(err);
                        }
                    };
                    if let Some(entry) = session.context_mut().get_entry_mut(&entity) {
                        entry.force_locked(&entity, next);
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("insertions", &self.insertions)
            .field("updates", &self.updates)
            .field("collection_removals", &self.collection_removals)
            .field("collection_updates", &self.collection_updates)
            .field("collection_creations", &self.collection_creations)
            .field("deletions", &self.deletions)
            .field("unresolved", &self.unresolved)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entity_persister, order_metamodel};
    use crate::types::Identifier;

    fn order(id: i64) -> (EntityRef, Identifier, Vec<Value>) {
        let state = vec![Value::from("NEW"), Value::Null, Value::Null, Value::from(0)];
        let id = Identifier::from(id);
        (EntityRef::with_identifier("Order", id.clone(), state.clone()), id, state)
    }

    fn queue() -> ActionQueue {
        let persister = entity_persister(order_metamodel());
        let mut queue = ActionQueue::new();
        let (deleted, id, state) = order(1);
        queue.add_action(Action::Delete(EntityDeleteAction::new(
            deleted,
            id,
            None,
            state,
            false,
            Arc::clone(&persister),
        )));
        let (changed, id, state) = order(2);
        queue.add_action(Action::Update(EntityUpdateAction::new(
            changed,
            id,
            state,
            Some(vec![0]),
            false,
            None,
            None,
            None,
            Arc::clone(&persister),
        )));
        let (created, id, state) = order(3);
        queue.add_action(Action::Insert(EntityInsertAction::new(created, id, state, None, persister)));
        queue
    }

    #[test]
    fn actions_run_in_category_order() {
        let queue = queue();
        assert_eq!(
            queue.queued_kinds(),
            vec![ActionKind::Insert, ActionKind::Update, ActionKind::Delete]
        );
        assert!(queue.has_any_queued_actions());
        assert!(queue.are_tables_to_be_updated(&["Order".to_string()]));
        assert!(!queue.are_tables_to_be_updated(&["Customer".to_string()]));
    }

    #[test]
    fn a_speculative_flush_keeps_inserts_and_deletes() {
        let mut queue = queue();
        queue.clear_from_flush_needed_check(0);
        assert_eq!(queue.queued_kinds(), vec![ActionKind::Insert, ActionKind::Delete]);

        queue.clear();
        assert!(!queue.has_any_queued_actions());
        assert!(queue.check_no_unresolved_actions_before_operation().is_ok());
    }
}
