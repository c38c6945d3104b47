//! Flush, auto-flush and the dirty check.
//!
//! A flush runs in two phases. Planning cascades the configured flush
//! action, dirty-checks every tracked instance and turns collection changes
//! into actions; execution runs the queue. Auto-flush and the dirty check
//! plan the same way but may throw the plan away.

use super::{
    AutoFlushEvent, AutoFlushEventListener, DirtyCheckEvent, DirtyCheckEventListener, FlushEntityEvent,
    FlushEvent, FlushEventListener, OperationContext,
};
use crate::action::{
    Action, ActionQueue, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
};
use crate::cascade::{Cascade, CascadePoint};
use crate::config::FlushMode;
use crate::engine::collections;
use crate::entity::Status;
use crate::error::CoreResult;
use crate::session::Session;
use crate::value::Value;
use std::sync::Arc;

/// What a flush planned.
///
/// Counts are taken from the queue before it runs. A flush that returns a
/// report ran every planned action, since the first failing action aborts it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Tracked instances dirty-checked.
    pub entities_flushed: usize,
    /// Tracked collections processed.
    pub collections_flushed: usize,
    /// Inserts planned.
    pub inserts: usize,
    /// Updates planned.
    pub updates: usize,
    /// Deletes planned.
    pub deletes: usize,
    /// Collection recreations planned.
    pub collection_recreates: usize,
    /// Collection updates planned.
    pub collection_updates: usize,
    /// Collection removals planned.
    pub collection_removals: usize,
}

impl FlushReport {
    fn count_queue(&mut self, queue: &ActionQueue) {
        self.inserts = queue.insertion_count();
        self.updates = queue.update_count();
        self.deletes = queue.deletion_count();
        self.collection_recreates = queue.collection_creation_count();
        self.collection_updates = queue.collection_update_count();
        self.collection_removals = queue.collection_removal_count();
    }

    /// Returns the total number of planned writes.
    #[must_use]
    pub const fn total_actions(&self) -> usize {
        self.inserts
            + self.updates
            + self.deletes
            + self.collection_recreates
            + self.collection_updates
            + self.collection_removals
    }
}

/// Plans a flush: cascades, dirty checks and collection actions.
pub(crate) fn flush_everything_to_executions(session: &mut Session) -> CoreResult<FlushReport> {
    tracing::trace!("flushing session");
    session.action_queue().check_no_unresolved_actions_before_operation()?;
    let entities = session.persistence_context().entities_in_order();
    session.interceptor().pre_flush(&entities);

    prepare_entity_flushes(session)?;
    prepare_collection_flushes(session);

    session.context_mut().set_flushing(true);
    let planned = flush_entities(session).and_then(|entities_flushed| {
        collections::flush_unreachable_collections(session);
        let collections_flushed = flush_collections(session)?;
        Ok((entities_flushed, collections_flushed))
    });
    session.context_mut().set_flushing(false);
    let (entities_flushed, collections_flushed) = planned?;

    let mut report = FlushReport {
        entities_flushed,
        collections_flushed,
        ..FlushReport::default()
    };
    report.count_queue(session.action_queue());
    tracing::debug!(
        inserts = report.inserts,
        updates = report.updates,
        deletes = report.deletes,
        collection_recreates = report.collection_recreates,
        collection_updates = report.collection_updates,
        collection_removals = report.collection_removals,
        "flushed {} entities and {} collections",
        report.entities_flushed,
        report.collections_flushed
    );
    Ok(report)
}

/// Cascades the flush action from every live tracked instance.
fn prepare_entity_flushes(session: &mut Session) -> CoreResult<()> {
    let action = session.settings().flush_cascade;
    let cascade = Cascade::new(action, CascadePoint::BeforeFlush);
    let mut ctx = OperationContext::new();
    for entity in session.persistence_context().entities_in_order() {
        let persister = match session.persistence_context().get_entry(&entity) {
            Some(entry) if matches!(entry.status(), Status::Managed | Status::Saving | Status::ReadOnly) => {
                Arc::clone(entry.persister())
            }
            _ => continue,
        };
        cascade.cascade(session, &persister, &entity, &mut ctx)?;
    }
    session.action_queue().check_no_unresolved_actions_after_operation()
}

fn prepare_collection_flushes(session: &mut Session) {
    for collection in session.persistence_context().collections_in_order() {
        if let Some(entry) = session.context_mut().get_collection_entry_mut(&collection) {
            entry.pre_flush(&collection);
        }
    }
}

fn flush_entities(session: &mut Session) -> CoreResult<usize> {
    let mut count = 0;
    for entity in session.persistence_context().entities_in_order() {
        let flushable = session
            .persistence_context()
            .get_entry(&entity)
            .map_or(false, |entry| !matches!(entry.status(), Status::Gone | Status::Saving));
        if !flushable {
            continue;
        }
        session.check_cancelled()?;
        let mut event = FlushEntityEvent::new(entity);
        session.fire_flush_entity(&mut event)?;
        count += 1;
    }
    Ok(count)
}

fn flush_collections(session: &mut Session) -> CoreResult<usize> {
    let mut count = 0;
    for collection in session.persistence_context().collections_in_order() {
        let Some(entry) = session.persistence_context().get_collection_entry(&collection) else {
            continue;
        };
        if entry.processed {
            continue;
        }
        let loaded_role = entry.role().map(str::to_string);
        let loaded_key = entry.loaded_key().cloned();
        let current_role = entry.current_role.clone();
        let current_key = entry.current_key.clone();
        let snapshot = entry.snapshot().map(<[Value]>::to_vec).unwrap_or_default();
        let snapshot_empty = entry.is_snapshot_empty();
        let (do_remove, do_recreate, do_update) = (entry.do_remove, entry.do_recreate, entry.do_update);

        if do_remove {
            if let (Some(role), Some(key)) = (&loaded_role, &loaded_key) {
                let persister = session.collection_persister(role)?;
                session.action_queue_mut().add_action(Action::CollectionRemove(CollectionRemoveAction::new(
                    Some(collection.clone()),
                    key.clone(),
                    snapshot_empty,
                    persister,
                )));
            }
        }
        if do_recreate {
            if let (Some(role), Some(key)) = (&current_role, &current_key) {
                let persister = session.collection_persister(role)?;
                session.action_queue_mut().add_action(Action::CollectionRecreate(
                    CollectionRecreateAction::new(collection.clone(), key.clone(), persister),
                ));
            }
        }
        if do_update {
            if let (Some(role), Some(key)) = (&loaded_role, &loaded_key) {
                let persister = session.collection_persister(role)?;
                session.action_queue_mut().add_action(Action::CollectionUpdate(CollectionUpdateAction::new(
                    collection.clone(),
                    key.clone(),
                    snapshot,
                    persister,
                )));
            }
        }
        if let Some(entry) = session.context_mut().get_collection_entry_mut(&collection) {
            entry.processed = true;
        }
        count += 1;
    }
    Ok(count)
}

/// Executes the planned actions and completes the flush.
pub(crate) fn perform_executions(session: &mut Session) -> CoreResult<()> {
    ActionQueue::execute_actions(session)?;
    session.context_mut().post_flush();
    let entities = session.persistence_context().entities_in_order();
    session.interceptor().post_flush(&entities);
    Ok(())
}

/// Default handler of explicit flushes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFlushEventListener;

impl FlushEventListener for DefaultFlushEventListener {
    fn on_flush(&self, session: &mut Session, event: &mut FlushEvent) -> CoreResult<()> {
        let report = flush_everything_to_executions(session)?;
        perform_executions(session)?;
        session.statistics().record_flush();
        event.report = report;
        Ok(())
    }
}

/// Default handler of auto-flushes.
///
/// Pending writes are executed only if one of them touches a queried space,
/// or the flush mode is [`FlushMode::Always`]. Otherwise the plan is
/// dropped, keeping the inserts and deletes queued by earlier calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAutoFlushEventListener;

impl AutoFlushEventListener for DefaultAutoFlushEventListener {
    fn on_auto_flush(&self, session: &mut Session, event: &mut AutoFlushEvent) -> CoreResult<()> {
        let mode = session.flush_mode();
        if !mode.flushes_before_query() {
            return Ok(());
        }
        let previous_removals = session.action_queue().collection_removal_count();
        flush_everything_to_executions(session)?;
        if mode == FlushMode::Always || session.action_queue().are_tables_to_be_updated(&event.spaces) {
            tracing::trace!(spaces = ?event.spaces, "auto-flush needed");
            perform_executions(session)?;
            session.statistics().record_flush();
            event.flush_required = true;
        } else {
            tracing::trace!(spaces = ?event.spaces, "auto-flush not needed");
            session.action_queue_mut().clear_from_flush_needed_check(previous_removals);
        }
        Ok(())
    }
}

/// Default handler of the dirty check.
///
/// Plans a flush, reports whether anything would be written, and drops the
/// plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDirtyCheckEventListener;

impl DirtyCheckEventListener for DefaultDirtyCheckEventListener {
    fn on_dirty_check(&self, session: &mut Session, event: &mut DirtyCheckEvent) -> CoreResult<()> {
        let previous_removals = session.action_queue().collection_removal_count();
        let planned = flush_everything_to_executions(session);
        event.dirty = session.action_queue().has_any_queued_actions();
        session.action_queue_mut().clear_from_flush_needed_check(previous_removals);
        planned.map(|_| ())
    }
}
