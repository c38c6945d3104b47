//! Propagation of operations across associations.
//!
//! A cascade walks the properties of one parent instance and re-issues the
//! operation on every associated instance whose mapping enables it. The
//! cascade point picks the associations: many-to-one references before an
//! insert, collections after it. Instances already visited by the current
//! top-level operation are skipped, so cyclic graphs terminate.

mod style;

pub use style::{CascadePoint, CascadeStyle, CascadingAction};

use crate::collection::{self, CollectionRef};
use crate::entity::{EntityHandle, EntityRef};
use crate::error::CoreResult;
use crate::event::{
    DeleteEvent, EvictEvent, LockEvent, MergeEvent, OperationContext, PersistEvent, RefreshEvent,
    SaveKind, SaveOrUpdateEvent,
};
use crate::lock::LockOptions;
use crate::metadata::{EntityMetamodel, PropertyType};
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::value::Value;
use std::sync::Arc;

/// One cascade: an action applied at a point of the parent's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    action: CascadingAction,
    point: CascadePoint,
}

impl Cascade {
    /// Creates a cascade.
    #[must_use]
    pub const fn new(action: CascadingAction, point: CascadePoint) -> Self {
        Self { action, point }
    }

    /// Returns the cascaded action.
    #[must_use]
    pub const fn action(&self) -> CascadingAction {
        self.action
    }

    /// Returns the cascade point.
    #[must_use]
    pub const fn point(&self) -> CascadePoint {
        self.point
    }

    /// Cascades to every association of `parent` enabled for the action.
    pub(crate) fn cascade(
        &self,
        session: &mut Session,
        persister: &Arc<dyn EntityPersister>,
        parent: &EntityRef,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let meta = persister.metamodel();
        if !meta.has_cascades() {
            return Ok(());
        }
        session.check_cancelled()?;
        tracing::trace!(action = %self.action, point = ?self.point, entity = ?parent, "processing cascade");
        session.context_mut().increment_cascade_level();
        let result = self.cascade_properties(session, meta, parent, ctx);
        session.context_mut().decrement_cascade_level();
        result
    }

    fn cascade_properties(
        &self,
        session: &mut Session,
        meta: &EntityMetamodel,
        parent: &EntityRef,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        for (index, property) in meta.properties().iter().enumerate() {
            let style = property.cascade_style();
            if !style.does_cascade(self.action) {
                continue;
            }
            match (property.ty(), parent.get(index)) {
                (PropertyType::ManyToOne { .. }, Value::Entity(child)) if self.point.cascades_to_parents() => {
                    self.cascade_to_one(session, &child, false, ctx)?;
                }
                (PropertyType::Collection { .. }, Value::Collection(children))
                    if self.point.cascades_to_children() =>
                {
                    self.cascade_collection(session, &children, style, ctx)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn cascade_collection(
        &self,
        session: &mut Session,
        children: &CollectionRef,
        style: CascadeStyle,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        if !children.is_initialized() {
            if !self.action.initializes_lazy_children() {
                return Ok(());
            }
            session.initialize_collection(children)?;
        }
        for element in children.loaded_elements() {
            if let Value::Entity(child) = element {
                self.cascade_to_one(session, &child, false, ctx)?;
            }
        }
        if style.has_orphan_delete() && self.action.deletes_orphans() {
            self.delete_orphans(session, children, ctx)?;
        }
        Ok(())
    }

    fn delete_orphans(
        &self,
        session: &mut Session,
        children: &CollectionRef,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let Some(snapshot) = session
            .persistence_context()
            .get_collection_entry(children)
            .and_then(|entry| entry.snapshot().map(<[Value]>::to_vec))
        else {
            return Ok(());
        };
        for orphan in collection::orphans(&snapshot, &children.loaded_elements()) {
            tracing::debug!(orphan = ?orphan, "deleting orphan");
            self.cascade_to_one(session, &orphan, true, ctx)?;
        }
        Ok(())
    }

    fn cascade_to_one(
        &self,
        session: &mut Session,
        child: &EntityHandle,
        orphan: bool,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        if orphan {
            let mut event = DeleteEvent {
                entity: child.clone(),
                orphan_removal: true,
            };
            return session.fire_delete(&mut event, ctx);
        }
        match self.action {
            CascadingAction::Delete => {
                if let Some(entity) = child.peek_implementation() {
                    if !ctx.mark_visited(&entity) {
                        return Ok(());
                    }
                }
                let mut event = DeleteEvent {
                    entity: child.clone(),
                    orphan_removal: false,
                };
                session.fire_delete(&mut event, ctx)
            }
            CascadingAction::Evict => {
                let mut event = EvictEvent { entity: child.clone() };
                session.fire_evict(&mut event, ctx)
            }
            _ => {
                // an uninitialized placeholder stands for a row that is
                // already stored; only make sure the session knows it
                let Some(entity) = child.peek_implementation() else {
                    if let EntityHandle::Proxy(proxy) = child {
                        session.context_mut().reassociate_proxy(proxy)?;
                    }
                    return Ok(());
                };
                if self.action != CascadingAction::Merge && !ctx.mark_visited(&entity) {
                    return Ok(());
                }
                self.cascade_to_entity(session, entity, ctx)
            }
        }
    }

    fn cascade_to_entity(
        &self,
        session: &mut Session,
        entity: EntityRef,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        tracing::trace!(action = %self.action, child = ?entity, "cascading");
        match self.action {
            CascadingAction::SaveUpdate => {
                let mut event = SaveOrUpdateEvent::new(entity, SaveKind::SaveOrUpdate);
                session.fire_save_or_update(&mut event, ctx)
            }
            CascadingAction::Persist | CascadingAction::PersistOnFlush => {
                let mut event = PersistEvent {
                    entity,
                    on_flush: self.action == CascadingAction::PersistOnFlush,
                };
                session.fire_persist(&mut event, ctx)
            }
            CascadingAction::Merge => {
                let mut event = MergeEvent::new(entity);
                session.fire_merge(&mut event, ctx)
            }
            CascadingAction::Lock => {
                let lock_options = ctx.lock_options().cloned().unwrap_or_else(LockOptions::none);
                let mut event = LockEvent { entity, lock_options };
                session.fire_lock(&mut event, ctx)
            }
            CascadingAction::Refresh => {
                let lock_options = ctx.lock_options().cloned().unwrap_or_else(LockOptions::none);
                let mut event = RefreshEvent { entity, lock_options };
                session.fire_refresh(&mut event, ctx)
            }
            CascadingAction::Delete | CascadingAction::Evict => Ok(()),
        }
    }
}
