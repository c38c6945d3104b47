//! Lifecycle interceptor.

use crate::entity::EntityRef;
use crate::error::CoreResult;
use crate::metadata::EntityMetamodel;
use crate::types::Identifier;
use crate::value::Value;

/// Application callbacks around entity lifecycle events.
///
/// Callbacks that receive `&mut [Value]` may modify the state; they return
/// true when they did, so the engine writes the change back to the instance.
/// Every method has a no-op default.
pub trait Interceptor: Send + Sync {
    /// Called after a row was hydrated, before the instance is initialized.
    ///
    /// # Errors
    ///
    /// An error aborts the load.
    fn on_load(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        state: &mut [Value],
        meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        let _ = (entity, id, state, meta);
        Ok(false)
    }

    /// Called before an insert is scheduled.
    ///
    /// # Errors
    ///
    /// An error aborts the save.
    fn on_save(
        &self,
        entity: &EntityRef,
        id: Option<&Identifier>,
        state: &mut [Value],
        meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        let _ = (entity, id, state, meta);
        Ok(false)
    }

    /// Called when the flush found the instance dirty.
    ///
    /// # Errors
    ///
    /// An error aborts the flush.
    fn on_flush_dirty(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        current: &mut [Value],
        previous: Option<&[Value]>,
        meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        let _ = (entity, id, current, previous, meta);
        Ok(false)
    }

    /// Called before a delete is scheduled.
    ///
    /// # Errors
    ///
    /// An error aborts the delete.
    fn on_delete(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        state: &[Value],
        meta: &EntityMetamodel,
    ) -> CoreResult<()> {
        let _ = (entity, id, state, meta);
        Ok(())
    }

    /// Overrides dirty checking; `None` falls back to property comparison.
    fn find_dirty(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        current: &[Value],
        previous: Option<&[Value]>,
        meta: &EntityMetamodel,
    ) -> Option<Vec<usize>> {
        let _ = (entity, id, current, previous, meta);
        None
    }

    /// Overrides the transient check; `None` falls back to the policy chain.
    fn is_transient(&self, entity: &EntityRef) -> Option<bool> {
        let _ = entity;
        None
    }

    /// Called before a flush walks the registry.
    fn pre_flush(&self, entities: &[EntityRef]) {
        let _ = entities;
    }

    /// Called after a flush executed its actions.
    fn post_flush(&self, entities: &[EntityRef]) {
        let _ = entities;
    }
}

/// Interceptor that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {}
