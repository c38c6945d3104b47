//! Merge: copy the state of a possibly detached graph onto managed copies.
//!
//! Every original reached by one merge call maps to exactly one copy in the
//! operation's [`CopyCache`](super::CopyCache). References to originals are
//! rewritten to their copies; a reference to an unsaved instance that was not
//! merged yet gets an empty copy ahead of time, filled in once the cascade
//! reaches it.

use super::save::save_transient;
use super::{
    deleted_instance, entity_state, EntityState, LoadEvent, LoadType, MergeEvent, MergeEventListener,
    OperationContext,
};
use crate::action::ActionQueue;
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::collection::CollectionRef;
use crate::engine::transient;
use crate::entity::{EntityHandle, EntityRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{EntityMetamodel, IdStrategy, PropertyType};
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::types::EntityKey;
use crate::value::Value;
use crate::versioning;
use std::sync::Arc;

/// Default handler of merge.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMergeEventListener;

impl MergeEventListener for DefaultMergeEventListener {
    fn on_merge(
        &self,
        session: &mut Session,
        event: &mut MergeEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let original = event.original.clone();
        if ctx.copy_cache().contains_original(&original) {
            if ctx.copy_cache().is_operated_on(&original) {
                tracing::trace!(entity = ?original, "already in merge process");
                event.result = ctx.copy_cache().get(&original);
                return Ok(());
            }
            tracing::trace!(entity = ?original, "copy created ahead; merging now");
            ctx.copy_cache_mut().set_operated_on(&original, true);
        } else if ctx.copy_cache().contains_copy(&original) {
            tracing::trace!(entity = ?original, "instance is a merge copy");
            event.result = Some(original);
            return Ok(());
        }

        let persister = session.entity_persister(original.entity_name())?;
        match entity_state(session, &original, None)? {
            EntityState::Persistent => entity_is_persistent(session, event, &persister, ctx),
            EntityState::Transient => entity_is_transient(session, event, &persister, ctx),
            EntityState::Detached => entity_is_detached(session, event, &persister, ctx),
            EntityState::Deleted => Err(deleted_instance(session, &original, "merge")),
        }
    }
}

fn entity_is_persistent(
    session: &mut Session,
    event: &mut MergeEvent,
    persister: &Arc<dyn EntityPersister>,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    let entity = event.original.clone();
    tracing::trace!(entity = ?entity, "ignoring persistent instance");
    ctx.copy_cache_mut().put(&entity, &entity, true)?;
    Cascade::new(CascadingAction::Merge, CascadePoint::BeforeMerge).cascade(session, persister, &entity, ctx)?;
    copy_values(session, persister.metamodel(), &entity, &entity, CopyPart::All, ctx)?;
    event.result = Some(entity);
    Ok(())
}

fn entity_is_transient(
    session: &mut Session,
    event: &mut MergeEvent,
    persister: &Arc<dyn EntityPersister>,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    let original = event.original.clone();
    let meta = persister.metamodel();
    tracing::trace!(entity = ?original, "merging transient instance");
    let copy = match ctx.copy_cache().get(&original) {
        Some(copy) => copy,
        None => {
            let copy = EntityRef::new(meta.name(), vec![Value::Null; meta.property_count()]);
            ctx.copy_cache_mut().put(&original, &copy, true)?;
            copy
        }
    };
    let requested_id = match (&event.requested_id, meta.identifier_strategy()) {
        (Some(id), _) => Some(id.clone()),
        (None, IdStrategy::Assigned) => original.identifier(),
        (None, _) => None,
    };

    Cascade::new(CascadingAction::Merge, CascadePoint::BeforeInsertAfterDelete)
        .cascade(session, persister, &original, ctx)?;
    copy_values(session, meta, &original, &copy, CopyPart::NonCollections, ctx)?;
    save_transient(session, &copy, requested_id, None, ctx)?;
    Cascade::new(CascadingAction::Merge, CascadePoint::AfterInsertBeforeDelete)
        .cascade(session, persister, &original, ctx)?;
    copy_values(session, meta, &original, &copy, CopyPart::Collections, ctx)?;
    event.result = Some(copy);
    Ok(())
}

fn entity_is_detached(
    session: &mut Session,
    event: &mut MergeEvent,
    persister: &Arc<dyn EntityPersister>,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    let original = event.original.clone();
    let meta = persister.metamodel();
    let id = event
        .requested_id
        .clone()
        .or_else(|| original.identifier())
        .ok_or_else(|| CoreError::transient_object(format!("detached {original:?} has no identifier")))?;
    tracing::trace!(entity = ?original, "merging detached instance");

    let key = EntityKey::new(id.clone(), meta.name()).with_mode(meta.entity_mode());
    if let Some(tracked) = session.persistence_context().get_entity(&key) {
        let deleted = session
            .persistence_context()
            .get_entry(&tracked)
            .map_or(false, |entry| entry.status().is_deleted_or_gone());
        if deleted {
            return Err(deleted_instance(session, &tracked, "merge"));
        }
    }

    let mut load = LoadEvent::new(meta.name(), id.clone(), LoadType::Get);
    session.fire_load(&mut load)?;
    let target = match load.result {
        None => {
            tracing::trace!(entity = %key, "detached instance not found in store; saving a copy");
            return entity_is_transient(session, event, persister, ctx);
        }
        Some(EntityHandle::Entity(entity)) => entity,
        Some(EntityHandle::Proxy(proxy)) => match proxy.target() {
            Some(target) => target,
            None => session.initialize_proxy(&proxy)?,
        },
    };
    ctx.copy_cache_mut().put(&original, &target, true)?;

    if meta.is_versioned() {
        let current = session
            .persistence_context()
            .get_entry(&target)
            .and_then(|entry| entry.version());
        let incoming = versioning::get_version(&original.values(), meta);
        if current != incoming {
            session.statistics().record_optimistic_failure();
            tracing::debug!(entity = %key, ?current, ?incoming, "merged instance is stale");
            return Err(CoreError::stale_state(meta.name(), id));
        }
    }

    Cascade::new(CascadingAction::Merge, CascadePoint::BeforeMerge).cascade(session, persister, &original, ctx)?;
    copy_values(session, meta, &original, &target, CopyPart::All, ctx)?;
    event.result = Some(target);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyPart {
    NonCollections,
    Collections,
    All,
}

fn copy_values(
    session: &mut Session,
    meta: &EntityMetamodel,
    original: &EntityRef,
    target: &EntityRef,
    part: CopyPart,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    for (index, property) in meta.properties().iter().enumerate() {
        // unfetched lazy state keeps whatever the target holds
        if !original.is_property_initialized(index) {
            continue;
        }
        let source = original.get(index);
        let value = match property.ty() {
            PropertyType::Collection { .. } => {
                if part != CopyPart::NonCollections {
                    copy_collection(session, &source, target, index, ctx)?;
                }
                continue;
            }
            _ if part == CopyPart::Collections => continue,
            PropertyType::ManyToOne { .. } => replace_reference(session, &source, ctx)?,
            PropertyType::Basic => source.deep_copy(),
        };
        if target.get(index) != value {
            target.set(index, value);
        }
    }
    Ok(())
}

fn copy_collection(
    session: &mut Session,
    source: &Value,
    target: &EntityRef,
    index: usize,
    ctx: &mut OperationContext,
) -> CoreResult<()> {
    let Value::Collection(source) = source else {
        if !target.get(index).is_null() {
            target.set(index, Value::Null);
        }
        return Ok(());
    };
    if !source.is_initialized() {
        return Ok(());
    }
    let current = source.loaded_elements();
    let mut elements = Vec::with_capacity(current.len());
    for element in &current {
        elements.push(replace_reference(session, element, ctx)?);
    }
    match target.get(index) {
        Value::Collection(existing) if existing.same_instance(source) => {
            if current != elements {
                existing.replace_elements(elements);
            }
        }
        Value::Collection(existing) => {
            if !existing.is_initialized() {
                session.initialize_collection(&existing)?;
            }
            if existing.loaded_elements() != elements {
                existing.replace_elements(elements);
            }
        }
        _ => target.set(index, Value::Collection(CollectionRef::new(elements))),
    }
    Ok(())
}

/// Rewrites a reference from an original to its copy.
fn replace_reference(session: &mut Session, value: &Value, ctx: &mut OperationContext) -> CoreResult<Value> {
    let Value::Entity(handle) = value else {
        return Ok(value.clone());
    };
    let Some(original) = handle.peek_implementation() else {
        let Some(id) = handle.identifier() else {
            return Ok(Value::Null);
        };
        let resolved = session.internal_load(handle.entity_name(), id, false, true)?;
        return Ok(resolved.map_or(Value::Null, Value::Entity));
    };
    if let Some(copy) = ctx.copy_cache().get(&original) {
        return Ok(Value::Entity(copy.into()));
    }
    if session.persistence_context().contains(&original) {
        return Ok(value.clone());
    }
    if transient::is_transient(session, &original, Some(false))? {
        let width = session
            .entity_persister(original.entity_name())?
            .metamodel()
            .property_count();
        let copy = EntityRef::new(original.entity_name(), vec![Value::Null; width]);
        ctx.copy_cache_mut().put(&original, &copy, false)?;
        tracing::trace!(entity = ?original, "copy created ahead of merge");
        return Ok(Value::Entity(copy.into()));
    }
    let Some(id) = original.identifier() else {
        return Ok(Value::Null);
    };
    let resolved = session.internal_load(original.entity_name(), id, false, true)?;
    Ok(resolved.map_or(Value::Null, Value::Entity))
}

fn saving_copies(session: &Session, ctx: &OperationContext) -> Vec<(EntityRef, EntityRef)> {
    ctx.copy_cache()
        .entries()
        .into_iter()
        .filter(|(_, copy, _)| {
            session
                .persistence_context()
                .get_entry(copy)
                .map_or(false, |entry| entry.status() == Status::Saving)
        })
        .map(|(original, copy, _)| (original, copy))
        .collect()
}

/// Retries the inserts of copies still waiting for unsaved references.
///
/// References are copied again from the originals, which by now may have
/// copies of their own. Copies still waiting after the configured number of
/// passes fail the merge.
pub(crate) fn resolve_transient_copies(session: &mut Session, ctx: &mut OperationContext) -> CoreResult<()> {
    for pass in 0..session.settings().merge_retry_limit {
        let pending = saving_copies(session, ctx);
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(pass, pending = pending.len(), "retrying unresolved merge copies");
        for (original, copy) in pending {
            let persister = session.entity_persister(copy.entity_name())?;
            copy_values(session, persister.metamodel(), &original, &copy, CopyPart::NonCollections, ctx)?;
            ActionQueue::retry_unresolved_insert(session, &copy)?;
        }
    }
    let pending = saving_copies(session, ctx);
    if pending.is_empty() {
        return Ok(());
    }
    let mut entity_names: Vec<String> = pending
        .iter()
        .map(|(_, copy)| copy.entity_name().to_string())
        .collect();
    entity_names.sort();
    entity_names.dedup();
    Err(CoreError::TransientObjects { entity_names })
}
