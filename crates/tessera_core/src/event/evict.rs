//! Evict.

use super::{EvictEvent, EvictEventListener, OperationContext};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::engine::collections;
use crate::entity::{EntityHandle, EntityRef};
use crate::error::CoreResult;
use crate::session::Session;
use crate::types::EntityKey;
use std::sync::Arc;

/// Default handler of evict.
///
/// Evicting an untracked instance is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvictEventListener;

impl EvictEventListener for DefaultEvictEventListener {
    fn on_evict(
        &self,
        session: &mut Session,
        event: &mut EvictEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        match &event.entity {
            EntityHandle::Proxy(proxy) => {
                let meta_mode = session.entity_persister(proxy.entity_name())?.metamodel().entity_mode();
                let key = EntityKey::new(proxy.identifier().clone(), proxy.entity_name()).with_mode(meta_mode);
                session.context_mut().remove_proxy(&key);
                if let Some(target) = proxy.target() {
                    evict_entity(session, &target, ctx)?;
                }
                proxy.set_session(None);
                Ok(())
            }
            EntityHandle::Entity(entity) => evict_entity(session, entity, ctx),
        }
    }
}

fn evict_entity(session: &mut Session, entity: &EntityRef, ctx: &mut OperationContext) -> CoreResult<()> {
    let Some(entry) = session.persistence_context().get_entry(entity) else {
        tracing::trace!(entity = ?entity, "instance not tracked; nothing to evict");
        return Ok(());
    };
    let persister = Arc::clone(entry.persister());
    let key = entry.entity_key();
    tracing::trace!(entity = ?entity, "evicting");
    match &key {
        Some(key) => {
            session.context_mut().remove_entity(key);
            if let Some(proxy) = session.context_mut().remove_proxy(key) {
                proxy.set_session(None);
            }
        }
        None => {
            session.context_mut().remove_entry(entity);
        }
    }
    collections::evict_collections(session, &entity.values(), persister.metamodel());
    Cascade::new(CascadingAction::Evict, CascadePoint::AfterEvict).cascade(session, &persister, entity, ctx)
}
