//! Loading by identifier.
//!
//! A load is resolved from the registry first, then from the second-level
//! cache, then from the store. Loads that allow placeholders hand one out
//! instead of reading, queueing its key for batch fetching.

use super::{upgrade_lock, LoadEvent, LoadEventListener};
use crate::cache::{coordinator, CacheEntry, CacheKey};
use crate::engine::hydrate;
use crate::entity::{EntityHandle, EntityRef, ProxyRef, Status};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::persister::EntityPersister;
use crate::session::Session;
use crate::types::EntityKey;
use crate::value::{Row, Snapshot};
use crate::versioning;
use std::sync::Arc;

/// Default handler of loads.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoadEventListener;

impl LoadEventListener for DefaultLoadEventListener {
    fn on_load(&self, session: &mut Session, event: &mut LoadEvent) -> CoreResult<()> {
        let persister = session.entity_persister(&event.entity_name)?;
        let meta = persister.metamodel();
        let key = EntityKey::new(event.id.clone(), meta.name()).with_mode(meta.entity_mode());
        event.result = if event.lock_options.lock_mode() == LockMode::None {
            proxy_or_load(session, event, &persister, &key)?
        } else {
            lock_and_load(session, event, &persister, &key)?
        };
        if event.result.is_none() && !event.load_type.is_nullable() {
            return Err(CoreError::not_found(meta.name(), event.id.clone()));
        }
        Ok(())
    }
}

fn proxy_or_load(
    session: &mut Session,
    event: &LoadEvent,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
) -> CoreResult<Option<EntityHandle>> {
    let meta = persister.metamodel();
    if !meta.is_proxyable() {
        return Ok(load(session, event, persister, key)?.map(EntityHandle::Entity));
    }
    if let Some(proxy) = session.persistence_context().get_proxy(key) {
        tracing::trace!(entity = %key, "found placeholder in session");
        let target = if event.load_type.allows_proxy_creation() {
            session.persistence_context().get_entity(key)
        } else {
            match load(session, event, persister, key)? {
                Some(entity) => Some(entity),
                None => return Ok(None),
            }
        };
        return session
            .context_mut()
            .narrow_proxy(&proxy, key, target.as_ref())
            .map(Some);
    }
    if !event.load_type.allows_proxy_creation() {
        return Ok(load(session, event, persister, key)?.map(EntityHandle::Entity));
    }
    if let Some(existing) = session.persistence_context().get_entity(key) {
        let deleted = session
            .persistence_context()
            .get_entry(&existing)
            .map_or(false, |entry| entry.status().is_deleted_or_gone());
        if deleted && event.load_type.checks_deleted() {
            return Ok(None);
        }
        return Ok(Some(EntityHandle::Entity(existing)));
    }
    tracing::trace!(entity = %key, "creating placeholder");
    let proxy = ProxyRef::new(meta.name(), key.identifier().clone(), session.id());
    if session.persistence_context().is_default_read_only() {
        proxy.set_read_only(true);
    }
    let context = session.context_mut();
    context.batch_queue_mut().add_batch_loadable_entity_key(key.clone());
    context.add_proxy(key.clone(), proxy.clone());
    Ok(Some(EntityHandle::Proxy(proxy)))
}

fn lock_and_load(
    session: &mut Session,
    event: &LoadEvent,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
) -> CoreResult<Option<EntityHandle>> {
    let region = session.entity_region(persister.as_ref());
    let cache_key = CacheKey::new(persister.entity_name(), key.identifier().clone());
    let entity = coordinator::with_soft_lock(region.as_ref(), &cache_key, None, || {
        load(session, event, persister, key)
    })?;
    Ok(entity.map(|entity| session.context_mut().proxy_for(key, &entity)))
}

fn load(
    session: &mut Session,
    event: &LoadEvent,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
) -> CoreResult<Option<EntityRef>> {
    if let Some(entity) = session.persistence_context().get_entity(key) {
        let status = session.persistence_context().get_entry(&entity).map(|e| e.status());
        match status {
            Some(status) if status.is_deleted_or_gone() => {
                if event.load_type.checks_deleted() {
                    tracing::trace!(entity = %key, "instance scheduled for deletion");
                    return Ok(None);
                }
            }
            // being assembled: references back to it resolve to the same instance
            None => return Ok(Some(entity)),
            Some(_) => upgrade_lock(session, &entity, &event.lock_options)?,
        }
        tracing::trace!(entity = %key, "resolved in session");
        return Ok(Some(entity));
    }
    if let Some(entity) = load_from_cache(session, event, persister, key)? {
        return Ok(Some(entity));
    }
    load_from_datasource(session, event, persister, key)
}

fn load_from_cache(
    session: &mut Session,
    event: &LoadEvent,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
) -> CoreResult<Option<EntityRef>> {
    if event.lock_options.lock_mode() != LockMode::None || !session.cache_mode().is_get_enabled() {
        return Ok(None);
    }
    let Some(region) = session.entity_region(persister.as_ref()) else {
        return Ok(None);
    };
    let cache_key = CacheKey::new(persister.entity_name(), key.identifier().clone());
    let Some(cached) = coordinator::get(&region, &cache_key, session.timestamp(), session.statistics())? else {
        return Ok(None);
    };
    if cached.name != persister.entity_name() {
        tracing::debug!(entity = %key, cached = %cached.name, "cache entry of another entity ignored");
        return Ok(None);
    }
    tracing::trace!(entity = %key, "assembling from cache");
    assemble_row(session, persister, key, &cached.state, LockMode::None, None, None, false).map(Some)
}

fn load_from_datasource(
    session: &mut Session,
    event: &LoadEvent,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
) -> CoreResult<Option<EntityRef>> {
    session.check_cancelled()?;
    let meta = persister.metamodel();
    let requested = event.lock_options.lock_mode();
    let lock_mode = if requested.greater_than(LockMode::Read) {
        requested
    } else {
        LockMode::Read
    };
    let batch_size = meta.batch_fetch_size().max(session.settings().default_batch_fetch_size);
    if batch_size > 1 && requested == LockMode::None {
        let ids = session
            .persistence_context()
            .batch_queue()
            .get_entity_batch(meta.name(), key.identifier(), batch_size);
        if ids.len() > 1 {
            tracing::debug!(entity = %key, batch = ids.len(), "batch loading");
            let rows = persister.load_batch(&ids, &event.lock_options)?;
            session.statistics().record_entity_fetch();
            let mut found = None;
            for (id, row) in rows {
                let row_key = EntityKey::new(id, meta.name()).with_mode(meta.entity_mode());
                if row_key == *key {
                    found = Some(row);
                } else if !session.persistence_context().contains_key(&row_key) {
                    assemble_row(session, persister, &row_key, &row, lock_mode, None, None, true)?;
                }
            }
            return match found {
                Some(row) => assemble_row(session, persister, key, &row, lock_mode, None, None, true).map(Some),
                None => Ok(None),
            };
        }
    }
    let row = persister.load(key.identifier(), &event.lock_options)?;
    session.statistics().record_entity_fetch();
    match row {
        Some(row) => assemble_row(session, persister, key, &row, lock_mode, None, None, true).map(Some),
        None => {
            tracing::trace!(entity = %key, "no row");
            Ok(None)
        }
    }
}

/// Turns a row into a tracked instance.
///
/// With `instance` set the row is assembled into that instance, as a
/// refresh does. `read_only` overrides the session default. Rows read from
/// the store are offered to the second-level cache when `from_store` is set.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble_row(
    session: &mut Session,
    persister: &Arc<dyn EntityPersister>,
    key: &EntityKey,
    row: &Row,
    lock_mode: LockMode,
    instance: Option<EntityRef>,
    read_only: Option<bool>,
    from_store: bool,
) -> CoreResult<EntityRef> {
    let meta = persister.metamodel();
    if row.len() != meta.property_count() {
        return Err(CoreError::mapping(format!(
            "row of {} has {} columns, expected {}",
            meta.name(),
            row.len(),
            meta.property_count()
        )));
    }
    let id = key.identifier().clone();
    let entity = instance.unwrap_or_else(|| EntityRef::with_identifier(meta.name(), id.clone(), Vec::new()));
    entity.set_identifier(Some(id.clone()));
    session.context_mut().add_entity_key(key.clone(), &entity)?;

    let assembled = hydrate::assemble(session, row, meta, &id).and_then(|mut values| {
        session.interceptor().on_load(&entity, &id, &mut values, meta)?;
        Ok(values)
    });
    let values = match assembled {
        Ok(values) => values,
        Err(err) => {
            if !session.persistence_context().contains(&entity) {
                session.context_mut().remove_entity(key);
            }
            return Err(err);
        }
    };
    entity.replace_values(values.clone());
    entity.clear_written();

    let read_only = read_only.unwrap_or_else(|| session.persistence_context().is_default_read_only())
        || !meta.is_mutable();
    let (status, loaded) = if read_only {
        (Status::ReadOnly, None)
    } else {
        (Status::Managed, Some(Snapshot::capture(&values)))
    };
    let version = versioning::get_version(&values, meta);
    session.context_mut().add_entity(
        &entity,
        status,
        loaded,
        Some(key.clone()),
        version,
        lock_mode,
        true,
        Arc::clone(persister),
        false,
        true,
    )?;
    session.context_mut().batch_queue_mut().remove_batch_loadable_entity_key(key);
    session.context_mut().proxy_for(key, &entity);
    session.statistics().record_entity_load();

    if from_store && session.cache_mode().is_put_enabled() {
        if let Some(region) = session.entity_region(persister.as_ref()) {
            let cache_key = CacheKey::new(meta.name(), id);
            let entry = CacheEntry {
                name: meta.name().to_string(),
                state: row.clone(),
                version,
            };
            coordinator::put_from_load(&region, &cache_key, entry, session.timestamp(), session.statistics())?;
        }
    }
    tracing::trace!(entity = %key, ?status, "loaded");
    Ok(entity)
}
