//! Stub collaborators for unit tests.

use crate::error::{CoreError, CoreResult};
use crate::lock::LockOptions;
use crate::metadata::{EntityMetamodel, PropertyMetadata};
use crate::persister::EntityPersister;
use crate::types::{Identifier, Version};
use crate::value::{Row, StoredValue};
use crate::versioning::VersionType;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// `Order(status, note, customer -> Customer, version)`.
pub(crate) fn order_metamodel() -> EntityMetamodel {
    EntityMetamodel::new("Order")
        .property(PropertyMetadata::basic("status"))
        .property(PropertyMetadata::basic("note"))
        .property(PropertyMetadata::many_to_one("customer", "Customer"))
        .version(PropertyMetadata::basic("version"), VersionType::Integer)
}

pub(crate) fn entity_persister(meta: EntityMetamodel) -> Arc<dyn EntityPersister> {
    Arc::new(StubPersister::new(meta))
}

/// Map-backed persister without locking semantics.
pub(crate) struct StubPersister {
    meta: EntityMetamodel,
    rows: Mutex<BTreeMap<Identifier, Row>>,
    sequence: AtomicI64,
}

impl StubPersister {
    pub(crate) fn new(meta: EntityMetamodel) -> Self {
        Self {
            meta,
            rows: Mutex::new(BTreeMap::new()),
            sequence: AtomicI64::new(0),
        }
    }

    fn stored_version(&self, row: &Row) -> Option<Version> {
        let index = self.meta.version_metadata()?.index;
        match row.get(index)? {
            StoredValue::Integer(n) => Some(Version::Integer(*n)),
            StoredValue::Timestamp(t) => Some(Version::Timestamp(*t)),
            _ => None,
        }
    }

    fn check_version(&self, id: &Identifier, row: &Row, expected: Option<Version>) -> CoreResult<()> {
        if self.meta.is_versioned() && self.stored_version(row) != expected {
            return Err(CoreError::stale_state(self.meta.name(), id.clone()));
        }
        Ok(())
    }
}

impl EntityPersister for StubPersister {
    fn metamodel(&self) -> &EntityMetamodel {
        &self.meta
    }

    fn load(&self, id: &Identifier, _lock: &LockOptions) -> CoreResult<Option<Row>> {
        Ok(self.rows.lock().get(id).cloned())
    }

    fn insert(&self, id: &Identifier, row: &Row) -> CoreResult<()> {
        let mut rows = self.rows.lock();
        if rows.contains_key(id) {
            return Err(CoreError::store(format!("duplicate key {id}")));
        }
        rows.insert(id.clone(), row.clone());
        Ok(())
    }

    fn update(
        &self,
        id: &Identifier,
        row: &Row,
        _dirty: Option<&[usize]>,
        previous_version: Option<Version>,
    ) -> CoreResult<()> {
        let mut rows = self.rows.lock();
        let current = rows
            .get(id)
            .ok_or_else(|| CoreError::stale_state(self.meta.name(), id.clone()))?;
        self.check_version(id, current, previous_version)?;
        rows.insert(id.clone(), row.clone());
        Ok(())
    }

    fn delete(&self, id: &Identifier, version: Option<Version>) -> CoreResult<()> {
        let mut rows = self.rows.lock();
        let current = rows
            .get(id)
            .ok_or_else(|| CoreError::stale_state(self.meta.name(), id.clone()))?;
        self.check_version(id, current, version)?;
        rows.remove(id);
        Ok(())
    }

    fn lock(&self, id: &Identifier, version: Option<Version>, _lock: &LockOptions) -> CoreResult<()> {
        let rows = self.rows.lock();
        let current = rows
            .get(id)
            .ok_or_else(|| CoreError::stale_state(self.meta.name(), id.clone()))?;
        self.check_version(id, current, version)
    }

    fn database_snapshot(&self, id: &Identifier) -> CoreResult<Option<Row>> {
        Ok(self.rows.lock().get(id).cloned())
    }

    fn current_version(&self, id: &Identifier) -> CoreResult<Option<Version>> {
        Ok(self.rows.lock().get(id).and_then(|row| self.stored_version(row)))
    }

    fn force_version_increment(&self, id: &Identifier, current: Version) -> CoreResult<Version> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| CoreError::stale_state(self.meta.name(), id.clone()))?;
        let meta = self
            .meta
            .version_metadata()
            .ok_or_else(|| CoreError::mapping(format!("{} is not versioned", self.meta.name())))?;
        if self.stored_version(row) != Some(current) {
            return Err(CoreError::stale_state(self.meta.name(), id.clone()));
        }
        let next = meta.ty.next(&current);
        row[meta.index] = match next {
            Version::Integer(n) => StoredValue::Integer(n),
            Version::Timestamp(t) => StoredValue::Timestamp(t),
        };
        Ok(next)
    }

    fn next_identifier(&self) -> CoreResult<Identifier> {
        Ok(Identifier::from(self.sequence.fetch_add(1, Ordering::Relaxed) + 1))
    }
}
