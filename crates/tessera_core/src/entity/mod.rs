//! Entity instances, lazy placeholders and their registry entries.
//!
//! Entities are dynamic: an [`EntityRef`] holds an entity name, an optional
//! identifier and one [`Value`] per mapped property. Handles are cheap to
//! clone and compare by identity, which is what the identity maps key on.

mod entry;
mod proxy;

pub use entry::{EntityEntry, Status};
pub use proxy::ProxyRef;

use crate::error::CoreResult;
use crate::types::{Identifier, InstanceId};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

struct EntityCell {
    instance_id: InstanceId,
    entity_name: String,
    data: RefCell<EntityData>,
}

struct EntityData {
    identifier: Option<Identifier>,
    values: Vec<Value>,
    written: BTreeSet<usize>,
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Rc<EntityCell>);

impl EntityRef {
    /// Creates a new instance without an identifier.
    pub fn new(entity_name: impl Into<String>, values: Vec<Value>) -> Self {
        Self::build(entity_name.into(), None, values)
    }

    /// Creates a new instance with an identifier.
    pub fn with_identifier(
        entity_name: impl Into<String>,
        identifier: Identifier,
        values: Vec<Value>,
    ) -> Self {
        Self::build(entity_name.into(), Some(identifier), values)
    }

    fn build(entity_name: String, identifier: Option<Identifier>, values: Vec<Value>) -> Self {
        Self(Rc::new(EntityCell {
            instance_id: InstanceId::next(),
            entity_name,
            data: RefCell::new(EntityData {
                identifier,
                values,
                written: BTreeSet::new(),
            }),
        }))
    }

    /// Returns the process-unique instance handle.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.0.instance_id
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.0.entity_name
    }

    /// Returns the identifier, if assigned.
    #[must_use]
    pub fn identifier(&self) -> Option<Identifier> {
        self.0.data.borrow().identifier.clone()
    }

    /// Assigns or clears the identifier.
    pub fn set_identifier(&self, identifier: Option<Identifier>) {
        self.0.data.borrow_mut().identifier = identifier;
    }

    /// Returns the value of a property (null when out of range).
    #[must_use]
    pub fn get(&self, index: usize) -> Value {
        self.0
            .data
            .borrow()
            .values
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes a property and records the write for dirtiness tracking.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let mut data = self.0.data.borrow_mut();
        if index >= data.values.len() {
            data.values.resize(index + 1, Value::Null);
        }
        data.values[index] = value.into();
        data.written.insert(index);
    }

    /// Returns a copy of all property values.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.0.data.borrow().values.clone()
    }

    /// Returns the number of property slots.
    #[must_use]
    pub fn property_count(&self) -> usize {
        self.0.data.borrow().values.len()
    }

    /// Returns true if the property has been fetched.
    #[must_use]
    pub fn is_property_initialized(&self, index: usize) -> bool {
        self.0
            .data
            .borrow()
            .values
            .get(index)
            .map_or(true, Value::is_fetched)
    }

    /// Returns the indices written through [`EntityRef::set`] since the last flush.
    #[must_use]
    pub fn written_properties(&self) -> Vec<usize> {
        self.0.data.borrow().written.iter().copied().collect()
    }

    /// Returns true if both handles refer to the same instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn replace_values(&self, values: Vec<Value>) {
        self.0.data.borrow_mut().values = values;
    }

    pub(crate) fn put_value(&self, index: usize, value: Value) {
        let mut data = self.0.data.borrow_mut();
        if index >= data.values.len() {
            data.values.resize(index + 1, Value::Null);
        }
        data.values[index] = value;
    }

    pub(crate) fn clear_written(&self) {
        self.0.data.borrow_mut().written.clear();
    }

    pub(crate) fn ensure_width(&self, width: usize) {
        let mut data = self.0.data.borrow_mut();
        if data.values.len() < width {
            data.values.resize(width, Value::Null);
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.data.try_borrow() {
            Ok(data) => match &data.identifier {
                Some(id) => write!(f, "{}#{}{}", self.0.entity_name, id, self.0.instance_id),
                None => write!(f, "{}#<unsaved>{}", self.0.entity_name, self.0.instance_id),
            },
            Err(_) => write!(f, "{}{}", self.0.entity_name, self.0.instance_id),
        }
    }
}

/// A reference to an entity: either the instance itself or a lazy placeholder.
#[derive(Clone)]
pub enum EntityHandle {
    /// A materialized instance.
    Entity(EntityRef),
    /// A lazy placeholder.
    Proxy(ProxyRef),
}

impl EntityHandle {
    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        match self {
            Self::Entity(entity) => entity.entity_name(),
            Self::Proxy(proxy) => proxy.entity_name(),
        }
    }

    /// Returns the identifier, if known.
    #[must_use]
    pub fn identifier(&self) -> Option<Identifier> {
        match self {
            Self::Entity(entity) => entity.identifier(),
            Self::Proxy(proxy) => Some(proxy.identifier().clone()),
        }
    }

    /// Returns the handle of the referenced object itself.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        match self {
            Self::Entity(entity) => entity.instance_id(),
            Self::Proxy(proxy) => proxy.instance_id(),
        }
    }

    /// Returns true if both handles are the same object.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Entity(a), Self::Entity(b)) => a.same_instance(b),
            (Self::Proxy(a), Self::Proxy(b)) => a.same_instance(b),
            _ => false,
        }
    }

    /// Returns the materialized instance, if this is not a placeholder.
    #[must_use]
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Proxy(_) => None,
        }
    }

    /// Returns true unless this is an uninitialized placeholder.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        match self {
            Self::Entity(_) => true,
            Self::Proxy(proxy) => proxy.is_initialized(),
        }
    }

    /// Returns the underlying instance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::LazyInitialization`] for an uninitialized
    /// placeholder; initialize it through its session first.
    pub fn implementation(&self) -> CoreResult<EntityRef> {
        match self {
            Self::Entity(entity) => Ok(entity.clone()),
            Self::Proxy(proxy) => proxy.implementation(),
        }
    }

    /// Returns the instance if materialized or initialized, without failing.
    #[must_use]
    pub fn peek_implementation(&self) -> Option<EntityRef> {
        match self {
            Self::Entity(entity) => Some(entity.clone()),
            Self::Proxy(proxy) => proxy.target(),
        }
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(entity) => fmt::Debug::fmt(entity, f),
            Self::Proxy(proxy) => fmt::Debug::fmt(proxy, f),
        }
    }
}

impl From<EntityRef> for EntityHandle {
    fn from(entity: EntityRef) -> Self {
        Self::Entity(entity)
    }
}

impl From<&EntityRef> for EntityHandle {
    fn from(entity: &EntityRef) -> Self {
        Self::Entity(entity.clone())
    }
}

impl From<ProxyRef> for EntityHandle {
    fn from(proxy: ProxyRef) -> Self {
        Self::Proxy(proxy)
    }
}
