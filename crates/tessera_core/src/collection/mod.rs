//! Persistent collection wrappers.
//!
//! A [`CollectionRef`] is the value of a collection-valued property. It
//! knows its role and owner key once attached, whether its elements have
//! been loaded, whether it was modified, and the element snapshot taken at
//! the last load or flush.

mod entry;

pub use entry::CollectionEntry;

use crate::entity::EntityHandle;
use crate::error::{CoreError, CoreResult};
use crate::types::{Identifier, InstanceId, SessionId};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct CollectionCell {
    instance_id: InstanceId,
    data: RefCell<CollectionData>,
}

struct CollectionData {
    role: Option<String>,
    key: Option<Identifier>,
    elements: Vec<Value>,
    initialized: bool,
    dirty: bool,
    session: Option<SessionId>,
    stored_snapshot: Option<Vec<Value>>,
}

/// Shared handle to a persistent collection.
#[derive(Clone)]
pub struct CollectionRef(Rc<CollectionCell>);

impl CollectionRef {
    /// Creates a new, unattached collection holding `elements`.
    #[must_use]
    pub fn new(elements: Vec<Value>) -> Self {
        Self::build(CollectionData {
            role: None,
            key: None,
            elements,
            initialized: true,
            dirty: false,
            session: None,
            stored_snapshot: None,
        })
    }

    pub(crate) fn uninitialized(role: &str, key: Identifier, session: SessionId) -> Self {
        Self::build(CollectionData {
            role: Some(role.to_string()),
            key: Some(key),
            elements: Vec::new(),
            initialized: false,
            dirty: false,
            session: Some(session),
            stored_snapshot: None,
        })
    }

    fn build(data: CollectionData) -> Self {
        Self(Rc::new(CollectionCell {
            instance_id: InstanceId::next(),
            data: RefCell::new(data),
        }))
    }

    /// Returns the instance handle.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.0.instance_id
    }

    /// Returns the role, once attached.
    #[must_use]
    pub fn role(&self) -> Option<String> {
        self.0.data.borrow().role.clone()
    }

    /// Returns the owner key, once attached.
    #[must_use]
    pub fn key(&self) -> Option<Identifier> {
        self.0.data.borrow().key.clone()
    }

    /// Returns true if the elements are loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0.data.borrow().initialized
    }

    /// Returns true if modified since the last load or flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.0.data.borrow().dirty
    }

    /// Returns the session the collection is attached to.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.0.data.borrow().session
    }

    /// Returns the elements.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if the elements were never
    /// loaded; initialize the collection through its session first.
    pub fn elements(&self) -> CoreResult<Vec<Value>> {
        self.check_initialized()?;
        Ok(self.0.data.borrow().elements.clone())
    }

    /// Returns the number of elements.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if not loaded.
    pub fn len(&self) -> CoreResult<usize> {
        self.check_initialized()?;
        Ok(self.0.data.borrow().elements.len())
    }

    /// Returns true if there are no elements.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if not loaded.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends an element.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if not loaded.
    pub fn push(&self, value: impl Into<Value>) -> CoreResult<()> {
        self.check_initialized()?;
        let mut data = self.0.data.borrow_mut();
        data.elements.push(value.into());
        data.dirty = true;
        Ok(())
    }

    /// Removes the first element equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if not loaded.
    pub fn remove(&self, value: &Value) -> CoreResult<bool> {
        self.check_initialized()?;
        let mut data = self.0.data.borrow_mut();
        match data.elements.iter().position(|e| e == value) {
            Some(index) => {
                data.elements.remove(index);
                data.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes all elements.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if not loaded.
    pub fn clear(&self) -> CoreResult<()> {
        self.check_initialized()?;
        let mut data = self.0.data.borrow_mut();
        if !data.elements.is_empty() {
            data.elements.clear();
            data.dirty = true;
        }
        Ok(())
    }

    /// Returns true if both handles are the same collection.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn check_initialized(&self) -> CoreResult<()> {
        let data = self.0.data.borrow();
        if data.initialized {
            Ok(())
        } else {
            Err(CoreError::lazy_initialization(
                format!(
                    "collection {}#{}",
                    data.role.as_deref().unwrap_or("?"),
                    data.key.as_ref().map(ToString::to_string).unwrap_or_default()
                ),
                "not initialized; initialize it through its session",
            ))
        }
    }

    /// Elements loaded so far; empty for an uninitialized collection.
    pub(crate) fn loaded_elements(&self) -> Vec<Value> {
        let data = self.0.data.borrow();
        if data.initialized {
            data.elements.clone()
        } else {
            Vec::new()
        }
    }

    pub(crate) fn initialize_with(&self, elements: Vec<Value>) {
        let mut data = self.0.data.borrow_mut();
        data.stored_snapshot = Some(elements.clone());
        data.elements = elements;
        data.initialized = true;
        data.dirty = false;
    }

    pub(crate) fn attach(&self, role: &str, key: Option<Identifier>, session: SessionId) {
        let mut data = self.0.data.borrow_mut();
        data.role = Some(role.to_string());
        data.key = key;
        data.session = Some(session);
    }

    pub(crate) fn set_key(&self, key: Option<Identifier>) {
        self.0.data.borrow_mut().key = key;
    }

    pub(crate) fn unset_session(&self) {
        self.0.data.borrow_mut().session = None;
    }

    pub(crate) fn mark_dirty(&self) {
        self.0.data.borrow_mut().dirty = true;
    }

    pub(crate) fn post_action(&self) {
        let mut data = self.0.data.borrow_mut();
        data.dirty = false;
        if data.initialized {
            data.stored_snapshot = Some(data.elements.clone());
        }
    }

    pub(crate) fn stored_snapshot(&self) -> Option<Vec<Value>> {
        self.0.data.borrow().stored_snapshot.clone()
    }

    pub(crate) fn replace_elements(&self, elements: Vec<Value>) {
        let mut data = self.0.data.borrow_mut();
        data.elements = elements;
        data.initialized = true;
        data.dirty = true;
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.data.try_borrow() {
            Ok(data) => write!(
                f,
                "{}#{}{} [{}]",
                data.role.as_deref().unwrap_or("<unattached>"),
                data.key.as_ref().map(ToString::to_string).unwrap_or_default(),
                self.0.instance_id,
                if data.initialized {
                    format!("{} elements", data.elements.len())
                } else {
                    "lazy".to_string()
                }
            ),
            Err(_) => write!(f, "collection{}", self.0.instance_id),
        }
    }
}

/// Entity elements present in `snapshot` but no longer in `current`.
pub(crate) fn orphans(snapshot: &[Value], current: &[Value]) -> Vec<EntityHandle> {
    snapshot
        .iter()
        .filter_map(Value::as_entity)
        .filter(|old| {
            !current.iter().filter_map(Value::as_entity).any(|now| {
                now.same_instance(old)
                    || (now.identifier().is_some()
                        && now.identifier() == old.identifier()
                        && now.entity_name() == old.entity_name())
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn mutation_marks_dirty() {
        let collection = CollectionRef::new(vec![Value::from(1)]);
        assert!(!collection.is_dirty());
        collection.push(2).unwrap();
        assert!(collection.is_dirty());
        assert_eq!(collection.len().unwrap(), 2);
        assert!(collection.remove(&Value::from(1)).unwrap());
        assert!(!collection.remove(&Value::from(9)).unwrap());
    }

    #[test]
    fn lazy_access_fails() {
        let collection = CollectionRef::uninitialized("Order.lines", Identifier::from(1), SessionId::next());
        let err = collection.elements().unwrap_err();
        assert!(matches!(err, CoreError::LazyInitialization { .. }));
        assert!(collection.push(1).is_err());
        assert!(collection.loaded_elements().is_empty());
    }

    #[test]
    fn initialize_records_snapshot() {
        let collection = CollectionRef::uninitialized("Order.lines", Identifier::from(1), SessionId::next());
        collection.initialize_with(vec![Value::from("a")]);
        assert!(collection.is_initialized());
        assert_eq!(collection.stored_snapshot(), Some(vec![Value::from("a")]));
    }

    #[test]
    fn orphans_are_removed_entities() {
        let a = EntityRef::with_identifier("Line", Identifier::from(1), vec![]);
        let b = EntityRef::with_identifier("Line", Identifier::from(2), vec![]);
        let snapshot = vec![Value::from(&a), Value::from(&b)];
        let current = vec![Value::from(&b)];
        let found = orphans(&snapshot, &current);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier(), Some(Identifier::from(1)));
    }
}
