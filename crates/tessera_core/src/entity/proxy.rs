//! Lazy entity placeholders.

use super::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::types::{Identifier, InstanceId, SessionId};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct ProxyCell {
    instance_id: InstanceId,
    entity_name: String,
    identifier: Identifier,
    state: RefCell<LazyInitializer>,
}

struct LazyInitializer {
    target: Option<EntityRef>,
    session: Option<SessionId>,
    read_only: bool,
}

/// A lazy placeholder standing in for an entity that has not been loaded.
///
/// The placeholder is bound to the session that created it. Initializing it
/// requires that session to be open; reading through an uninitialized
/// placeholder reports [`CoreError::LazyInitialization`].
#[derive(Clone)]
pub struct ProxyRef(Rc<ProxyCell>);

impl ProxyRef {
    pub(crate) fn new(entity_name: &str, identifier: Identifier, session: SessionId) -> Self {
        Self(Rc::new(ProxyCell {
            instance_id: InstanceId::next(),
            entity_name: entity_name.to_string(),
            identifier,
            state: RefCell::new(LazyInitializer {
                target: None,
                session: Some(session),
                read_only: false,
            }),
        }))
    }

    /// Returns the placeholder's own instance handle.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.0.instance_id
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.0.entity_name
    }

    /// Returns the identifier.
    #[must_use]
    pub fn identifier(&self) -> &Identifier {
        &self.0.identifier
    }

    /// Returns true once the target has been loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0.state.borrow().target.is_some()
    }

    /// Returns the session the placeholder is bound to.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.0.state.borrow().session
    }

    /// Returns true if the placeholder is marked read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.0.state.borrow().read_only
    }

    /// Returns the loaded target.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LazyInitialization`] if the target is not loaded.
    pub fn implementation(&self) -> CoreResult<EntityRef> {
        self.target().ok_or_else(|| {
            CoreError::lazy_initialization(
                format!("proxy {}#{}", self.0.entity_name, self.0.identifier),
                "not initialized; initialize it through its session",
            )
        })
    }

    /// Returns true if both handles are the same placeholder.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn target(&self) -> Option<EntityRef> {
        self.0.state.borrow().target.clone()
    }

    pub(crate) fn set_implementation(&self, target: EntityRef) {
        self.0.state.borrow_mut().target = Some(target);
    }

    pub(crate) fn set_session(&self, session: Option<SessionId>) {
        self.0.state.borrow_mut().session = session;
    }

    pub(crate) fn set_read_only(&self, read_only: bool) {
        self.0.state.borrow_mut().read_only = read_only;
    }
}

impl fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_initialized() {
            "initialized"
        } else {
            "lazy"
        };
        write!(
            f,
            "Proxy({}#{}{} {state})",
            self.0.entity_name, self.0.identifier, self.0.instance_id
        )
    }
}
