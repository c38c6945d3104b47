//! Session factory and its builder.

use super::Session;
use crate::config::Settings;
use crate::engine::{TransientPolicy, UnsavedValuePolicy};
use crate::error::{CoreError, CoreResult};
use crate::event::EventListeners;
use crate::interceptor::{Interceptor, NoopInterceptor};
use crate::metadata::PropertyType;
use crate::persister::{CollectionPersister, ElementType, EntityPersister};
use crate::stats::Statistics;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct FactoryInner {
    settings: Settings,
    entity_persisters: HashMap<String, Arc<dyn EntityPersister>>,
    collection_persisters: HashMap<String, Arc<dyn CollectionPersister>>,
    listeners: EventListeners,
    interceptor: Arc<dyn Interceptor>,
    transient_policies: Vec<Arc<dyn TransientPolicy>>,
    statistics: Arc<Statistics>,
}

/// Shared, thread-safe source of sessions.
///
/// A factory owns the mapping (as persisters), the listener lists, the
/// settings and the statistics. Cloning is cheap; clones share everything.
///
/// ```rust,ignore
/// let factory = SessionFactory::builder()
///     .entity_persister(orders)
///     .collection_persister(order_lines)
///     .build()?;
/// let mut session = factory.open_session();
/// ```
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl SessionFactory {
    /// Starts building a factory.
    #[must_use]
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::new()
    }

    /// Opens a unit of work with the factory interceptor.
    #[must_use]
    pub fn open_session(&self) -> Session {
        Session::open(self.clone(), Arc::clone(&self.inner.interceptor))
    }

    /// Opens a unit of work with its own interceptor.
    #[must_use]
    pub fn open_session_with_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> Session {
        Session::open(self.clone(), interceptor)
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Returns the statistics shared by all sessions of this factory.
    #[must_use]
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    /// Returns the listener lists.
    #[must_use]
    pub fn listeners(&self) -> &EventListeners {
        &self.inner.listeners
    }

    /// Returns the transient policies in consultation order.
    #[must_use]
    pub fn transient_policies(&self) -> &[Arc<dyn TransientPolicy>] {
        &self.inner.transient_policies
    }

    /// Returns the persister of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntity`] if the entity is not mapped.
    pub fn entity_persister(&self, entity_name: &str) -> CoreResult<Arc<dyn EntityPersister>> {
        self.inner
            .entity_persisters
            .get(entity_name)
            .cloned()
            .ok_or_else(|| CoreError::unknown_entity(entity_name))
    }

    /// Returns the persister of a collection role.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownCollectionRole`] if the role is not mapped.
    pub fn collection_persister(&self, role: &str) -> CoreResult<Arc<dyn CollectionPersister>> {
        self.inner
            .collection_persisters
            .get(role)
            .cloned()
            .ok_or_else(|| CoreError::unknown_role(role))
    }

    /// Returns the mapped entity names, sorted.
    #[must_use]
    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.entity_persisters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.entity_names())
            .field("collections", &self.inner.collection_persisters.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    settings: Settings,
    entity_persisters: HashMap<String, Arc<dyn EntityPersister>>,
    collection_persisters: HashMap<String, Arc<dyn CollectionPersister>>,
    listeners: EventListeners,
    interceptor: Arc<dyn Interceptor>,
    transient_policies: Vec<Arc<dyn TransientPolicy>>,
    statistics: Option<Arc<Statistics>>,
}

impl SessionFactoryBuilder {
    /// Creates a builder with default settings and listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            entity_persisters: HashMap::new(),
            collection_persisters: HashMap::new(),
            listeners: EventListeners::default(),
            interceptor: Arc::new(NoopInterceptor),
            transient_policies: vec![Arc::new(UnsavedValuePolicy)],
            statistics: None,
        }
    }

    /// Sets the settings.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Maps an entity.
    #[must_use]
    pub fn entity_persister(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.entity_persisters
            .insert(persister.entity_name().to_string(), persister);
        self
    }

    /// Maps a collection role.
    #[must_use]
    pub fn collection_persister(mut self, persister: Arc<dyn CollectionPersister>) -> Self {
        self.collection_persisters
            .insert(persister.role().to_string(), persister);
        self
    }

    /// Replaces the listener lists.
    #[must_use]
    pub fn listeners(mut self, listeners: EventListeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Sets the interceptor of sessions opened without one.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Puts a transient policy ahead of the unsaved-value policy.
    #[must_use]
    pub fn transient_policy(mut self, policy: Arc<dyn TransientPolicy>) -> Self {
        self.transient_policies.insert(self.transient_policies.len() - 1, policy);
        self
    }

    /// Shares existing statistics instead of creating new ones.
    #[must_use]
    pub fn statistics(mut self, statistics: Arc<Statistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Validates the mapping and builds the factory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] if an association or collection points
    /// at an unmapped entity or role.
    pub fn build(self) -> CoreResult<SessionFactory> {
        for persister in self.entity_persisters.values() {
            let meta = persister.metamodel();
            for property in meta.properties() {
                match property.ty() {
                    PropertyType::ManyToOne { entity_name } if !self.entity_persisters.contains_key(entity_name) => {
                        return Err(CoreError::mapping(format!(
                            "{}.{} references unmapped entity {entity_name}",
                            meta.name(),
                            property.name()
                        )));
                    }
                    PropertyType::Collection { role } if !self.collection_persisters.contains_key(role) => {
                        return Err(CoreError::mapping(format!(
                            "{}.{} uses unmapped collection role {role}",
                            meta.name(),
                            property.name()
                        )));
                    }
                    _ => {}
                }
            }
        }
        for persister in self.collection_persisters.values() {
            let metadata = persister.metadata();
            if !self.entity_persisters.contains_key(metadata.owner()) {
                return Err(CoreError::mapping(format!(
                    "collection {} is owned by unmapped entity {}",
                    metadata.role(),
                    metadata.owner()
                )));
            }
            if let ElementType::Entity(target) = metadata.element() {
                if !self.entity_persisters.contains_key(target) {
                    return Err(CoreError::mapping(format!(
                        "collection {} holds unmapped entity {target}",
                        metadata.role()
                    )));
                }
            }
        }
        tracing::debug!(
            entities = self.entity_persisters.len(),
            collections = self.collection_persisters.len(),
            "session factory built"
        );
        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                settings: self.settings,
                entity_persisters: self.entity_persisters,
                collection_persisters: self.collection_persisters,
                listeners: self.listeners,
                interceptor: self.interceptor,
                transient_policies: self.transient_policies,
                statistics: self.statistics.unwrap_or_default(),
            }),
        })
    }
}

impl Default for SessionFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactoryBuilder")
            .field("entities", &self.entity_persisters.len())
            .field("collections", &self.collection_persisters.len())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetamodel, PropertyMetadata};
    use crate::test_support::{entity_persister, order_metamodel};

    #[test]
    fn unmapped_reference_is_rejected() {
        let err = SessionFactory::builder()
            .entity_persister(entity_persister(order_metamodel()))
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Mapping { .. }));
    }

    #[test]
    fn persisters_are_looked_up_by_name() {
        let factory = SessionFactory::builder()
            .entity_persister(entity_persister(order_metamodel()))
            .entity_persister(entity_persister(
                EntityMetamodel::new("Customer").property(PropertyMetadata::basic("name")),
            ))
            .build()
            .unwrap();
        assert_eq!(factory.entity_names(), vec!["Customer", "Order"]);
        assert!(factory.entity_persister("Order").is_ok());
        assert!(matches!(
            factory.entity_persister("Invoice"),
            Err(CoreError::UnknownEntity { .. })
        ));
        assert!(matches!(
            factory.collection_persister("Order.lines"),
            Err(CoreError::UnknownCollectionRole { .. })
        ));
    }

    #[test]
    fn custom_policies_run_before_unsaved_values() {
        struct Never;
        impl TransientPolicy for Never {
            fn is_transient(&self, _: &crate::entity::EntityRef, _: &EntityMetamodel) -> Option<bool> {
                Some(false)
            }
        }
        let builder = SessionFactoryBuilder::new().transient_policy(Arc::new(Never));
        assert_eq!(builder.transient_policies.len(), 2);
    }
}
