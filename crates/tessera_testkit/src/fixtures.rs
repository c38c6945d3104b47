//! A small shop schema and the factory that serves it.
//!
//! The schema has five entities:
//!
//! - `Customer(name, email [lazy], version)`: versioned, placeholders allowed,
//!   batch size 4
//! - `Order(status, note, customer -> Customer, lines -> Order.lines, version)`:
//!   versioned; `customer` cascades save-update, `lines` cascades everything
//!   and deletes orphans; `note` is excluded from versioning
//! - `Line(product, quantity)`: unversioned
//! - `Ticket(title)`: identifiers generated by the store
//! - `Country(name)`: immutable, assigned identifiers
//!
//! Sequence identifiers start after 1000 so seeded rows never collide with
//! generated ones.

use crate::cache::InMemoryCacheRegion;
use crate::persister::{InMemoryCollectionPersister, InMemoryEntityPersister};
use crate::store::InMemoryStore;
use std::sync::Arc;
use tessera_core::{
    CacheAccessStrategy, CascadeStyle, CascadingAction, CollectionMetadata, CollectionRef, CoreResult, ElementType,
    EntityMetamodel, EntityRef, IdStrategy, Identifier, Interceptor, PropertyMetadata, Session, SessionFactory, Settings,
    StoredValue, Value, VersionType,
};

/// Property indices of `Customer`.
pub mod customer {
    /// Entity name.
    pub const NAME: &str = "Customer";
    /// `name`.
    pub const FULL_NAME: usize = 0;
    /// `email` (lazy).
    pub const EMAIL: usize = 1;
    /// `version`.
    pub const VERSION: usize = 2;
}

/// Property indices of `Order`.
pub mod order {
    /// Entity name.
    pub const NAME: &str = "Order";
    /// Collection role of `lines`.
    pub const LINES_ROLE: &str = "Order.lines";
    /// `status`.
    pub const STATUS: usize = 0;
    /// `note`.
    pub const NOTE: usize = 1;
    /// `customer`.
    pub const CUSTOMER: usize = 2;
    /// `lines`.
    pub const LINES: usize = 3;
    /// `version`.
    pub const VERSION: usize = 4;
}

/// Property indices of `Line`.
pub mod line {
    /// Entity name.
    pub const NAME: &str = "Line";
    /// `product`.
    pub const PRODUCT: usize = 0;
    /// `quantity`.
    pub const QUANTITY: usize = 1;
}

/// Mapping of `Customer`.
#[must_use]
pub fn customer_metamodel() -> EntityMetamodel {
    EntityMetamodel::new(customer::NAME)
        .property(PropertyMetadata::basic("name").not_null())
        .property(PropertyMetadata::basic("email").lazy())
        .version(PropertyMetadata::basic("version"), VersionType::Integer)
        .proxyable()
        .batch_size(4)
}

/// Mapping of `Order`.
#[must_use]
pub fn order_metamodel() -> EntityMetamodel {
    EntityMetamodel::new(order::NAME)
        .property(PropertyMetadata::basic("status").not_null())
        .property(PropertyMetadata::basic("note").excluded_from_versioning())
        .property(
            PropertyMetadata::many_to_one("customer", customer::NAME)
                .cascade(CascadeStyle::of(CascadingAction::SaveUpdate)),
        )
        .property(PropertyMetadata::collection("lines", order::LINES_ROLE).cascade(CascadeStyle::ALL_DELETE_ORPHAN))
        .version(PropertyMetadata::basic("version"), VersionType::Integer)
}

/// Mapping of `Line`.
#[must_use]
pub fn line_metamodel() -> EntityMetamodel {
    EntityMetamodel::new(line::NAME)
        .property(PropertyMetadata::basic("product").not_null())
        .property(PropertyMetadata::basic("quantity"))
}

/// Mapping of `Ticket`.
#[must_use]
pub fn ticket_metamodel() -> EntityMetamodel {
    EntityMetamodel::new("Ticket")
        .property(PropertyMetadata::basic("title"))
        .id_strategy(IdStrategy::Identity)
}

/// Mapping of `Country`.
#[must_use]
pub fn country_metamodel() -> EntityMetamodel {
    EntityMetamodel::new("Country")
        .property(PropertyMetadata::basic("name"))
        .id_strategy(IdStrategy::Assigned)
        .immutable()
}

/// Mapping of the `Order.lines` role.
#[must_use]
pub fn order_lines_metadata() -> CollectionMetadata {
    CollectionMetadata::new(order::LINES_ROLE, order::NAME, ElementType::Entity(line::NAME.to_string()))
}

/// Options for building a [`Shop`].
#[derive(Default)]
pub struct ShopBuilder {
    settings: Settings,
    interceptor: Option<Arc<dyn Interceptor>>,
    cached: bool,
    customer: Option<EntityMetamodel>,
}

impl ShopBuilder {
    /// Uses these settings.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Installs a factory-wide interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Caches customers, orders and order lines in one shared region.
    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Replaces the `Customer` mapping, keeping its property layout.
    #[must_use]
    pub fn customer_mapping(mut self, meta: EntityMetamodel) -> Self {
        self.customer = Some(meta);
        self
    }

    /// Builds the shop.
    ///
    /// # Errors
    ///
    /// Fails if the mapping does not validate.
    pub fn try_build(self) -> CoreResult<Shop> {
        let store = Arc::new(InMemoryStore::new());
        let region = Arc::new(InMemoryCacheRegion::new("shop"));
        let shared: Arc<dyn CacheAccessStrategy> = region.clone();
        let cached = |persister: InMemoryEntityPersister| {
            if self.cached {
                persister.with_cache(Arc::clone(&shared))
            } else {
                persister
            }
        };
        let customer_meta = self.customer.clone().unwrap_or_else(customer_metamodel);
        let customers = cached(InMemoryEntityPersister::new(customer_meta, Arc::clone(&store)).with_sequence_after(1000));
        let orders = cached(InMemoryEntityPersister::new(order_metamodel(), Arc::clone(&store)).with_sequence_after(1000));
        let lines = InMemoryEntityPersister::new(line_metamodel(), Arc::clone(&store)).with_sequence_after(1000);
        let tickets = InMemoryEntityPersister::new(ticket_metamodel(), Arc::clone(&store));
        let countries = InMemoryEntityPersister::new(country_metamodel(), Arc::clone(&store));
        let mut order_lines = InMemoryCollectionPersister::new(order_lines_metadata(), Arc::clone(&store));
        if self.cached {
            order_lines = order_lines.with_cache(Arc::clone(&shared));
        }

        let mut builder = SessionFactory::builder()
            .settings(self.settings)
            .entity_persister(Arc::new(customers))
            .entity_persister(Arc::new(orders))
            .entity_persister(Arc::new(lines))
            .entity_persister(Arc::new(tickets))
            .entity_persister(Arc::new(countries))
            .collection_persister(Arc::new(order_lines));
        if let Some(interceptor) = self.interceptor {
            builder = builder.interceptor(interceptor);
        }
        Ok(Shop {
            factory: builder.build()?,
            store,
            cache: region,
        })
    }

    /// Builds the shop, panicking on an invalid mapping.
    #[must_use]
    pub fn build(self) -> Shop {
        self.try_build().expect("shop mapping is valid")
    }
}

/// The shop schema over an in-memory store.
#[derive(Debug)]
pub struct Shop {
    /// Factory serving the schema.
    pub factory: SessionFactory,
    /// Backing tables.
    pub store: Arc<InMemoryStore>,
    /// Cache region; only attached when built with [`ShopBuilder::cached`].
    pub cache: Arc<InMemoryCacheRegion>,
}

impl Shop {
    /// Starts configuring a shop.
    #[must_use]
    pub fn builder() -> ShopBuilder {
        ShopBuilder::default()
    }

    /// Builds a shop with default settings and no cache.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Opens a unit of work.
    #[must_use]
    pub fn session(&self) -> Session {
        self.factory.open_session()
    }

    /// Stores a customer row.
    pub fn seed_customer(&self, id: i64, name: &str, version: i64) {
        self.store.put_row(
            customer::NAME,
            id,
            vec![
                StoredValue::Text(name.into()),
                StoredValue::Text(format!("{}@example.com", name.to_lowercase())),
                StoredValue::Integer(version),
            ],
        );
    }

    /// Stores an order row and its lines.
    pub fn seed_order(&self, id: i64, status: &str, customer: Option<i64>, version: i64, lines: &[i64]) {
        self.store.put_row(
            order::NAME,
            id,
            vec![
                StoredValue::Text(status.into()),
                StoredValue::Null,
                customer.map_or(StoredValue::Null, |c| StoredValue::Reference(Identifier::from(c))),
                StoredValue::Collection,
                StoredValue::Integer(version),
            ],
        );
        self.store.put_elements(
            order::LINES_ROLE,
            id,
            lines.iter().map(|l| StoredValue::Reference(Identifier::from(*l))).collect(),
        );
    }

    /// Stores a line row.
    pub fn seed_line(&self, id: i64, product: &str, quantity: i64) {
        self.store.put_row(
            line::NAME,
            id,
            vec![StoredValue::Text(product.into()), StoredValue::Integer(quantity)],
        );
    }
}

impl Default for Shop {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates an unsaved customer.
#[must_use]
pub fn new_customer(name: &str) -> EntityRef {
    EntityRef::new(customer::NAME, vec![Value::from(name), Value::Null, Value::Null])
}

/// Creates an unsaved order with an empty line collection.
#[must_use]
pub fn new_order(status: &str, customer: Option<&EntityRef>) -> EntityRef {
    EntityRef::new(
        order::NAME,
        vec![
            Value::from(status),
            Value::Null,
            customer.map_or(Value::Null, Value::from),
            Value::Collection(CollectionRef::new(Vec::new())),
            Value::Null,
        ],
    )
}

/// Creates an unsaved line.
#[must_use]
pub fn new_line(product: &str, quantity: i64) -> EntityRef {
    EntityRef::new(line::NAME, vec![Value::from(product), Value::from(quantity)])
}

/// Returns the lines collection of an order.
///
/// # Panics
///
/// Panics if the property does not hold a collection.
#[must_use]
pub fn lines_of(order: &EntityRef) -> CollectionRef {
    match order.get(order::LINES) {
        Value::Collection(lines) => lines,
        other => panic!("order lines hold {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shop_mapping_validates() {
        let shop = Shop::new();
        assert_eq!(
            shop.factory.entity_names(),
            vec!["Country", "Customer", "Line", "Order", "Ticket"]
        );
        assert!(shop.factory.collection_persister(order::LINES_ROLE).is_ok());
    }

    #[test]
    fn seeded_rows_match_the_mapping_width() {
        let shop = Shop::new();
        shop.seed_customer(1, "Ann", 0);
        shop.seed_order(10, "NEW", Some(1), 0, &[]);
        assert_eq!(shop.store.row(customer::NAME, 1).unwrap().len(), customer_metamodel().property_count());
        assert_eq!(shop.store.row(order::NAME, 10).unwrap().len(), order_metamodel().property_count());
    }
}
