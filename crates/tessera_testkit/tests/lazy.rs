//! Placeholders, batch fetching, lazy collections and lazy properties.

use tessera_core::{CoreError, EntityHandle, Value};
use tessera_testkit::prelude::*;

fn customer_placeholder(value: Value) -> tessera_core::ProxyRef {
    match value {
        Value::Entity(EntityHandle::Proxy(proxy)) => proxy,
        other => panic!("expected a placeholder, found {other:?}"),
    }
}

#[test]
fn load_hands_out_a_placeholder_without_reading() {
    init_tracing();
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();

    let EntityHandle::Proxy(proxy) = session.load(customer::NAME, 1).unwrap() else {
        panic!("expected a placeholder");
    };
    assert!(!proxy.is_initialized());
    assert!(shop.store.operations().is_empty());

    let ann = session.initialize_proxy(&proxy).unwrap();
    assert!(proxy.is_initialized());
    assert!(proxy.implementation().unwrap().same_instance(&ann));
    assert_eq!(ann.get(customer::FULL_NAME), Value::from("Ann"));

    let again = session.get(customer::NAME, 1).unwrap().unwrap();
    assert!(again.same_instance(&ann));
    assert_eq!(shop.store.count(OperationKind::Load), 1);
}

#[test]
fn placeholders_only_initialize_in_their_own_open_session() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let EntityHandle::Proxy(proxy) = session.load(customer::NAME, 1).unwrap() else {
        panic!("expected a placeholder");
    };

    let mut other = shop.session();
    assert!(matches!(
        other.initialize_proxy(&proxy),
        Err(CoreError::LazyInitialization { .. })
    ));

    session.close();
    assert!(matches!(
        session.initialize_proxy(&proxy),
        Err(CoreError::LazyInitialization { .. })
    ));
    assert!(matches!(proxy.implementation(), Err(CoreError::LazyInitialization { .. })));
}

#[test]
fn customer_placeholders_are_fetched_in_one_batch() {
    let shop = Shop::new();
    for (id, name) in [(1, "Ann"), (2, "Bob"), (3, "Cid")] {
        shop.seed_customer(id, name, 0);
        shop.seed_order(id + 10, "NEW", Some(id), 0, &[]);
    }
    let mut session = shop.session();
    let orders: Vec<_> = (11..=13)
        .map(|id| session.get(order::NAME, id).unwrap().unwrap())
        .collect();
    assert_eq!(shop.store.count(OperationKind::Load), 3);

    let first = customer_placeholder(orders[0].get(order::CUSTOMER));
    assert!(!first.is_initialized());
    let ann = session.initialize_proxy(&first).unwrap();
    assert_eq!(ann.get(customer::FULL_NAME), Value::from("Ann"));

    assert_eq!(shop.store.count(OperationKind::LoadBatch), 1);
    assert_eq!(shop.store.count(OperationKind::Load), 3);
    for placed in &orders[1..] {
        assert!(customer_placeholder(placed.get(order::CUSTOMER)).is_initialized());
    }
    assert_eq!(shop.factory.statistics().snapshot().entity_fetches, 4);
}

#[test]
fn lines_are_loaded_on_demand() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    shop.seed_line(2, "cake", 1);
    shop.seed_order(10, "NEW", None, 0, &[1, 2]);
    let mut session = shop.session();
    let placed = session.get(order::NAME, 10).unwrap().unwrap();
    let lines = lines_of(&placed);

    assert!(!lines.is_initialized());
    assert!(matches!(lines.elements(), Err(CoreError::LazyInitialization { .. })));
    assert!(matches!(
        lines.push(new_line("jam", 1)),
        Err(CoreError::LazyInitialization { .. })
    ));

    session.initialize_collection(&lines).unwrap();
    assert_eq!(lines.len().unwrap(), 2);
    assert_eq!(shop.store.count(OperationKind::CollectionLoad), 1);
    assert_eq!(shop.factory.statistics().snapshot().collection_loads, 1);

    // elements are tracked instances
    let tea = session.get(line::NAME, 1).unwrap().unwrap();
    assert_eq!(lines.elements().unwrap()[0], Value::from(&tea));

    // no-op once loaded
    session.initialize_collection(&lines).unwrap();
    assert_eq!(shop.store.count(OperationKind::CollectionLoad), 1);
}

#[test]
fn lines_cannot_load_after_close() {
    let shop = Shop::new();
    shop.seed_order(10, "NEW", None, 0, &[]);
    let mut session = shop.session();
    let placed = session.get(order::NAME, 10).unwrap().unwrap();
    session.close();

    assert!(matches!(
        session.initialize_collection(&lines_of(&placed)),
        Err(CoreError::LazyInitialization { .. })
    ));
    let mut other = shop.session();
    assert!(matches!(
        other.initialize_collection(&lines_of(&placed)),
        Err(CoreError::LazyInitialization { .. })
    ));
}

#[test]
fn lazy_email_is_fetched_separately() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    assert_eq!(ann.get(customer::EMAIL), Value::Unfetched);
    assert!(!ann.is_property_initialized(customer::EMAIL));

    let email = session.fetch_lazy_property(&ann, "email").unwrap();
    assert_eq!(email, Value::from("ann@example.com"));
    assert!(ann.is_property_initialized(customer::EMAIL));
    assert_eq!(shop.store.count(OperationKind::LoadProperty), 1);

    session.fetch_lazy_property(&ann, "email").unwrap();
    assert_eq!(shop.store.count(OperationKind::LoadProperty), 1);

    // the fetch itself is not a modification
    assert_eq!(session.flush().unwrap().updates, 0);
}

#[test]
fn lazy_properties_need_a_tracking_session() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let ann = shop.session().get(customer::NAME, 1).unwrap().unwrap();

    let mut session = shop.session();
    assert!(matches!(
        session.fetch_lazy_property(&ann, "email"),
        Err(CoreError::LazyInitialization { .. })
    ));
}
