//! Identity map and instance lifecycle through the public session API.

use tessera_core::{CoreError, EntityHandle, Identifier, Settings, Status, StoredValue, Value, Version};
use tessera_testkit::prelude::*;

#[test]
fn repeated_get_returns_one_instance() {
    init_tracing();
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();

    let first = session.get(customer::NAME, 1).unwrap().unwrap();
    let second = session.get(customer::NAME, 1).unwrap().unwrap();

    assert!(first.same_instance(&second));
    assert_eq!(shop.store.count(OperationKind::Load), 1);
    assert_eq!(first.get(customer::FULL_NAME), Value::from("Ann"));
    let entry = session.persistence_context().get_entry(&first).unwrap();
    assert_eq!(entry.status(), Status::Managed);
    assert_eq!(entry.id(), Some(&Identifier::from(1)));
}

#[test]
fn missing_rows() {
    let shop = Shop::new();
    let mut session = shop.session();

    assert!(session.get(customer::NAME, 7).unwrap().is_none());
    assert!(matches!(
        session.load(order::NAME, 99),
        Err(CoreError::ObjectNotFound { .. })
    ));

    // customers are proxyable: the miss only shows when the placeholder is used
    let EntityHandle::Proxy(proxy) = session.load(customer::NAME, 7).unwrap() else {
        panic!("expected a placeholder");
    };
    assert!(matches!(
        session.initialize_proxy(&proxy),
        Err(CoreError::ObjectNotFound { .. })
    ));
}

#[test]
fn save_assigns_an_identifier_and_defers_the_insert() {
    let shop = Shop::new();
    let mut session = shop.session();
    let ann = new_customer("Ann");

    let id = session.save(&ann).unwrap();

    assert_eq!(id, Identifier::from(1001));
    assert_eq!(ann.identifier(), Some(id.clone()));
    assert!(session.contains(&ann));
    assert_eq!(ann.get(customer::VERSION), Value::from(0));
    assert_eq!(shop.store.row_count(customer::NAME), 0);

    let report = session.flush().unwrap();
    assert_eq!(report.inserts, 1);
    let row = shop.store.row(customer::NAME, id.clone()).unwrap();
    assert_eq!(row[customer::FULL_NAME], StoredValue::Text("Ann".into()));
    assert_eq!(row[customer::VERSION], StoredValue::Integer(0));

    let again = session.get(customer::NAME, id).unwrap().unwrap();
    assert!(again.same_instance(&ann));
}

#[test]
fn a_second_instance_under_a_tracked_identifier_is_rejected() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let _ann = session.get(customer::NAME, 1).unwrap().unwrap();

    let impostor = new_customer("Bob");
    let err = session.save_with_id(&impostor, Identifier::from(1)).unwrap_err();

    assert!(matches!(err, CoreError::NonUniqueObject { .. }));
    assert!(!session.contains(&impostor));
}

#[test]
fn deleted_instances_disappear() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    session.delete(&ann).unwrap();
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().status(),
        Status::Deleted
    );
    assert!(!session.contains(&ann));
    assert!(session.get(customer::NAME, 1).unwrap().is_none());
    assert!(matches!(session.save(&ann), Err(CoreError::ObjectDeleted { .. })));
    // deleting twice is harmless
    session.delete(&ann).unwrap();
    assert_eq!(session.action_queue().deletion_count(), 1);

    let report = session.flush().unwrap();
    assert_eq!(report.deletes, 1);
    assert!(shop.store.row(customer::NAME, 1).is_none());
    assert!(session.persistence_context().get_entry(&ann).is_none());
}

#[test]
fn evicted_changes_are_not_written() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    ann.set(customer::FULL_NAME, "Annie");
    session.evict(&ann).unwrap();

    let report = session.flush().unwrap();
    assert_eq!(report.updates, 0);
    assert!(!session.contains(&ann));
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::FULL_NAME],
        StoredValue::Text("Ann".into())
    );
}

#[test]
fn detached_instances_are_reattached_by_update() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let ann = {
        let mut first = shop.session();
        first.get(customer::NAME, 1).unwrap().unwrap()
    };
    ann.set(customer::FULL_NAME, "Annie");

    let mut session = shop.session();
    session.update(&ann).unwrap();
    assert!(session.contains(&ann));

    let report = session.flush().unwrap();
    assert_eq!(report.updates, 1);
    let row = shop.store.row(customer::NAME, 1).unwrap();
    assert_eq!(row[customer::FULL_NAME], StoredValue::Text("Annie".into()));
    // the lazy column was never fetched and survives the update
    assert_eq!(row[customer::EMAIL], StoredValue::Text("ann@example.com".into()));
    assert_eq!(row[customer::VERSION], StoredValue::Integer(1));
}

#[test]
fn saving_a_detached_instance_reattaches_unless_strict() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let ann = shop.session().get(customer::NAME, 1).unwrap().unwrap();

    let mut lenient = shop.session();
    assert_eq!(lenient.save(&ann).unwrap(), Identifier::from(1));
    assert!(lenient.contains(&ann));
    lenient.close();

    let strict = Shop::builder()
        .settings(Settings::default().strict_detached_save(true))
        .build();
    strict.seed_customer(1, "Ann", 0);
    let ann = strict.session().get(customer::NAME, 1).unwrap().unwrap();
    let mut session = strict.session();
    assert!(matches!(session.save(&ann), Err(CoreError::PersistentObject { .. })));
}

#[test]
fn updating_a_transient_instance_fails_unless_lenient() {
    let shop = Shop::new();
    let mut session = shop.session();
    assert!(matches!(
        session.update(&new_customer("Ann")),
        Err(CoreError::TransientObject { .. })
    ));

    let lenient = Shop::builder().settings(Settings::default().lenient_update(true)).build();
    let mut session = lenient.session();
    let ann = new_customer("Ann");
    session.update(&ann).unwrap();
    assert!(!session.contains(&ann));
    assert!(!session.action_queue().has_any_queued_actions());
}

#[test]
fn closed_sessions_reject_work() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    session.close();
    session.close();

    assert!(matches!(session.get(customer::NAME, 1), Err(CoreError::SessionClosed)));
    assert!(matches!(session.flush(), Err(CoreError::SessionClosed)));
    assert!(!session.contains(&ann));

    let stats = shop.factory.statistics().snapshot();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.sessions_closed, 1);
}

#[test]
fn identity_inserts_run_at_save() {
    let shop = Shop::new();
    let mut session = shop.session();
    let ticket = tessera_core::EntityRef::new("Ticket", vec![Value::from("printer jam")]);

    let id = session.save(&ticket).unwrap();

    assert_eq!(id, Identifier::from(1));
    assert_eq!(shop.store.row_count("Ticket"), 1);
    assert_eq!(session.action_queue().insertion_count(), 0);
}

#[test]
fn assigned_identifiers_must_be_present() {
    let shop = Shop::new();
    let mut session = shop.session();

    let nameless = tessera_core::EntityRef::new("Country", vec![Value::from("France")]);
    assert!(matches!(
        session.save(&nameless),
        Err(CoreError::InvalidOperation { .. })
    ));

    let france = tessera_core::EntityRef::with_identifier(
        "Country",
        Identifier::from("FR"),
        vec![Value::from("France")],
    );
    assert_eq!(session.save(&france).unwrap(), Identifier::from("FR"));
    session.flush().unwrap();
    assert_eq!(shop.store.row_count("Country"), 1);
    assert!(session.is_read_only(&france).unwrap());
}

#[test]
fn refresh_discards_local_changes() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    ann.set(customer::FULL_NAME, "Annie");
    shop.seed_customer(1, "Anna", 1);

    session.refresh(&ann).unwrap();

    assert_eq!(ann.get(customer::FULL_NAME), Value::from("Anna"));
    let entry = session.persistence_context().get_entry(&ann).unwrap();
    assert_eq!(entry.version(), Some(Version::Integer(1)));
    assert_eq!(session.flush().unwrap().updates, 0);

    shop.store.remove_row(customer::NAME, 1);
    assert!(matches!(session.refresh(&ann), Err(CoreError::ObjectNotFound { .. })));
    assert!(matches!(
        session.refresh(&new_customer("Bob")),
        Err(CoreError::TransientObject { .. })
    ));
}
