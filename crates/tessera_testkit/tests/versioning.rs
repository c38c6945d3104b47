//! Optimistic versioning and lock modes.

use tessera_core::{CoreError, LockMode, LockOptions, StoredValue, Value, Version};
use tessera_testkit::prelude::*;

#[test]
fn a_dirty_instance_gets_the_next_version() {
    init_tracing();
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 3);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    ann.set(customer::FULL_NAME, "Annie");
    session.flush().unwrap();

    assert_eq!(ann.get(customer::VERSION), Value::from(4));
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::VERSION],
        StoredValue::Integer(4)
    );
    let entry = session.persistence_context().get_entry(&ann).unwrap();
    assert_eq!(entry.version(), Some(Version::Integer(4)));
    // the store only accepts the write against version 3
    assert_eq!(shop.store.count(OperationKind::Update), 1);
}

#[test]
fn unversioned_properties_are_written_without_a_bump() {
    let shop = Shop::new();
    shop.seed_order(10, "NEW", None, 2, &[]);
    let mut session = shop.session();
    let placed = session.get(order::NAME, 10).unwrap().unwrap();

    placed.set(order::NOTE, "gift wrap");
    let report = session.flush().unwrap();

    assert_eq!(report.updates, 1);
    assert_eq!(placed.get(order::VERSION), Value::from(2));
    let row = shop.store.row(order::NAME, 10).unwrap();
    assert_eq!(row[order::NOTE], StoredValue::Text("gift wrap".into()));
    assert_eq!(row[order::VERSION], StoredValue::Integer(2));
}

#[test]
fn concurrent_updates_are_detected() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut first = shop.session();
    let mut second = shop.session();
    let mine = first.get(customer::NAME, 1).unwrap().unwrap();
    let theirs = second.get(customer::NAME, 1).unwrap().unwrap();

    mine.set(customer::FULL_NAME, "Annie");
    first.flush().unwrap();

    theirs.set(customer::FULL_NAME, "Anna");
    let err = second.flush().unwrap_err();

    assert!(err.is_optimistic_failure());
    assert!(matches!(err, CoreError::StaleObjectState { ref entity_name, .. } if entity_name == customer::NAME));
    assert_eq!(shop.factory.statistics().snapshot().optimistic_failures, 1);
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::FULL_NAME],
        StoredValue::Text("Annie".into())
    );
}

#[test]
fn loaded_instances_hold_a_read_lock() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().lock_mode(),
        LockMode::Read
    );

    // not stronger than the held lock
    session.lock(&ann, LockOptions::read()).unwrap();
    assert_eq!(shop.store.count(OperationKind::Lock), 0);
}

#[test]
fn optimistic_lock_verifies_the_version_at_completion() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    session.lock(&ann, LockOptions::new(LockMode::Optimistic)).unwrap();
    assert_eq!(shop.store.count(OperationKind::VersionCheck), 0);

    session.before_transaction_completion().unwrap();
    assert_eq!(shop.store.count(OperationKind::VersionCheck), 1);
}

#[test]
fn optimistic_lock_fails_when_another_unit_of_work_wrote() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    session.lock(&ann, LockOptions::new(LockMode::Optimistic)).unwrap();

    {
        let mut other = shop.session();
        let copy = other.get(customer::NAME, 1).unwrap().unwrap();
        copy.set(customer::FULL_NAME, "Anna");
        other.flush().unwrap();
    }

    let err = session.before_transaction_completion().unwrap_err();
    assert!(matches!(err, CoreError::StaleObjectState { .. }));
    assert_eq!(shop.factory.statistics().snapshot().optimistic_failures, 1);
}

#[test]
fn forced_increments() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    shop.seed_customer(2, "Bob", 5);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    let bob = session.get(customer::NAME, 2).unwrap().unwrap();

    // deferred until completion
    session
        .lock(&ann, LockOptions::new(LockMode::OptimisticForceIncrement))
        .unwrap();
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::VERSION],
        StoredValue::Integer(0)
    );

    // immediate
    session
        .lock(&bob, LockOptions::new(LockMode::PessimisticForceIncrement))
        .unwrap();
    assert_eq!(
        shop.store.row(customer::NAME, 2).unwrap()[customer::VERSION],
        StoredValue::Integer(6)
    );
    assert_eq!(bob.get(customer::VERSION), Value::from(6));

    session.before_transaction_completion().unwrap();
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::VERSION],
        StoredValue::Integer(1)
    );
    assert_eq!(shop.store.count(OperationKind::VersionIncrement), 2);
}

#[test]
fn pessimistic_locks_go_to_the_store() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    session.lock(&ann, LockOptions::new(LockMode::PessimisticWrite)).unwrap();

    let locks: Vec<Operation> = shop
        .store
        .operations()
        .into_iter()
        .filter(|op| op.kind() == OperationKind::Lock)
        .collect();
    assert!(matches!(
        locks.as_slice(),
        [Operation::Lock { mode: LockMode::PessimisticWrite, .. }]
    ));
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().lock_mode(),
        LockMode::PessimisticWrite
    );

    session.after_transaction_completion(true);
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().lock_mode(),
        LockMode::None
    );
}

#[test]
fn invalid_lock_requests() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    let mut session = shop.session();
    let tea = session.get(line::NAME, 1).unwrap().unwrap();

    assert!(matches!(
        session.lock(&tea, LockOptions::new(LockMode::Write)),
        Err(CoreError::InvalidLockMode { .. })
    ));
    assert!(matches!(
        session.lock(&tea, LockOptions::new(LockMode::Optimistic)),
        Err(CoreError::InvalidLockMode { .. })
    ));
    assert!(matches!(
        session.lock(&new_customer("Ann"), LockOptions::new(LockMode::Upgrade)),
        Err(CoreError::TransientObject { .. })
    ));
}

#[test]
fn locking_a_detached_instance_reattaches_it() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let ann = shop.session().get(customer::NAME, 1).unwrap().unwrap();

    let mut session = shop.session();
    session.lock(&ann, LockOptions::new(LockMode::Upgrade)).unwrap();

    assert!(session.contains(&ann));
    assert_eq!(session.flush().unwrap().updates, 0);
}

#[test]
fn a_locked_read_goes_to_the_store() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();

    let ann = session
        .get_with_lock(customer::NAME, 1, LockOptions::new(LockMode::PessimisticRead))
        .unwrap()
        .unwrap();

    assert!(matches!(
        shop.store.operations().as_slice(),
        [Operation::Load { lock: LockMode::PessimisticRead, .. }]
    ));
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().lock_mode(),
        LockMode::PessimisticRead
    );
}
