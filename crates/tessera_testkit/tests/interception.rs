//! Interceptor callbacks and read-only instances.

use std::sync::Arc;
use tessera_core::{CoreError, EntityRef, Identifier, Settings, Status, StoredValue, Value};
use tessera_testkit::prelude::*;

#[test]
fn the_interceptor_sees_saves_flushes_and_loads() {
    init_tracing();
    let recorder = Arc::new(RecordingInterceptor::new().stamping("note", "audited"));
    let shop = Shop::builder().interceptor(recorder.clone()).build();
    let mut session = shop.session();
    let placed = new_order("NEW", None);

    session.save(&placed).unwrap();
    assert_eq!(placed.get(order::NOTE), Value::from("audited"));
    session.flush().unwrap();

    let id = Identifier::from(1001);
    assert_eq!(
        recorder.calls(),
        vec![
            InterceptorCall::Save {
                entity: order::NAME.into(),
                id: Some(id.clone()),
            },
            InterceptorCall::PreFlush(1),
            InterceptorCall::PostFlush(1),
        ]
    );
    assert_eq!(
        shop.store.row(order::NAME, id.clone()).unwrap()[order::NOTE],
        StoredValue::Text("audited".into())
    );

    recorder.reset();
    placed.set(order::STATUS, "PAID");
    session.flush().unwrap();
    assert_eq!(
        recorder.calls(),
        vec![
            InterceptorCall::PreFlush(1),
            InterceptorCall::FlushDirty {
                entity: order::NAME.into(),
                id: id.clone(),
            },
            InterceptorCall::PostFlush(1),
        ]
    );

    recorder.reset();
    shop.session().get(order::NAME, id.clone()).unwrap().unwrap();
    assert_eq!(
        recorder.calls(),
        vec![InterceptorCall::Load {
            entity: order::NAME.into(),
            id,
        }]
    );
}

#[test]
fn a_stamp_written_at_flush_is_stored() {
    let shop = Shop::new();
    shop.seed_order(10, "NEW", None, 0, &[]);
    let recorder = Arc::new(RecordingInterceptor::new().stamping("note", "checked"));
    let mut session = shop.factory.open_session_with_interceptor(recorder.clone());
    let placed = session.get(order::NAME, 10).unwrap().unwrap();

    placed.set(order::STATUS, "PACKED");
    session.flush().unwrap();

    let row = shop.store.row(order::NAME, 10).unwrap();
    assert_eq!(row[order::STATUS], StoredValue::Text("PACKED".into()));
    assert_eq!(row[order::NOTE], StoredValue::Text("checked".into()));
    assert_eq!(placed.get(order::NOTE), Value::from("checked"));
}

#[test]
fn a_vetoed_delete_leaves_the_instance_managed() {
    let recorder = Arc::new(RecordingInterceptor::new().vetoing_deletes_of(customer::NAME));
    let shop = Shop::builder().interceptor(recorder).build();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    let err = session.delete(&ann).unwrap_err();

    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert_eq!(
        session.persistence_context().get_entry(&ann).unwrap().status(),
        Status::Managed
    );
    assert_eq!(session.flush().unwrap().deletes, 0);
    assert_eq!(shop.store.row_count(customer::NAME), 1);
}

#[test]
fn read_only_instances_are_not_written() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    session.set_read_only(&ann, true).unwrap();
    assert!(session.is_read_only(&ann).unwrap());
    ann.set(customer::FULL_NAME, "Annie");

    assert_eq!(session.flush().unwrap().updates, 0);
    assert_eq!(
        shop.store.row(customer::NAME, 1).unwrap()[customer::FULL_NAME],
        StoredValue::Text("Ann".into())
    );

    // changes made while read-only stay unwritten
    session.set_read_only(&ann, false).unwrap();
    assert_eq!(session.flush().unwrap().updates, 0);
    ann.set(customer::FULL_NAME, "Anna");
    assert_eq!(session.flush().unwrap().updates, 1);
}

#[test]
fn default_read_only_applies_to_later_loads() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    shop.seed_customer(2, "Bob", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    session.set_default_read_only(true);
    let bob = session.get(customer::NAME, 2).unwrap().unwrap();

    assert!(!session.is_read_only(&ann).unwrap());
    assert!(session.is_read_only(&bob).unwrap());

    let strict = Shop::builder().settings(Settings::default().default_read_only(true)).build();
    strict.seed_customer(1, "Ann", 0);
    let mut session = strict.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    assert!(session.is_read_only(&ann).unwrap());
}

#[test]
fn immutable_entities_load_read_only() {
    let shop = Shop::new();
    shop.store
        .put_row("Country", "DE", vec![StoredValue::Text("Germany".into())]);
    let mut session = shop.session();
    let germany = session.get("Country", "DE").unwrap().unwrap();

    assert!(session.is_read_only(&germany).unwrap());
    assert!(matches!(
        session.set_read_only(&germany, false),
        Err(CoreError::InvalidOperation { .. })
    ));

    germany.set(0, "Deutschland");
    assert_eq!(session.flush().unwrap().updates, 0);

    // immutable rows can still be deleted
    session.delete(&germany).unwrap();
    assert_eq!(session.flush().unwrap().deletes, 1);
    assert_eq!(shop.store.row_count("Country"), 0);
}

#[test]
fn read_only_requires_a_tracked_instance() {
    let shop = Shop::new();
    let mut session = shop.session();
    let stray = EntityRef::new(customer::NAME, vec![Value::from("Ann"), Value::Null, Value::Null]);
    assert!(matches!(
        session.set_read_only(&stray, true),
        Err(CoreError::TransientObject { .. })
    ));
}
