//! Flush planning, action ordering and cascades.

use std::sync::Arc;
use tessera_core::action::ActionKind;
use tessera_core::{
    CascadeStyle, CascadingAction, CoreError, EntityMetamodel, EntityRef, FlushMode, Identifier, PropertyMetadata,
    SessionFactory, StoredValue, Value,
};
use tessera_testkit::prelude::*;

#[test]
fn writes_run_inserts_then_updates_then_deletes() {
    init_tracing();
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    shop.seed_customer(2, "Bob", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    let bob = session.get(customer::NAME, 2).unwrap().unwrap();

    session.delete(&bob).unwrap();
    ann.set(customer::FULL_NAME, "Annie");
    session.save(&new_customer("Carl")).unwrap();
    assert_eq!(
        session.action_queue().queued_kinds(),
        vec![ActionKind::Insert, ActionKind::Delete]
    );

    shop.store.clear_operations();
    let report = session.flush().unwrap();

    let kinds: Vec<OperationKind> = shop.store.writes().iter().map(Operation::kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::Insert, OperationKind::Update, OperationKind::Delete]
    );
    assert_eq!((report.inserts, report.updates, report.deletes), (1, 1, 1));
    assert!(!session.action_queue().has_any_queued_actions());
}

#[test]
fn saving_an_order_cascades_to_its_customer_and_lines() {
    let shop = Shop::new();
    let mut session = shop.session();
    let ann = new_customer("Ann");
    let placed = new_order("NEW", Some(&ann));
    lines_of(&placed).push(new_line("tea", 2)).unwrap();
    lines_of(&placed).push(new_line("cake", 1)).unwrap();

    session.save(&placed).unwrap();
    assert!(session.contains(&ann));

    let report = session.flush().unwrap();
    assert_eq!(report.inserts, 4);
    assert_eq!(report.collection_recreates, 1);
    assert_eq!(report.updates, 0);

    let order_id = placed.identifier().unwrap();
    assert_eq!(shop.store.row_count(line::NAME), 2);
    assert_eq!(shop.store.elements(order::LINES_ROLE, order_id.clone()).len(), 2);
    let row = shop.store.row(order::NAME, order_id).unwrap();
    assert_eq!(row[order::CUSTOMER], StoredValue::Reference(ann.identifier().unwrap()));
    assert_eq!(row[order::VERSION], StoredValue::Integer(0));

    // nothing left to write
    let again = session.flush().unwrap();
    assert_eq!((again.inserts, again.updates, again.collection_updates), (0, 0, 0));
}

#[test]
fn removing_a_line_deletes_the_orphan_and_bumps_the_owner() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    shop.seed_line(2, "cake", 1);
    shop.seed_order(10, "NEW", None, 0, &[1, 2]);
    let mut session = shop.session();
    let placed = session.get(order::NAME, 10).unwrap().unwrap();
    let lines = lines_of(&placed);
    session.initialize_collection(&lines).unwrap();

    let first = lines.elements().unwrap()[0].clone();
    assert!(lines.remove(&first).unwrap());

    let report = session.flush().unwrap();
    assert_eq!(report.deletes, 1);
    assert_eq!(report.collection_updates, 1);
    assert_eq!(report.updates, 1);
    assert!(shop.store.row(line::NAME, 1).is_none());
    assert_eq!(
        shop.store.elements(order::LINES_ROLE, 10),
        vec![StoredValue::Reference(Identifier::from(2))]
    );
    assert_eq!(placed.get(order::VERSION), Value::from(1));
}

#[test]
fn deleting_an_order_deletes_its_lines() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    shop.seed_line(2, "cake", 1);
    shop.seed_order(10, "NEW", None, 0, &[1, 2]);
    let mut session = shop.session();
    let placed = session.get(order::NAME, 10).unwrap().unwrap();

    session.delete(&placed).unwrap();
    let report = session.flush().unwrap();

    assert_eq!(report.deletes, 3);
    assert_eq!(report.collection_removals, 1);
    assert_eq!(shop.store.row_count(order::NAME), 0);
    assert_eq!(shop.store.row_count(line::NAME), 0);
    assert!(shop.store.elements(order::LINES_ROLE, 10).is_empty());
}

#[test]
fn a_collection_moved_to_a_new_owner_is_rejected() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    shop.seed_order(10, "NEW", None, 0, &[1]);
    shop.seed_order(11, "NEW", None, 0, &[]);
    let mut session = shop.session();
    let first = session.get(order::NAME, 10).unwrap().unwrap();
    let second = session.get(order::NAME, 11).unwrap().unwrap();

    second.set(order::LINES, Value::Collection(lines_of(&first)));
    assert!(matches!(session.flush(), Err(CoreError::SharedCollection { .. })));
}

#[test]
fn auto_flush_only_runs_for_overlapping_spaces() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    ann.set(customer::FULL_NAME, "Annie");

    assert!(!session.auto_flush_if_required(&[order::NAME]).unwrap());
    assert_eq!(shop.store.count(OperationKind::Update), 0);

    assert!(session.auto_flush_if_required(&[customer::NAME]).unwrap());
    assert_eq!(shop.store.count(OperationKind::Update), 1);

    session.set_flush_mode(FlushMode::Manual);
    ann.set(customer::FULL_NAME, "Ann");
    assert!(!session.auto_flush_if_required(&[customer::NAME]).unwrap());
    assert_eq!(shop.store.count(OperationKind::Update), 1);
}

#[test]
fn auto_flush_keeps_pending_inserts() {
    let shop = Shop::new();
    let mut session = shop.session();
    session.save(&new_customer("Ann")).unwrap();

    assert!(!session.auto_flush_if_required(&[order::NAME]).unwrap());
    assert_eq!(session.action_queue().insertion_count(), 1);
    assert_eq!(shop.store.row_count(customer::NAME), 0);
}

#[test]
fn dirty_check_does_not_write() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    assert!(!session.is_dirty().unwrap());

    ann.set(customer::FULL_NAME, "Annie");
    assert!(session.is_dirty().unwrap());
    assert!(shop.store.writes().is_empty());
    assert_eq!(session.action_queue().update_count(), 0);

    assert_eq!(session.flush().unwrap().updates, 1);
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn a_failing_write_aborts_the_flush() {
    let shop = Shop::new();
    let mut session = shop.session();
    session.save(&new_customer("Ann")).unwrap();
    session.save(&new_customer("Bob")).unwrap();
    shop.store.fail_next(OperationKind::Insert, "disk full");

    let err = session.flush().unwrap_err();

    assert!(matches!(err, CoreError::Store { .. }));
    assert_eq!(shop.store.row_count(customer::NAME), 0);
    assert!(!session.action_queue().has_any_queued_actions());
}

#[test]
fn a_cancelled_flush_stops_before_writing() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    ann.set(customer::FULL_NAME, "Annie");

    let handle = session.cancellation_handle();
    handle.cancel();
    assert!(matches!(session.flush(), Err(CoreError::Cancelled)));
    assert_eq!(shop.store.count(OperationKind::Update), 0);

    // the request is consumed
    assert_eq!(session.flush().unwrap().updates, 1);
}

#[test]
fn rollback_discards_queued_work() {
    let shop = Shop::new();
    let mut session = shop.session();
    session.set_flush_mode(FlushMode::Manual);
    session.save(&new_customer("Ann")).unwrap();

    session.before_transaction_completion().unwrap();
    session.after_transaction_completion(false);

    assert!(!session.action_queue().has_any_queued_actions());
    assert_eq!(shop.store.row_count(customer::NAME), 0);
}

fn review_factory(author_required: bool) -> (SessionFactory, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let author = PropertyMetadata::many_to_one("author", customer::NAME);
    let review = EntityMetamodel::new("Review")
        .property(PropertyMetadata::basic("text"))
        .property(if author_required { author.not_null() } else { author });
    let factory = SessionFactory::builder()
        .entity_persister(Arc::new(InMemoryEntityPersister::new(
            customer_metamodel(),
            Arc::clone(&store),
        )))
        .entity_persister(Arc::new(InMemoryEntityPersister::new(review, Arc::clone(&store))))
        .build()
        .unwrap();
    (factory, store)
}

#[test]
fn an_insert_waits_for_its_unsaved_author() {
    let (factory, store) = review_factory(true);
    let mut session = factory.open_session();
    let author = new_customer("Ann");
    let review = EntityRef::new("Review", vec![Value::from("great"), Value::from(&author)]);

    let err = session.save(&review).unwrap_err();
    assert!(matches!(
        err,
        CoreError::TransientPropertyValue { ref property, ref transient_entity_name, .. }
            if property == "author" && transient_entity_name == customer::NAME
    ));
    assert!(session.action_queue().unresolved_inserts().contains(&review));

    session.save(&author).unwrap();
    assert!(session.action_queue().unresolved_inserts().is_empty());
    assert_eq!(session.action_queue().insertion_count(), 2);

    session.flush().unwrap();
    assert_eq!(store.row_count("Review"), 1);
    assert_eq!(store.row_count(customer::NAME), 1);
}

#[test]
fn a_reference_to_a_deleted_author_is_written_as_null() {
    let (factory, store) = review_factory(false);
    store.put_row(
        customer::NAME,
        1,
        vec![
            StoredValue::Text("Ann".into()),
            StoredValue::Text("ann@example.com".into()),
            StoredValue::Integer(0),
        ],
    );
    let mut session = factory.open_session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();
    session.delete(&ann).unwrap();
    let review = EntityRef::new("Review", vec![Value::from("gone"), Value::from(&ann)]);
    session.save(&review).unwrap();

    let report = session.flush().unwrap();

    assert_eq!((report.inserts, report.updates, report.deletes), (1, 0, 1));
    let id = review.identifier().unwrap();
    assert_eq!(store.row("Review", id).unwrap()[1], StoredValue::Null);
    assert_eq!(store.row_count(customer::NAME), 0);
    // the instance keeps its reference
    assert_eq!(review.get(1), Value::from(&ann));
}

#[test]
fn a_save_cascade_around_a_cycle_visits_each_instance_once() {
    let store = Arc::new(InMemoryStore::new());
    let node = EntityMetamodel::new("Node")
        .property(PropertyMetadata::basic("label"))
        .property(PropertyMetadata::many_to_one("next", "Node").cascade(CascadeStyle::of(CascadingAction::SaveUpdate)));
    let factory = SessionFactory::builder()
        .entity_persister(Arc::new(InMemoryEntityPersister::new(node, Arc::clone(&store))))
        .build()
        .unwrap();
    let mut session = factory.open_session();
    let a = EntityRef::new("Node", vec![Value::from("a"), Value::Null]);
    let b = EntityRef::new("Node", vec![Value::from("b"), Value::from(&a)]);
    a.set(1, &b);

    session.save(&a).unwrap();
    assert_eq!(session.action_queue().insertion_count(), 2);
    assert!(session.contains(&b));

    session.flush().unwrap();
    assert_eq!(store.row_count("Node"), 2);
    let a_id = a.identifier().unwrap();
    let b_id = b.identifier().unwrap();
    assert_eq!(store.row("Node", a_id.clone()).unwrap()[1], StoredValue::Reference(b_id.clone()));
    // b went in first with a null key and is updated once a exists
    assert_eq!(store.row("Node", b_id).unwrap()[1], StoredValue::Reference(a_id));
}
