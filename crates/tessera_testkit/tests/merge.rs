//! Copying detached and unsaved graphs into a unit of work.

use std::sync::Arc;
use tessera_core::{
    CascadeStyle, CascadingAction, CollectionMetadata, CollectionRef, CoreError, ElementType, EntityHandle,
    EntityMetamodel, EntityRef, Identifier, PropertyMetadata, SessionFactory, Settings, Status, StoredValue, Value,
};
use tessera_testkit::prelude::*;

fn detached_customer(shop: &Shop, id: i64) -> EntityRef {
    let mut session = shop.session();
    session.get(customer::NAME, id).unwrap().unwrap()
}

#[test]
fn detached_state_is_copied_onto_the_managed_instance() {
    init_tracing();
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let detached = detached_customer(&shop, 1);
    detached.set(customer::FULL_NAME, "Annie");

    let mut session = shop.session();
    let managed = session.merge(&detached).unwrap();

    assert!(!managed.same_instance(&detached));
    assert!(session.contains(&managed));
    assert!(!session.contains(&detached));
    assert_eq!(managed.get(customer::FULL_NAME), Value::from("Annie"));

    session.flush().unwrap();
    let row = shop.store.row(customer::NAME, 1).unwrap();
    assert_eq!(row[customer::FULL_NAME], StoredValue::Text("Annie".into()));
    assert_eq!(row[customer::VERSION], StoredValue::Integer(1));
}

#[test]
fn a_managed_instance_merges_onto_itself() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let mut session = shop.session();
    let ann = session.get(customer::NAME, 1).unwrap().unwrap();

    let merged = session.merge(&ann).unwrap();
    assert!(merged.same_instance(&ann));
}

#[test]
fn a_stale_detached_instance_is_rejected() {
    let shop = Shop::new();
    shop.seed_customer(1, "Ann", 0);
    let detached = detached_customer(&shop, 1);

    {
        let mut other = shop.session();
        let ann = other.get(customer::NAME, 1).unwrap().unwrap();
        ann.set(customer::FULL_NAME, "Anna");
        other.flush().unwrap();
    }

    detached.set(customer::FULL_NAME, "Annie");
    let mut session = shop.session();
    let err = session.merge(&detached).unwrap_err();

    assert!(matches!(err, CoreError::StaleObjectState { .. }));
    assert_eq!(shop.factory.statistics().snapshot().optimistic_failures, 1);
}

#[test]
fn a_detached_instance_without_a_row_is_saved_as_new() {
    let shop = Shop::new();
    let ghost = EntityRef::with_identifier(
        customer::NAME,
        Identifier::from(42),
        vec![Value::from("Ghost"), Value::Null, Value::from(0)],
    );

    let mut session = shop.session();
    let copy = session.merge(&ghost).unwrap();

    assert!(session.contains(&copy));
    assert_eq!(copy.get(customer::FULL_NAME), Value::from("Ghost"));
    session.flush().unwrap();
    assert_eq!(shop.store.row_count(customer::NAME), 1);
}

#[test]
fn an_unsaved_instance_gets_a_saved_copy() {
    let shop = Shop::new();
    let original = new_customer("Ann");

    let mut session = shop.session();
    let copy = session.merge(&original).unwrap();

    assert!(!copy.same_instance(&original));
    assert!(session.contains(&copy));
    assert!(!session.contains(&original));
    assert_eq!(copy.identifier(), Some(Identifier::from(1001)));
    assert_eq!(session.flush().unwrap().inserts, 1);
}

#[test]
fn merging_an_order_merges_its_lines() {
    let shop = Shop::new();
    shop.seed_line(1, "tea", 2);
    shop.seed_order(10, "NEW", None, 0, &[1]);
    let detached = {
        let mut first = shop.session();
        let placed = first.get(order::NAME, 10).unwrap().unwrap();
        first.initialize_collection(&lines_of(&placed)).unwrap();
        placed
    };
    lines_of(&detached).push(new_line("cake", 1)).unwrap();

    let mut session = shop.session();
    let managed = session.merge(&detached).unwrap();
    assert_eq!(lines_of(&managed).len().unwrap(), 2);

    let report = session.flush().unwrap();
    assert_eq!(report.inserts, 1);
    assert_eq!(report.collection_updates, 1);
    assert_eq!(shop.store.row_count(line::NAME), 2);
    assert_eq!(shop.store.elements(order::LINES_ROLE, 10).len(), 2);
}

fn review_factory(settings: Settings) -> SessionFactory {
    let store = Arc::new(InMemoryStore::new());
    let review = EntityMetamodel::new("Review")
        .property(PropertyMetadata::basic("text"))
        .property(PropertyMetadata::many_to_one("author", customer::NAME).not_null());
    SessionFactory::builder()
        .settings(settings)
        .entity_persister(Arc::new(InMemoryEntityPersister::new(
            customer_metamodel(),
            Arc::clone(&store),
        )))
        .entity_persister(Arc::new(InMemoryEntityPersister::new(review, store)))
        .build()
        .unwrap()
}

#[test]
fn copies_waiting_on_unsaved_references_fail_the_merge() {
    let factory = review_factory(Settings::default().merge_retry_limit(2));
    let mut session = factory.open_session();
    let author = new_customer("Ann");
    let review = EntityRef::new("Review", vec![Value::from("great"), Value::from(&author)]);

    let err = session.merge(&review).unwrap_err();

    match err {
        CoreError::TransientObjects { entity_names } => assert_eq!(entity_names, vec!["Review".to_string()]),
        other => panic!("unexpected error {other}"),
    }
}

/// `Shelf(label, reviews, authors)` where both collections cascade merge.
fn shelf_factory() -> (SessionFactory, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let merge = CascadeStyle::of(CascadingAction::Merge);
    let shelf = EntityMetamodel::new("Shelf")
        .property(PropertyMetadata::basic("label"))
        .property(PropertyMetadata::collection("reviews", "Shelf.reviews").cascade(merge))
        .property(PropertyMetadata::collection("authors", "Shelf.authors").cascade(merge));
    let review = EntityMetamodel::new("Review")
        .property(PropertyMetadata::basic("text"))
        .property(PropertyMetadata::many_to_one("author", customer::NAME).not_null());
    let role = |name: &str, element: &str| {
        InMemoryCollectionPersister::new(
            CollectionMetadata::new(name, "Shelf", ElementType::Entity(element.to_string())),
            Arc::clone(&store),
        )
    };
    let factory = SessionFactory::builder()
        .entity_persister(Arc::new(InMemoryEntityPersister::new(
            customer_metamodel(),
            Arc::clone(&store),
        )))
        .entity_persister(Arc::new(InMemoryEntityPersister::new(review, Arc::clone(&store))))
        .entity_persister(Arc::new(InMemoryEntityPersister::new(shelf, Arc::clone(&store))))
        .collection_persister(Arc::new(role("Shelf.reviews", "Review")))
        .collection_persister(Arc::new(role("Shelf.authors", customer::NAME)))
        .build()
        .unwrap();
    (factory, store)
}

#[test]
fn a_copy_waiting_on_a_later_merged_reference_is_saved() {
    let (factory, store) = shelf_factory();
    let mut session = factory.open_session();
    let author = new_customer("Ann");
    let review = EntityRef::new("Review", vec![Value::from("great"), Value::from(&author)]);
    // the review is merged before the author it references
    let shelf = EntityRef::new(
        "Shelf",
        vec![
            Value::from("favourites"),
            Value::Collection(CollectionRef::new(vec![Value::from(&review)])),
            Value::Collection(CollectionRef::new(vec![Value::from(&author)])),
        ],
    );

    let copy = session.merge(&shelf).unwrap();

    let Value::Collection(reviews) = copy.get(1) else {
        panic!("expected the copied reviews");
    };
    let Value::Entity(EntityHandle::Entity(review_copy)) = reviews.elements().unwrap()[0].clone() else {
        panic!("expected a review copy");
    };
    assert!(!review_copy.same_instance(&review));
    assert_eq!(
        session.persistence_context().get_entry(&review_copy).unwrap().status(),
        Status::Managed
    );
    assert!(session.action_queue().unresolved_inserts().is_empty());

    session.flush().unwrap();
    assert_eq!(store.row_count("Review"), 1);
    assert_eq!(store.row_count(customer::NAME), 1);
    assert_eq!(store.row_count("Shelf"), 1);
}
