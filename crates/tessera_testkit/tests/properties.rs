//! Property tests over random edit sequences.

use proptest::prelude::*;
use tessera_core::{StoredValue, Value};
use tessera_testkit::prelude::*;

fn stored_text(value: &Value) -> StoredValue {
    match value {
        Value::Text(text) => StoredValue::Text(text.clone()),
        Value::Null => StoredValue::Null,
        other => panic!("unexpected scalar {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn a_second_flush_writes_nothing(edits in order_edits_strategy(8)) {
        let shop = Shop::new();
        shop.seed_line(1, "tea", 2);
        shop.seed_line(2, "cake", 1);
        shop.seed_order(10, "NEW", None, 0, &[1, 2]);
        let mut session = shop.session();
        let placed = session.get(order::NAME, 10).unwrap().unwrap();

        for edit in &edits {
            edit.apply(&mut session, &placed).unwrap();
        }
        session.flush().unwrap();

        shop.store.clear_operations();
        let report = session.flush().unwrap();
        prop_assert_eq!(report.inserts + report.updates + report.deletes, 0);
        prop_assert_eq!(
            report.collection_recreates + report.collection_updates + report.collection_removals,
            0
        );
        prop_assert!(shop.store.writes().is_empty());
        prop_assert!(!session.is_dirty().unwrap());
    }

    #[test]
    fn flushed_state_matches_the_instance(edits in order_edits_strategy(8)) {
        let shop = Shop::new();
        shop.seed_line(1, "tea", 2);
        shop.seed_order(10, "NEW", None, 0, &[1]);
        let mut session = shop.session();
        let placed = session.get(order::NAME, 10).unwrap().unwrap();

        for edit in &edits {
            edit.apply(&mut session, &placed).unwrap();
        }
        session.flush().unwrap();

        let row = shop.store.row(order::NAME, 10).unwrap();
        prop_assert_eq!(&row[order::STATUS], &stored_text(&placed.get(order::STATUS)));
        prop_assert_eq!(&row[order::NOTE], &stored_text(&placed.get(order::NOTE)));

        let lines = lines_of(&placed);
        if lines.is_initialized() {
            let stored = shop.store.elements(order::LINES_ROLE, 10);
            prop_assert_eq!(stored.len(), lines.len().unwrap());
            // orphans are gone, so every line row is referenced by the order
            prop_assert_eq!(shop.store.row_count(line::NAME), stored.len());
        }
    }
}
