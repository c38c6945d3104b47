//! Property-based test generators using proptest.
//!
//! Provides strategies for identifiers, stored values and sequences of edits
//! to a tracked order.

use crate::fixtures::{lines_of, new_line, order};
use proptest::prelude::*;
use tessera_core::{CoreResult, EntityRef, Identifier, Session, StoredValue, Value};

/// Strategy for numeric and textual identifiers.
pub fn identifier_strategy() -> impl Strategy<Value = Identifier> {
    prop_oneof![
        (1i64..1_000_000).prop_map(Identifier::Integer),
        prop::string::string_regex("[A-Z]{2}[0-9]{1,4}")
            .expect("Invalid regex")
            .prop_map(Identifier::Text),
    ]
}

/// Strategy for order statuses.
pub fn status_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["NEW", "PAID", "PACKED", "SHIPPED", "CANCELLED"]).prop_map(String::from)
}

/// Strategy for stored scalars (no references, markers or lazy slots).
pub fn stored_scalar_strategy() -> impl Strategy<Value = StoredValue> {
    prop_oneof![
        Just(StoredValue::Null),
        any::<bool>().prop_map(StoredValue::Bool),
        any::<i64>().prop_map(StoredValue::Integer),
        "[a-z ]{0,16}".prop_map(StoredValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(StoredValue::Bytes),
        (0i64..4_102_444_800_000).prop_map(StoredValue::Timestamp),
    ]
}

/// One edit applied to a tracked order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEdit {
    /// Sets the status.
    Status(String),
    /// Sets or clears the note.
    Note(Option<String>),
    /// Appends a new line.
    AddLine(String, i64),
    /// Removes the first line, if any.
    RemoveFirstLine,
    /// Flushes the session.
    Flush,
}

impl OrderEdit {
    /// Applies the edit to `target` through `session`.
    ///
    /// # Errors
    ///
    /// Fails if the lines cannot be read or the flush fails.
    pub fn apply(&self, session: &mut Session, target: &EntityRef) -> CoreResult<()> {
        match self {
            Self::Status(status) => target.set(order::STATUS, status.as_str()),
            Self::Note(note) => target.set(order::NOTE, note.clone().map_or(Value::Null, Value::from)),
            Self::AddLine(product, quantity) => {
                let lines = lines_of(target);
                session.initialize_collection(&lines)?;
                lines.push(new_line(product, *quantity))?;
            }
            Self::RemoveFirstLine => {
                let lines = lines_of(target);
                session.initialize_collection(&lines)?;
                if let Some(first) = lines.elements()?.first() {
                    lines.remove(first)?;
                }
            }
            Self::Flush => {
                session.flush()?;
            }
        }
        Ok(())
    }
}

/// Strategy for a single order edit.
pub fn order_edit_strategy() -> impl Strategy<Value = OrderEdit> {
    prop_oneof![
        3 => status_strategy().prop_map(OrderEdit::Status),
        2 => prop::option::of("[a-z]{1,8}").prop_map(OrderEdit::Note),
        2 => ("[a-z]{3,8}", 1i64..20).prop_map(|(product, quantity)| OrderEdit::AddLine(product, quantity)),
        1 => Just(OrderEdit::RemoveFirstLine),
        1 => Just(OrderEdit::Flush),
    ]
}

/// Strategy for a sequence of order edits.
pub fn order_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<OrderEdit>> {
    prop::collection::vec(order_edit_strategy(), 0..=max_len)
}
