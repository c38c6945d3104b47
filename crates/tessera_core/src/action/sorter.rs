//! Grouping of inserts by entity name.

use super::Action;
use crate::types::InstanceId;
use crate::value::Value;

struct Batch {
    entity_name: String,
    members: Vec<InstanceId>,
    actions: Vec<Action>,
}

fn referenced_instances(action: &Action) -> Vec<InstanceId> {
    let state = match action {
        Action::Insert(insert) => insert.state(),
        Action::IdentityInsert(insert) => insert.state(),
        _ => return Vec::new(),
    };
    state
        .iter()
        .filter_map(Value::as_entity)
        .filter_map(|handle| handle.peek_implementation())
        .map(|entity| entity.instance_id())
        .collect()
}

/// Reorders inserts so that inserts of one entity name run back to back.
///
/// An insert joins the first batch of its entity name that does not precede
/// a batch holding an instance it references; otherwise it opens a new batch.
pub(crate) fn sort_insertions(actions: Vec<Action>) -> Vec<Action> {
    let mut batches: Vec<Batch> = Vec::new();
    for action in actions {
        let Some(entity) = action.entity().cloned() else {
            batches.push(Batch {
                entity_name: String::new(),
                members: Vec::new(),
                actions: vec![action],
            });
            continue;
        };
        let references = referenced_instances(&action);
        let earliest = batches
            .iter()
            .rposition(|batch| batch.members.iter().any(|member| references.contains(member)))
            .unwrap_or(0);
        let target = batches
            .iter()
            .enumerate()
            .skip(earliest)
            .find(|(_, batch)| batch.entity_name == entity.entity_name())
            .map(|(index, _)| index);
        match target {
            Some(index) => {
                batches[index].members.push(entity.instance_id());
                batches[index].actions.push(action);
            }
            None => batches.push(Batch {
                entity_name: entity.entity_name().to_string(),
                members: vec![entity.instance_id()],
                actions: vec![action],
            }),
        }
    }
    batches.into_iter().flat_map(|batch| batch.actions).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::EntityInsertAction;
    use crate::entity::EntityRef;
    use crate::metadata::{EntityMetamodel, PropertyMetadata};
    use crate::test_support::entity_persister;
    use crate::types::Identifier;

    fn insert(entity: &EntityRef, state: Vec<Value>) -> Action {
        let meta = EntityMetamodel::new(entity.entity_name())
            .property(PropertyMetadata::many_to_one("parent", "Node"));
        Action::Insert(EntityInsertAction::new(
            entity.clone(),
            Identifier::from(entity.instance_id().as_u64() as i64),
            state,
            None,
            entity_persister(meta),
        ))
    }

    fn names(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(Action::entity)
            .map(|e| e.entity_name().to_string())
            .collect()
    }

    #[test]
    fn groups_by_entity_name() {
        let a1 = EntityRef::new("A", vec![]);
        let b1 = EntityRef::new("B", vec![]);
        let a2 = EntityRef::new("A", vec![]);
        let sorted = sort_insertions(vec![
            insert(&a1, vec![Value::Null]),
            insert(&b1, vec![Value::Null]),
            insert(&a2, vec![Value::Null]),
        ]);
        assert_eq!(names(&sorted), vec!["A", "A", "B"]);
    }

    #[test]
    fn never_moves_ahead_of_referenced_insert() {
        let a1 = EntityRef::new("A", vec![]);
        let b1 = EntityRef::new("B", vec![]);
        let a2 = EntityRef::new("A", vec![]);
        let sorted = sort_insertions(vec![
            insert(&a1, vec![Value::Null]),
            insert(&b1, vec![Value::Null]),
            insert(&a2, vec![Value::from(&b1)]),
        ]);
        assert_eq!(names(&sorted), vec!["A", "B", "A"]);
    }
}
