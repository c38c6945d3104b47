//! Shared in-memory tables with an operation log and failure injection.
//!
//! One [`InMemoryStore`] backs every persister of a test factory. Each call a
//! persister makes is appended to the log, so tests can assert the exact
//! sequence of writes a flush produced.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tessera_core::{CoreError, CoreResult, Identifier, LockMode, Row, StoredValue};

/// One store call, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Row read by identifier.
    Load {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
        /// Lock requested with the read.
        lock: LockMode,
    },
    /// Several rows read at once.
    LoadBatch {
        /// Entity name.
        entity: String,
        /// Requested identifiers.
        ids: Vec<Identifier>,
    },
    /// Single lazy column read.
    LoadProperty {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
        /// Column index.
        index: usize,
    },
    /// Row written.
    Insert {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
    },
    /// Row rewritten.
    Update {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
    },
    /// Row removed.
    Delete {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
    },
    /// Lock taken on an existing row.
    Lock {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
        /// Requested mode.
        mode: LockMode,
    },
    /// Version read without the rest of the row.
    VersionCheck {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
    },
    /// Version bumped in place.
    VersionIncrement {
        /// Entity name.
        entity: String,
        /// Row identifier.
        id: Identifier,
    },
    /// Elements of a collection read.
    CollectionLoad {
        /// Collection role.
        role: String,
        /// Owner identifier.
        key: Identifier,
    },
    /// Every element of a collection written.
    CollectionRecreate {
        /// Collection role.
        role: String,
        /// Owner identifier.
        key: Identifier,
    },
    /// Every element of a collection removed.
    CollectionRemove {
        /// Collection role.
        role: String,
        /// Owner identifier.
        key: Identifier,
    },
    /// Individual element rows removed.
    CollectionDeleteRows {
        /// Collection role.
        role: String,
        /// Owner identifier.
        key: Identifier,
        /// Number of rows.
        count: usize,
    },
    /// Individual element rows added.
    CollectionInsertRows {
        /// Collection role.
        role: String,
        /// Owner identifier.
        key: Identifier,
        /// Number of rows.
        count: usize,
    },
}

impl Operation {
    /// Returns the kind of the operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Load { .. } => OperationKind::Load,
            Self::LoadBatch { .. } => OperationKind::LoadBatch,
            Self::LoadProperty { .. } => OperationKind::LoadProperty,
            Self::Insert { .. } => OperationKind::Insert,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Lock { .. } => OperationKind::Lock,
            Self::VersionCheck { .. } => OperationKind::VersionCheck,
            Self::VersionIncrement { .. } => OperationKind::VersionIncrement,
            Self::CollectionLoad { .. } => OperationKind::CollectionLoad,
            Self::CollectionRecreate { .. } => OperationKind::CollectionRecreate,
            Self::CollectionRemove { .. } => OperationKind::CollectionRemove,
            Self::CollectionDeleteRows { .. } => OperationKind::CollectionDeleteRows,
            Self::CollectionInsertRows { .. } => OperationKind::CollectionInsertRows,
        }
    }

    /// Returns the entity name or collection role the operation touched.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Load { entity, .. }
            | Self::LoadBatch { entity, .. }
            | Self::LoadProperty { entity, .. }
            | Self::Insert { entity, .. }
            | Self::Update { entity, .. }
            | Self::Delete { entity, .. }
            | Self::Lock { entity, .. }
            | Self::VersionCheck { entity, .. }
            | Self::VersionIncrement { entity, .. } => entity,
            Self::CollectionLoad { role, .. }
            | Self::CollectionRecreate { role, .. }
            | Self::CollectionRemove { role, .. }
            | Self::CollectionDeleteRows { role, .. }
            | Self::CollectionInsertRows { role, .. } => role,
        }
    }

    /// Returns true for operations that change stored data.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(
            self.kind(),
            OperationKind::Load
                | OperationKind::LoadBatch
                | OperationKind::LoadProperty
                | OperationKind::Lock
                | OperationKind::VersionCheck
                | OperationKind::CollectionLoad
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load { entity, id, .. } => write!(f, "load {entity}#{id}"),
            Self::LoadBatch { entity, ids } => write!(f, "load {entity} x{}", ids.len()),
            Self::LoadProperty { entity, id, index } => write!(f, "load {entity}#{id}[{index}]"),
            Self::Insert { entity, id } => write!(f, "insert {entity}#{id}"),
            Self::Update { entity, id } => write!(f, "update {entity}#{id}"),
            Self::Delete { entity, id } => write!(f, "delete {entity}#{id}"),
            Self::Lock { entity, id, mode } => write!(f, "lock {entity}#{id} {mode}"),
            Self::VersionCheck { entity, id } => write!(f, "check version {entity}#{id}"),
            Self::VersionIncrement { entity, id } => write!(f, "increment version {entity}#{id}"),
            Self::CollectionLoad { role, key } => write!(f, "load {role}#{key}"),
            Self::CollectionRecreate { role, key } => write!(f, "recreate {role}#{key}"),
            Self::CollectionRemove { role, key } => write!(f, "remove {role}#{key}"),
            Self::CollectionDeleteRows { role, key, count } => write!(f, "delete {count} rows of {role}#{key}"),
            Self::CollectionInsertRows { role, key, count } => write!(f, "insert {count} rows of {role}#{key}"),
        }
    }
}

/// Kind of a store operation, used to arm failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// See [`Operation::Load`].
    Load,
    /// See [`Operation::LoadBatch`].
    LoadBatch,
    /// See [`Operation::LoadProperty`].
    LoadProperty,
    /// See [`Operation::Insert`].
    Insert,
    /// See [`Operation::Update`].
    Update,
    /// See [`Operation::Delete`].
    Delete,
    /// See [`Operation::Lock`].
    Lock,
    /// See [`Operation::VersionCheck`].
    VersionCheck,
    /// See [`Operation::VersionIncrement`].
    VersionIncrement,
    /// See [`Operation::CollectionLoad`].
    CollectionLoad,
    /// See [`Operation::CollectionRecreate`].
    CollectionRecreate,
    /// See [`Operation::CollectionRemove`].
    CollectionRemove,
    /// See [`Operation::CollectionDeleteRows`].
    CollectionDeleteRows,
    /// See [`Operation::CollectionInsertRows`].
    CollectionInsertRows,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) rows: HashMap<String, BTreeMap<Identifier, Row>>,
    pub(crate) elements: HashMap<String, BTreeMap<Identifier, Vec<StoredValue>>>,
    pub(crate) identities: HashMap<String, i64>,
    log: Vec<Operation>,
    failures: Vec<(OperationKind, Option<String>, String)>,
}

impl Tables {
    /// Logs `operation`, failing it instead if a matching failure is armed.
    pub(crate) fn record(&mut self, operation: Operation) -> CoreResult<()> {
        let kind = operation.kind();
        let armed = self.failures.iter().position(|(k, target, _)| {
            *k == kind && target.as_deref().map_or(true, |t| t == operation.target())
        });
        if let Some(position) = armed {
            let (_, _, message) = self.failures.remove(position);
            tracing::debug!(%operation, %message, "injected store failure");
            return Err(CoreError::store(message));
        }
        self.log.push(operation);
        Ok(())
    }

    pub(crate) fn table(&mut self, entity: &str) -> &mut BTreeMap<Identifier, Row> {
        self.rows.entry(entity.to_string()).or_default()
    }

    pub(crate) fn collection(&mut self, role: &str) -> &mut BTreeMap<Identifier, Vec<StoredValue>> {
        self.elements.entry(role.to_string()).or_default()
    }
}

/// Thread-safe in-memory tables shared by the test persisters.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        f(&mut self.tables.lock())
    }

    /// Writes a row directly, bypassing the log.
    pub fn put_row(&self, entity: &str, id: impl Into<Identifier>, row: Row) {
        self.with_tables(|t| {
            t.table(entity).insert(id.into(), row);
        });
    }

    /// Reads a row directly, bypassing the log.
    #[must_use]
    pub fn row(&self, entity: &str, id: impl Into<Identifier>) -> Option<Row> {
        let id = id.into();
        self.with_tables(|t| t.rows.get(entity).and_then(|table| table.get(&id).cloned()))
    }

    /// Returns the number of rows of an entity.
    #[must_use]
    pub fn row_count(&self, entity: &str) -> usize {
        self.with_tables(|t| t.rows.get(entity).map_or(0, BTreeMap::len))
    }

    /// Removes a row directly, as a concurrent writer would.
    pub fn remove_row(&self, entity: &str, id: impl Into<Identifier>) -> Option<Row> {
        let id = id.into();
        self.with_tables(|t| t.table(entity).remove(&id))
    }

    /// Writes collection elements directly, bypassing the log.
    pub fn put_elements(&self, role: &str, key: impl Into<Identifier>, elements: Vec<StoredValue>) {
        self.with_tables(|t| {
            t.collection(role).insert(key.into(), elements);
        });
    }

    /// Reads collection elements directly; an absent collection is empty.
    #[must_use]
    pub fn elements(&self, role: &str, key: impl Into<Identifier>) -> Vec<StoredValue> {
        let key = key.into();
        self.with_tables(|t| {
            t.elements
                .get(role)
                .and_then(|c| c.get(&key).cloned())
                .unwrap_or_default()
        })
    }

    /// Returns the operations logged so far.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.with_tables(|t| t.log.clone())
    }

    /// Returns the logged operations that changed data.
    #[must_use]
    pub fn writes(&self) -> Vec<Operation> {
        self.with_tables(|t| t.log.iter().filter(|op| op.is_write()).cloned().collect())
    }

    /// Returns how many logged operations are of `kind`.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.with_tables(|t| t.log.iter().filter(|op| op.kind() == kind).count())
    }

    /// Forgets the logged operations.
    pub fn clear_operations(&self) {
        self.with_tables(|t| t.log.clear());
    }

    /// Fails the next operation of `kind` with a store error.
    pub fn fail_next(&self, kind: OperationKind, message: impl Into<String>) {
        let message = message.into();
        self.with_tables(|t| t.failures.push((kind, None, message)));
    }

    /// Fails the next operation of `kind` on one entity or role.
    pub fn fail_next_on(&self, kind: OperationKind, target: &str, message: impl Into<String>) {
        let message = message.into();
        self.with_tables(|t| t.failures.push((kind, Some(target.to_string()), message)));
    }

    /// Returns the number of armed failures not triggered yet.
    #[must_use]
    pub fn pending_failures(&self) -> usize {
        self.with_tables(|t| t.failures.len())
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("InMemoryStore")
            .field("entities", &tables.rows.keys().collect::<Vec<_>>())
            .field("operations", &tables.log.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_failure_fires_once() {
        let store = InMemoryStore::new();
        store.fail_next(OperationKind::Insert, "disk full");
        let insert = || Operation::Insert {
            entity: "Order".into(),
            id: Identifier::from(1),
        };
        let err = store.with_tables(|t| t.record(insert())).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(store.with_tables(|t| t.record(insert())).is_ok());
        assert_eq!(store.operations(), vec![insert()]);
    }

    #[test]
    fn targeted_failure_skips_other_entities() {
        let store = InMemoryStore::new();
        store.fail_next_on(OperationKind::Delete, "Line", "locked");
        let delete = |entity: &str| Operation::Delete {
            entity: entity.into(),
            id: Identifier::from(1),
        };
        assert!(store.with_tables(|t| t.record(delete("Order"))).is_ok());
        assert!(store.with_tables(|t| t.record(delete("Line"))).is_err());
        assert_eq!(store.pending_failures(), 0);
    }

    #[test]
    fn direct_access_bypasses_log() {
        let store = InMemoryStore::new();
        store.put_row("Order", 1, vec![StoredValue::Text("NEW".into())]);
        assert_eq!(store.row_count("Order"), 1);
        assert!(store.row("Order", 1).is_some());
        assert!(store.operations().is_empty());
        assert!(store.elements("Order.lines", 1).is_empty());
    }
}
