//! Inserts waiting for unsaved instances they reference.

use super::Action;
use crate::engine::TransientDependency;
use crate::entity::EntityRef;
use crate::error::CoreError;
use std::fmt;

struct ParkedInsert {
    action: Action,
    dependencies: Vec<TransientDependency>,
}

/// Inserts parked until each non-nullable reference they hold is saved.
#[derive(Default)]
pub struct UnresolvedInserts {
    parked: Vec<ParkedInsert>,
}

impl UnresolvedInserts {
    pub(crate) fn park(&mut self, action: Action, dependencies: Vec<TransientDependency>) {
        tracing::debug!(
            action = ?action,
            waiting_for = dependencies.len(),
            "insert parked until its references are saved"
        );
        self.parked.push(ParkedInsert { action, dependencies });
    }

    /// Drops `resolved` from every dependency list and returns the inserts
    /// left with none, in parking order.
    pub(crate) fn resolve_dependents(&mut self, resolved: &EntityRef) -> Vec<Action> {
        let mut released = Vec::new();
        let mut still_parked = Vec::with_capacity(self.parked.len());
        for mut parked in self.parked.drain(..) {
            parked.dependencies.retain(|dependency| {
                dependency
                    .entity
                    .peek_implementation()
                    .map_or(true, |entity| !entity.same_instance(resolved))
            });
            if parked.dependencies.is_empty() {
                released.push(parked.action);
            } else {
                still_parked.push(parked);
            }
        }
        self.parked = still_parked;
        released
    }

    /// Removes the parked insert of `entity`.
    pub(crate) fn take(&mut self, entity: &EntityRef) -> Option<Action> {
        let index = self
            .parked
            .iter()
            .position(|p| p.action.entity().map_or(false, |e| e.same_instance(entity)))?;
        Some(self.parked.remove(index).action)
    }

    /// Returns true if an insert of `entity` is parked.
    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.parked
            .iter()
            .any(|p| p.action.entity().map_or(false, |e| e.same_instance(entity)))
    }

    /// Returns the number of parked inserts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Returns true if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Describes the first unresolved reference as an error.
    pub(crate) fn first_error(&self) -> Option<CoreError> {
        let parked = self.parked.first()?;
        let dependency = parked.dependencies.first()?;
        Some(CoreError::TransientPropertyValue {
            entity_name: parked
                .action
                .entity()
                .map_or_else(String::new, |e| e.entity_name().to_string()),
            property: dependency.property.clone(),
            transient_entity_name: dependency.entity.entity_name().to_string(),
        })
    }

    pub(crate) fn clear(&mut self) {
        self.parked.clear();
    }
}

impl fmt::Debug for UnresolvedInserts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.parked.iter().map(|p| (&p.action, p.dependencies.len())))
            .finish()
    }
}
