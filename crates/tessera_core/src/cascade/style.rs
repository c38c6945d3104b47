//! Cascade styles, cascading actions and cascade points.

use std::fmt;

/// Operation propagated across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadingAction {
    /// `save` / `update` / `save_or_update`.
    SaveUpdate,
    /// `persist`.
    Persist,
    /// Persist cascade run by flush.
    PersistOnFlush,
    /// `merge`.
    Merge,
    /// `delete`.
    Delete,
    /// `lock`.
    Lock,
    /// `refresh`.
    Refresh,
    /// `evict`.
    Evict,
}

impl CascadingAction {
    const fn bit(self) -> u16 {
        match self {
            Self::SaveUpdate => 1,
            Self::Persist => 1 << 1,
            Self::PersistOnFlush => 1 << 2,
            Self::Merge => 1 << 3,
            Self::Delete => 1 << 4,
            Self::Lock => 1 << 5,
            Self::Refresh => 1 << 6,
            Self::Evict => 1 << 7,
        }
    }

    /// Returns true if this action removes orphans of `delete-orphan` associations.
    #[must_use]
    pub const fn deletes_orphans(self) -> bool {
        matches!(self, Self::SaveUpdate | Self::Delete | Self::PersistOnFlush)
    }

    /// Returns true if the action must materialize lazy children before
    /// cascading to them.
    #[must_use]
    pub const fn initializes_lazy_children(self) -> bool {
        matches!(self, Self::Delete)
    }

    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SaveUpdate => "save-update",
            Self::Persist => "persist",
            Self::PersistOnFlush => "persist-on-flush",
            Self::Merge => "merge",
            Self::Delete => "delete",
            Self::Lock => "lock",
            Self::Refresh => "refresh",
            Self::Evict => "evict",
        }
    }
}

impl fmt::Display for CascadingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const DELETE_ORPHAN: u16 = 1 << 8;

/// Which operations cascade across one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeStyle(u16);

impl CascadeStyle {
    /// Cascade nothing.
    pub const NONE: Self = Self(0);
    /// Cascade every operation.
    pub const ALL: Self = Self(0xff);
    /// Cascade every operation and delete orphans.
    pub const ALL_DELETE_ORPHAN: Self = Self(0xff | DELETE_ORPHAN);

    /// Returns a style cascading only `action`.
    #[must_use]
    pub const fn of(action: CascadingAction) -> Self {
        Self::NONE.with(action)
    }

    /// Adds an action to the style.
    #[must_use]
    pub const fn with(self, action: CascadingAction) -> Self {
        let mut bits = self.0 | action.bit();
        if matches!(action, CascadingAction::Persist) {
            bits |= CascadingAction::PersistOnFlush.bit();
        }
        Self(bits)
    }

    /// Enables orphan deletion.
    #[must_use]
    pub const fn with_delete_orphan(self) -> Self {
        Self(self.0 | DELETE_ORPHAN)
    }

    /// Returns true if `action` cascades through this style.
    #[must_use]
    pub const fn does_cascade(self, action: CascadingAction) -> bool {
        self.0 & action.bit() != 0 || (self.has_orphan_delete() && action.deletes_orphans())
    }

    /// Returns true if orphans are deleted.
    #[must_use]
    pub const fn has_orphan_delete(self) -> bool {
        self.0 & DELETE_ORPHAN != 0
    }

    /// Returns true if nothing cascades.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Where in an operation a cascade runs.
///
/// The point decides which associations are visited: before an insert only
/// associations whose foreign key lives in the parent row (many-to-one) are
/// cascaded, so the referenced rows exist first; after the insert the
/// collections are cascaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// After inserting the parent, before deleting it.
    AfterInsertBeforeDelete,
    /// Before inserting the parent, after deleting it.
    BeforeInsertAfterDelete,
    /// After updating the parent.
    AfterUpdate,
    /// Before flushing.
    BeforeFlush,
    /// Before merging the parent.
    BeforeMerge,
    /// Before refreshing the parent.
    BeforeRefresh,
    /// After locking the parent.
    AfterLock,
    /// After evicting the parent.
    AfterEvict,
}

impl CascadePoint {
    /// Returns true if many-to-one associations are cascaded at this point.
    #[must_use]
    pub const fn cascades_to_parents(self) -> bool {
        !matches!(self, Self::AfterInsertBeforeDelete)
    }

    /// Returns true if collections are cascaded at this point.
    #[must_use]
    pub const fn cascades_to_children(self) -> bool {
        !matches!(self, Self::BeforeInsertAfterDelete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_cascades_nothing() {
        assert!(!CascadeStyle::NONE.does_cascade(CascadingAction::SaveUpdate));
        assert!(CascadeStyle::NONE.is_none());
    }

    #[test]
    fn all_cascades_everything_but_orphans() {
        assert!(CascadeStyle::ALL.does_cascade(CascadingAction::Merge));
        assert!(CascadeStyle::ALL.does_cascade(CascadingAction::Evict));
        assert!(!CascadeStyle::ALL.has_orphan_delete());
        assert!(CascadeStyle::ALL_DELETE_ORPHAN.has_orphan_delete());
    }

    #[test]
    fn persist_implies_persist_on_flush() {
        let style = CascadeStyle::of(CascadingAction::Persist);
        assert!(style.does_cascade(CascadingAction::PersistOnFlush));
        assert!(!style.does_cascade(CascadingAction::Merge));
    }

    #[test]
    fn orphan_delete_enables_save_update_walk() {
        let style = CascadeStyle::NONE.with_delete_orphan();
        assert!(style.does_cascade(CascadingAction::SaveUpdate));
        assert!(!style.does_cascade(CascadingAction::Refresh));
    }

    #[test]
    fn points_partition_associations() {
        assert!(CascadePoint::BeforeInsertAfterDelete.cascades_to_parents());
        assert!(!CascadePoint::BeforeInsertAfterDelete.cascades_to_children());
        assert!(!CascadePoint::AfterInsertBeforeDelete.cascades_to_parents());
        assert!(CascadePoint::BeforeMerge.cascades_to_parents());
        assert!(CascadePoint::BeforeMerge.cascades_to_children());
    }
}
