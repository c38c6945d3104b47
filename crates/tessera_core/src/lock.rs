//! Lock modes and lock options.

use std::collections::BTreeMap;
use std::fmt;

/// Lock mode requested for, or held on, an entity row.
///
/// Modes are ordered by strength; an upgrade only happens when the
/// requested mode is strictly stronger than the held one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// No lock; the row may come from the second-level cache.
    #[default]
    None,
    /// Row was read from the store in this unit of work.
    Read,
    /// Verify the version before the transaction completes.
    Optimistic,
    /// Increment the version before the transaction completes.
    OptimisticForceIncrement,
    /// Pessimistic upgrade lock (`select ... for update`).
    Upgrade,
    /// Upgrade lock that fails instead of waiting.
    UpgradeNoWait,
    /// Row was written in this unit of work; never requested explicitly.
    Write,
    /// Shared pessimistic lock.
    PessimisticRead,
    /// Exclusive pessimistic lock.
    PessimisticWrite,
    /// Force a version increment immediately.
    Force,
    /// Exclusive pessimistic lock plus immediate version increment.
    PessimisticForceIncrement,
}

impl LockMode {
    const fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => 5,
            Self::Optimistic => 6,
            Self::OptimisticForceIncrement => 7,
            Self::Upgrade | Self::UpgradeNoWait | Self::Write => 10,
            Self::PessimisticRead => 12,
            Self::PessimisticWrite => 13,
            Self::Force => 15,
            Self::PessimisticForceIncrement => 17,
        }
    }

    /// Returns true if this mode is strictly stronger than `other`.
    #[must_use]
    pub const fn greater_than(self, other: Self) -> bool {
        self.level() > other.level()
    }

    /// Returns true if this mode is strictly weaker than `other`.
    #[must_use]
    pub const fn less_than(self, other: Self) -> bool {
        self.level() < other.level()
    }

    /// Returns true for modes that bump the version immediately.
    #[must_use]
    pub const fn forces_increment(self) -> bool {
        matches!(self, Self::Force | Self::PessimisticForceIncrement)
    }

    /// Returns true for modes resolved before transaction completion.
    #[must_use]
    pub const fn is_optimistic(self) -> bool {
        matches!(self, Self::Optimistic | Self::OptimisticForceIncrement)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How long a pessimistic lock request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    /// Wait as long as the store allows.
    #[default]
    WaitForever,
    /// Fail immediately if the row is locked.
    NoWait,
    /// Skip locked rows.
    SkipLocked,
    /// Wait at most this many milliseconds.
    Millis(u64),
}

/// Lock request for an operation.
///
/// A value type: components copy it rather than share it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockOptions {
    lock_mode: LockMode,
    timeout: LockTimeout,
    scope: bool,
    alias_modes: BTreeMap<String, LockMode>,
}

impl LockOptions {
    /// Creates lock options for a mode.
    #[must_use]
    pub fn new(lock_mode: LockMode) -> Self {
        Self {
            lock_mode,
            ..Self::default()
        }
    }

    /// Options requesting no lock.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Options requesting [`LockMode::Read`].
    #[must_use]
    pub fn read() -> Self {
        Self::new(LockMode::Read)
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether the lock extends to owned collections.
    #[must_use]
    pub fn with_scope(mut self, scope: bool) -> Self {
        self.scope = scope;
        self
    }

    /// Overrides the mode for one query alias.
    #[must_use]
    pub fn with_alias_mode(mut self, alias: impl Into<String>, mode: LockMode) -> Self {
        self.alias_modes.insert(alias.into(), mode);
        self
    }

    /// Returns the lock mode.
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Returns the timeout.
    #[must_use]
    pub const fn timeout(&self) -> LockTimeout {
        self.timeout
    }

    /// Returns the lock scope flag.
    #[must_use]
    pub const fn scope(&self) -> bool {
        self.scope
    }

    /// Returns the effective mode for an alias.
    #[must_use]
    pub fn effective_mode(&self, alias: &str) -> LockMode {
        self.alias_modes
            .get(alias)
            .copied()
            .unwrap_or(self.lock_mode)
    }
}

impl From<LockMode> for LockOptions {
    fn from(mode: LockMode) -> Self {
        Self::new(mode)
    }
}
