//! Unit-of-work configuration.

use crate::cascade::CascadingAction;

/// When a unit of work synchronizes its state with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Only on explicit [`crate::Session::flush`] calls.
    Manual,
    /// On explicit flushes and before transaction completion.
    Commit,
    /// Also before queries whose spaces overlap pending actions.
    #[default]
    Auto,
    /// Before every query.
    Always,
}

impl FlushMode {
    /// Returns true if queries may trigger a flush.
    #[must_use]
    pub const fn flushes_before_query(self) -> bool {
        matches!(self, Self::Auto | Self::Always)
    }
}

/// How a unit of work interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only; never put loaded state.
    Get,
    /// Write only; never read.
    Put,
    /// Neither read nor write, except for invalidation.
    Ignore,
    /// Write only, overwriting existing entries.
    Refresh,
}

impl CacheMode {
    /// Returns true if loads may be served from the cache.
    #[must_use]
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, Self::Normal | Self::Get)
    }

    /// Returns true if loaded state may be put into the cache.
    #[must_use]
    pub const fn is_put_enabled(self) -> bool {
        matches!(self, Self::Normal | Self::Put | Self::Refresh)
    }
}

/// Settings shared by every unit of work of a factory.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Whether non-nullable properties are checked before insert and update.
    pub check_nullability: bool,

    /// Whether queued inserts are grouped by entity name at flush.
    pub order_inserts: bool,

    /// Whether `update` of a transient instance is silently ignored.
    pub lenient_update: bool,

    /// Whether `save` of a detached instance is an error instead of a reattach.
    pub strict_detached_save: bool,

    /// How many passes a merge makes over copies still waiting to be saved.
    pub merge_retry_limit: usize,

    /// Batch size for placeholders of entities that do not declare one.
    pub default_batch_fetch_size: usize,

    /// Whether the second-level cache is consulted at all.
    pub use_second_level_cache: bool,

    /// Cache mode of new units of work.
    pub default_cache_mode: CacheMode,

    /// Flush mode of new units of work.
    pub default_flush_mode: FlushMode,

    /// Whether loaded instances start out read-only.
    pub default_read_only: bool,

    /// Cascade run over managed instances at the start of a flush.
    pub flush_cascade: CascadingAction,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_nullability: true,
            order_inserts: false,
            lenient_update: false,
            strict_detached_save: false,
            merge_retry_limit: 1,
            default_batch_fetch_size: 1,
            use_second_level_cache: true,
            default_cache_mode: CacheMode::Normal,
            default_flush_mode: FlushMode::Auto,
            default_read_only: false,
            flush_cascade: CascadingAction::SaveUpdate,
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether nullability is checked.
    #[must_use]
    pub const fn check_nullability(mut self, value: bool) -> Self {
        self.check_nullability = value;
        self
    }

    /// Sets whether inserts are ordered by entity name.
    #[must_use]
    pub const fn order_inserts(mut self, value: bool) -> Self {
        self.order_inserts = value;
        self
    }

    /// Sets lenient update mode.
    #[must_use]
    pub const fn lenient_update(mut self, value: bool) -> Self {
        self.lenient_update = value;
        self
    }

    /// Sets strict detached save mode.
    #[must_use]
    pub const fn strict_detached_save(mut self, value: bool) -> Self {
        self.strict_detached_save = value;
        self
    }

    /// Sets the merge retry limit.
    #[must_use]
    pub const fn merge_retry_limit(mut self, limit: usize) -> Self {
        self.merge_retry_limit = limit;
        self
    }

    /// Sets the default batch fetch size.
    #[must_use]
    pub const fn default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Enables or disables the second-level cache.
    #[must_use]
    pub const fn use_second_level_cache(mut self, value: bool) -> Self {
        self.use_second_level_cache = value;
        self
    }

    /// Sets the default cache mode.
    #[must_use]
    pub const fn default_cache_mode(mut self, mode: CacheMode) -> Self {
        self.default_cache_mode = mode;
        self
    }

    /// Sets the default flush mode.
    #[must_use]
    pub const fn default_flush_mode(mut self, mode: FlushMode) -> Self {
        self.default_flush_mode = mode;
        self
    }

    /// Sets whether loaded instances start out read-only.
    #[must_use]
    pub const fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    /// Sets the cascade run at flush.
    #[must_use]
    pub const fn flush_cascade(mut self, action: CascadingAction) -> Self {
        self.flush_cascade = action;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert!(settings.check_nullability);
        assert_eq!(settings.merge_retry_limit, 1);
        assert_eq!(settings.default_flush_mode, FlushMode::Auto);
        assert_eq!(settings.flush_cascade, CascadingAction::SaveUpdate);
    }

    #[test]
    fn builder_pattern() {
        let settings = Settings::new()
            .order_inserts(true)
            .merge_retry_limit(3)
            .default_batch_fetch_size(0)
            .default_cache_mode(CacheMode::Ignore);
        assert!(settings.order_inserts);
        assert_eq!(settings.merge_retry_limit, 3);
        assert_eq!(settings.default_batch_fetch_size, 1);
        assert!(!settings.default_cache_mode.is_get_enabled());
    }

    #[test]
    fn cache_mode_gates() {
        assert!(CacheMode::Get.is_get_enabled());
        assert!(!CacheMode::Get.is_put_enabled());
        assert!(CacheMode::Refresh.is_put_enabled());
        assert!(!CacheMode::Refresh.is_get_enabled());
    }
}
