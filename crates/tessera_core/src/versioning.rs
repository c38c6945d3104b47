//! Optimistic-lock version helpers.

use crate::metadata::EntityMetamodel;
use crate::types::Version;
use crate::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Representation of a version column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionType {
    /// Counter starting at zero.
    Integer,
    /// Millisecond timestamp.
    Timestamp,
}

impl VersionType {
    /// Returns the initial version of a new row.
    #[must_use]
    pub fn seed(self) -> Version {
        match self {
            Self::Integer => Version::Integer(0),
            Self::Timestamp => Version::Timestamp(now_millis()),
        }
    }

    /// Returns the version following `current`.
    ///
    /// Timestamps never go backwards: the next value is at least one
    /// millisecond after the current one.
    #[must_use]
    pub fn next(self, current: &Version) -> Version {
        match (self, current) {
            (Self::Integer, Version::Integer(n)) => Version::Integer(n + 1),
            (Self::Timestamp, Version::Timestamp(t)) => Version::Timestamp(now_millis().max(t + 1)),
            (_, _) => self.seed(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Reads the version out of a property vector.
#[must_use]
pub fn get_version(values: &[Value], meta: &EntityMetamodel) -> Option<Version> {
    let version = meta.version_metadata()?;
    values.get(version.index).and_then(Value::as_version)
}

/// Writes a version into a property vector.
pub fn set_version(values: &mut [Value], version: Version, meta: &EntityMetamodel) {
    if let Some(metadata) = meta.version_metadata() {
        if let Some(slot) = values.get_mut(metadata.index) {
            *slot = Value::from(version);
        }
    }
}

/// Seeds the version of a new row if it has none yet.
///
/// Returns true if the vector was modified.
pub fn seed_version(values: &mut [Value], meta: &EntityMetamodel) -> bool {
    let Some(metadata) = meta.version_metadata() else {
        return false;
    };
    match values.get(metadata.index) {
        Some(value) if value.as_version().is_none() => {
            set_version(values, metadata.ty.seed(), meta);
            true
        }
        _ => false,
    }
}

/// Returns the incremented version.
#[must_use]
pub fn increment(current: &Version, ty: VersionType) -> Version {
    ty.next(current)
}

/// Decides whether a flush must bump the version.
///
/// A dirty versionable collection, or any dirty property marked
/// versionable, requires an increment; changes limited to properties
/// excluded from versioning do not.
#[must_use]
pub fn is_version_increment_required(
    dirty_properties: &[usize],
    has_dirty_collections: bool,
    meta: &EntityMetamodel,
) -> bool {
    if has_dirty_collections {
        return true;
    }
    dirty_properties.iter().any(|&index| {
        meta.properties()
            .get(index)
            .map_or(false, |p| p.is_versionable())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;

    fn meta() -> EntityMetamodel {
        EntityMetamodel::new("Doc")
            .property(PropertyMetadata::basic("title"))
            .property(PropertyMetadata::basic("views").excluded_from_versioning())
            .version(PropertyMetadata::basic("version"), VersionType::Integer)
    }

    #[test]
    fn integer_versions_increment() {
        assert_eq!(
            increment(&Version::Integer(3), VersionType::Integer),
            Version::Integer(4)
        );
    }

    #[test]
    fn timestamps_move_forward() {
        let far_future = Version::Timestamp(i64::MAX - 10);
        assert_eq!(
            VersionType::Timestamp.next(&far_future),
            Version::Timestamp(i64::MAX - 9)
        );
    }

    #[test]
    fn seed_only_when_missing() {
        let meta = meta();
        let mut values = vec![Value::from("t"), Value::from(0), Value::Null];
        assert!(seed_version(&mut values, &meta));
        assert_eq!(get_version(&values, &meta), Some(Version::Integer(0)));
        assert!(!seed_version(&mut values, &meta));
    }

    #[test]
    fn increment_requirement() {
        let meta = meta();
        assert!(is_version_increment_required(&[0], false, &meta));
        assert!(!is_version_increment_required(&[1], false, &meta));
        assert!(is_version_increment_required(&[1], true, &meta));
        assert!(!is_version_increment_required(&[], false, &meta));
    }
}
