//! Entity mapping metadata.
//!
//! An [`EntityMetamodel`] describes one entity: its properties and their
//! types, nullability, updatability, versionability, cascade styles and
//! natural-id membership, plus identifier strategy and version column.

use crate::cascade::CascadeStyle;
use crate::error::{CoreError, CoreResult};
use crate::types::EntityMode;
use crate::value::{Row, StoredValue, Value};
use crate::versioning::VersionType;

/// Type of a mapped property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    /// Scalar column.
    Basic,
    /// Reference to another entity; the foreign key lives in this row.
    ManyToOne {
        /// Referenced entity name.
        entity_name: String,
    },
    /// Collection owned by this entity, stored by a collection persister.
    Collection {
        /// Collection role.
        role: String,
    },
}

impl PropertyType {
    /// Returns the referenced entity name for many-to-one properties.
    #[must_use]
    pub fn associated_entity(&self) -> Option<&str> {
        match self {
            Self::ManyToOne { entity_name } => Some(entity_name),
            _ => None,
        }
    }

    /// Returns the role for collection properties.
    #[must_use]
    pub fn collection_role(&self) -> Option<&str> {
        match self {
            Self::Collection { role } => Some(role),
            _ => None,
        }
    }

    /// Returns true for associations.
    #[must_use]
    pub const fn is_association(&self) -> bool {
        !matches!(self, Self::Basic)
    }

    /// Compares an old and a current value for dirtiness.
    ///
    /// Entity references are equal when they point at the same instance or
    /// at the same persistent identity; collections are equal when the
    /// same collection instance is still referenced.
    #[must_use]
    pub fn is_dirty(&self, old: &Value, current: &Value) -> bool {
        if !old.is_fetched() || !current.is_fetched() {
            return false;
        }
        match self {
            Self::Basic => old != current,
            Self::ManyToOne { .. } => match (old, current) {
                (Value::Null, Value::Null) => false,
                (Value::Entity(a), Value::Entity(b)) => {
                    if a.same_instance(b) {
                        return false;
                    }
                    match (a.identifier(), b.identifier()) {
                        (Some(x), Some(y)) => x != y || a.entity_name() != b.entity_name(),
                        _ => true,
                    }
                }
                _ => true,
            },
            Self::Collection { .. } => match (old, current) {
                (Value::Collection(a), Value::Collection(b)) => !a.same_instance(b),
                (Value::Null, Value::Null) => false,
                _ => true,
            },
        }
    }
}

/// Mapping of one property.
#[derive(Debug, Clone)]
pub struct PropertyMetadata {
    name: String,
    ty: PropertyType,
    nullable: bool,
    insertable: bool,
    updatable: bool,
    versionable: bool,
    lazy: bool,
    cascade: CascadeStyle,
    natural_id: bool,
}

impl PropertyMetadata {
    fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            insertable: true,
            updatable: true,
            versionable: true,
            lazy: false,
            cascade: CascadeStyle::NONE,
            natural_id: false,
        }
    }

    /// A scalar property.
    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Basic)
    }

    /// A many-to-one reference.
    pub fn many_to_one(name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyType::ManyToOne {
                entity_name: entity_name.into(),
            },
        )
    }

    /// A collection property.
    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Collection { role: role.into() })
    }

    /// Marks the property non-nullable.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Excludes the property from updates.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// Excludes the property from inserts.
    #[must_use]
    pub fn not_insertable(mut self) -> Self {
        self.insertable = false;
        self
    }

    /// Changes to this property do not bump the owner's version.
    #[must_use]
    pub fn excluded_from_versioning(mut self) -> Self {
        self.versionable = false;
        self
    }

    /// Marks the property lazily fetched.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Sets the cascade style.
    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Marks the property part of the natural identifier.
    #[must_use]
    pub fn natural_id(mut self) -> Self {
        self.natural_id = true;
        self
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the type.
    #[must_use]
    pub fn ty(&self) -> &PropertyType {
        &self.ty
    }

    /// Returns true if null is allowed.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Returns true if included in inserts.
    #[must_use]
    pub const fn is_insertable(&self) -> bool {
        self.insertable
    }

    /// Returns true if included in updates.
    #[must_use]
    pub const fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Returns true if changes bump the owner's version.
    #[must_use]
    pub const fn is_versionable(&self) -> bool {
        self.versionable
    }

    /// Returns true if lazily fetched.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Returns the cascade style.
    #[must_use]
    pub const fn cascade_style(&self) -> CascadeStyle {
        self.cascade
    }

    /// Returns true if part of the natural identifier.
    #[must_use]
    pub const fn is_natural_id(&self) -> bool {
        self.natural_id
    }
}

/// How identifiers are produced on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// The application assigns identifiers before save.
    Assigned,
    /// The persister hands out the next value of a sequence.
    #[default]
    Sequence,
    /// A random UUID is generated by the engine.
    Uuid,
    /// The store generates the identifier during the insert.
    Identity,
}

/// Version column of a versioned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMetadata {
    /// Index of the version property.
    pub index: usize,
    /// Version representation.
    pub ty: VersionType,
}

/// Complete mapping of one entity.
#[derive(Debug, Clone)]
pub struct EntityMetamodel {
    name: String,
    mode: EntityMode,
    properties: Vec<PropertyMetadata>,
    id_strategy: IdStrategy,
    version: Option<VersionMetadata>,
    mutable: bool,
    select_before_update: bool,
    proxyable: bool,
    batch_size: usize,
    tracks_dirtiness: bool,
    query_spaces: Vec<String>,
}

impl EntityMetamodel {
    /// Creates a mutable, non-versioned mapping with sequence identifiers.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            query_spaces: vec![name.clone()],
            name,
            mode: EntityMode::Pojo,
            properties: Vec::new(),
            id_strategy: IdStrategy::default(),
            version: None,
            mutable: true,
            select_before_update: false,
            proxyable: false,
            batch_size: 1,
            tracks_dirtiness: false,
        }
    }

    /// Appends a property.
    #[must_use]
    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    /// Appends the version property.
    #[must_use]
    pub fn version(mut self, property: PropertyMetadata, ty: VersionType) -> Self {
        self.version = Some(VersionMetadata {
            index: self.properties.len(),
            ty,
        });
        self.properties.push(property);
        self
    }

    /// Sets the identifier strategy.
    #[must_use]
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Sets the entity mode.
    #[must_use]
    pub fn mode(mut self, mode: EntityMode) -> Self {
        self.mode = mode;
        self
    }

    /// Marks the entity immutable; instances are tracked read-only.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Compares against a fresh database snapshot before updating a
    /// reattached instance.
    #[must_use]
    pub fn select_before_update(mut self) -> Self {
        self.select_before_update = true;
        self
    }

    /// Allows lazy placeholders for this entity.
    #[must_use]
    pub fn proxyable(mut self) -> Self {
        self.proxyable = true;
        self
    }

    /// Sets how many queued placeholders are loaded in one round trip.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Skips dirty checking of instances without recorded writes.
    #[must_use]
    pub fn tracks_dirtiness(mut self) -> Self {
        self.tracks_dirtiness = true;
        self
    }

    /// Sets the query spaces (tables) touched by this entity.
    #[must_use]
    pub fn query_spaces(mut self, spaces: Vec<String>) -> Self {
        self.query_spaces = spaces;
        self
    }

    /// Returns the entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entity mode.
    #[must_use]
    pub const fn entity_mode(&self) -> EntityMode {
        self.mode
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &[PropertyMetadata] {
        &self.properties
    }

    /// Returns the number of properties.
    #[must_use]
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Returns the index of a property by name.
    #[must_use]
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Returns the identifier strategy.
    #[must_use]
    pub const fn identifier_strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    /// Returns the version column, if versioned.
    #[must_use]
    pub const fn version_metadata(&self) -> Option<VersionMetadata> {
        self.version
    }

    /// Returns true if versioned.
    #[must_use]
    pub const fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Returns true if mutable.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Returns true if select-before-update is enabled.
    #[must_use]
    pub const fn is_select_before_update(&self) -> bool {
        self.select_before_update
    }

    /// Returns true if lazy placeholders are allowed.
    #[must_use]
    pub const fn is_proxyable(&self) -> bool {
        self.proxyable
    }

    /// Returns the batch fetch size.
    #[must_use]
    pub const fn batch_fetch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns true if write tracking short-circuits dirty checks.
    #[must_use]
    pub const fn is_tracking_dirtiness(&self) -> bool {
        self.tracks_dirtiness
    }

    /// Returns the query spaces.
    #[must_use]
    pub fn spaces(&self) -> &[String] {
        &self.query_spaces
    }

    /// Returns true if any property is a collection.
    #[must_use]
    pub fn has_collections(&self) -> bool {
        self.properties
            .iter()
            .any(|p| matches!(p.ty, PropertyType::Collection { .. }))
    }

    /// Returns true if any property cascades something.
    #[must_use]
    pub fn has_cascades(&self) -> bool {
        self.properties.iter().any(|p| !p.cascade.is_none())
    }

    /// Returns the indices of natural-id properties.
    #[must_use]
    pub fn natural_id_indices(&self) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.natural_id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the property names.
    #[must_use]
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name.as_str()).collect()
    }

    /// Finds the updatable properties whose current value differs from the
    /// previous one.
    #[must_use]
    pub fn find_dirty(&self, current: &[Value], previous: &[Value]) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                if !p.updatable {
                    return false;
                }
                match (previous.get(*i), current.get(*i)) {
                    (Some(old), Some(new)) => p.ty.is_dirty(old, new),
                    (None, None) => false,
                    _ => true,
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Finds the updatable properties whose current value differs from a
    /// row read straight from the store.
    #[must_use]
    pub fn find_modified(&self, snapshot: &Row, current: &[Value]) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                if !p.updatable {
                    return false;
                }
                let (Some(stored), Some(value)) = (snapshot.get(*i), current.get(*i)) else {
                    return false;
                };
                if !value.is_fetched() || matches!(stored, StoredValue::Unfetched) {
                    return false;
                }
                match &p.ty {
                    PropertyType::Basic => value.to_stored_scalar().as_ref() != Some(stored),
                    PropertyType::ManyToOne { .. } => match (stored, value) {
                        (StoredValue::Null, Value::Null) => false,
                        (StoredValue::Reference(id), Value::Entity(handle)) => {
                            handle.identifier().as_ref() != Some(id)
                        }
                        _ => true,
                    },
                    PropertyType::Collection { .. } => false,
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Checks that a value vector has one slot per property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] on a width mismatch.
    pub fn check_width(&self, values: &[Value]) -> CoreResult<()> {
        if values.len() == self.properties.len() {
            Ok(())
        } else {
            Err(CoreError::mapping(format!(
                "entity {} maps {} properties but the instance holds {} values",
                self.name,
                self.properties.len(),
                values.len()
            )))
        }
    }
}
