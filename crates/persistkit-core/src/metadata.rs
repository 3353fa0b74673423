//! Entity metadata for persistkit.
//!
//! Every entity type is described once, at process start, by an
//! [`EntityMetadata`]: its identity, its scalar fields and the relationship
//! edges it takes part in. The descriptors are collected into an immutable
//! [`MetadataRegistry`] that the session, the fetch-plan resolver and stores
//! consult; nothing is discovered through runtime reflection.
//!
//! # Example
//!
//! ```ignore
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("school_class")
//!             .identity("id", IdentityStrategy::Generated)
//!             .field(FieldInfo::new("name"))
//!             .relationship(
//!                 RelationshipEdge::one_to_many("persons", "person")
//!                     .mapped_by("my_class")
//!                     .cascade(CascadeSet::PERSIST)
//!                     .orphan_removal(true),
//!             ),
//!     )
//!     .entity(
//!         EntityMetadata::new("person")
//!             .identity("id", IdentityStrategy::Generated)
//!             .field(FieldInfo::new("name"))
//!             .relationship(RelationshipEdge::many_to_one("my_class", "school_class").join_column("class_id")),
//!     )
//!     .build()?;
//! ```

use crate::Result;
use crate::error::{Error, MetadataErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Entity type tag (the logical table name).
pub type EntityType = &'static str;

/// How an entity's identity value is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// The session assigns the identity at persist time.
    #[default]
    Generated,
    /// The application sets the identity before persisting.
    Assigned,
}

/// Identity column description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityInfo {
    pub field: &'static str,
    pub strategy: IdentityStrategy,
}

/// A scalar (non-relationship) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: &'static str,
    pub nullable: bool,
}

impl FieldInfo {
    /// Create a non-nullable field.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            nullable: false,
        }
    }

    /// Mark the field nullable.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }
}

/// Relationship cardinality as seen from the source entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one target (many-to-one, one-to-one).
    One,
    /// A collection of targets (one-to-many).
    Many,
}

/// Operations that propagate along a relationship edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeType {
    Persist,
    Remove,
}

/// Set of cascaded operations on an edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeSet {
    persist: bool,
    remove: bool,
}

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet {
        persist: false,
        remove: false,
    };
    pub const PERSIST: CascadeSet = CascadeSet {
        persist: true,
        remove: false,
    };
    pub const REMOVE: CascadeSet = CascadeSet {
        persist: false,
        remove: true,
    };
    pub const ALL: CascadeSet = CascadeSet {
        persist: true,
        remove: true,
    };

    /// Does this set cascade the given operation?
    pub const fn contains(&self, op: CascadeType) -> bool {
        match op {
            CascadeType::Persist => self.persist,
            CascadeType::Remove => self.remove,
        }
    }

    /// Union of two sets.
    pub const fn with(self, other: CascadeSet) -> CascadeSet {
        CascadeSet {
            persist: self.persist || other.persist,
            remove: self.remove || other.remove,
        }
    }

    pub const fn is_empty(&self) -> bool {
        !self.persist && !self.remove
    }
}

/// When a relationship is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Resolved on first access through a lazy handle.
    #[default]
    Lazy,
    /// Joined by identity lookups; resolved right after predicate queries.
    Eager,
}

/// A directed relationship edge from `source` to `target`.
///
/// Owning edges are to-one and hold the foreign key column on the source row.
/// Non-owning edges name the owning edge on the target through `mapped_by`;
/// they never write anything themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipEdge {
    pub name: &'static str,
    pub source: EntityType,
    pub target: EntityType,
    pub cardinality: Cardinality,
    pub owning: bool,
    pub foreign_key: Option<&'static str>,
    pub mapped_by: Option<&'static str>,
    pub cascade: CascadeSet,
    pub orphan_removal: bool,
    pub fetch: FetchMode,
    pub batch_size: Option<usize>,
}

impl RelationshipEdge {
    const fn base(name: &'static str, target: EntityType, cardinality: Cardinality) -> Self {
        Self {
            name,
            source: "",
            target,
            cardinality,
            owning: false,
            foreign_key: None,
            mapped_by: None,
            cascade: CascadeSet::NONE,
            orphan_removal: false,
            fetch: FetchMode::Lazy,
            batch_size: None,
        }
    }

    /// Owning to-one edge; the source row holds the foreign key.
    pub const fn many_to_one(name: &'static str, target: EntityType) -> Self {
        let mut edge = Self::base(name, target, Cardinality::One);
        edge.owning = true;
        edge
    }

    /// Owning one-to-one edge; same storage as many-to-one.
    pub const fn one_to_one(name: &'static str, target: EntityType) -> Self {
        Self::many_to_one(name, target)
    }

    /// Non-owning collection edge; pair with [`RelationshipEdge::mapped_by`].
    pub const fn one_to_many(name: &'static str, target: EntityType) -> Self {
        Self::base(name, target, Cardinality::Many)
    }

    /// Non-owning one-to-one back reference; pair with [`RelationshipEdge::mapped_by`].
    pub const fn one_to_one_inverse(name: &'static str, target: EntityType) -> Self {
        Self::base(name, target, Cardinality::One)
    }

    pub const fn join_column(mut self, column: &'static str) -> Self {
        self.foreign_key = Some(column);
        self
    }

    pub const fn mapped_by(mut self, edge: &'static str) -> Self {
        self.mapped_by = Some(edge);
        self
    }

    pub const fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    pub const fn fetch(mut self, mode: FetchMode) -> Self {
        self.fetch = mode;
        self
    }

    /// Load up to `size` uninitialized collections of this edge per query.
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.cardinality, Cardinality::Many)
    }

    pub const fn is_eager(&self) -> bool {
        matches!(self.fetch, FetchMode::Eager)
    }

    /// Does removing the source reach the target (remove cascade or orphan removal)?
    pub const fn reaches_on_remove(&self) -> bool {
        self.cascade.contains(CascadeType::Remove) || self.orphan_removal
    }

    /// Effective batch size; `None` or `Some(0 | 1)` means one owner per query.
    pub fn effective_batch_size(&self) -> Option<usize> {
        self.batch_size.filter(|size| *size > 1)
    }
}

/// Static description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub entity: EntityType,
    pub identity: IdentityInfo,
    pub fields: Vec<FieldInfo>,
    pub relationships: Vec<RelationshipEdge>,
}

impl EntityMetadata {
    /// Start describing an entity with a generated `id` identity.
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            identity: IdentityInfo {
                field: "id",
                strategy: IdentityStrategy::Generated,
            },
            fields: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn identity(mut self, field: &'static str, strategy: IdentityStrategy) -> Self {
        self.identity = IdentityInfo { field, strategy };
        self
    }

    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a relationship edge; its source is set to this entity.
    pub fn relationship(mut self, mut edge: RelationshipEdge) -> Self {
        edge.source = self.entity;
        self.relationships.push(edge);
        self
    }

    /// Find a relationship edge by name.
    pub fn edge(&self, name: &str) -> Option<&RelationshipEdge> {
        self.relationships.iter().find(|e| e.name == name)
    }

    /// Owning to-one edges with their foreign key column.
    pub fn owning_edges(&self) -> impl Iterator<Item = (&RelationshipEdge, &'static str)> {
        self.relationships
            .iter()
            .filter(|e| e.owning)
            .filter_map(|e| e.foreign_key.map(|fk| (e, fk)))
    }

    /// All column names a store row for this entity carries, identity first.
    pub fn column_names(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(1 + self.fields.len() + self.relationships.len());
        columns.push(self.identity.field);
        columns.extend(self.fields.iter().map(|f| f.name));
        columns.extend(self.owning_edges().map(|(_, fk)| fk));
        columns
    }
}

/// Immutable collection of entity metadata.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entities: HashMap<EntityType, EntityMetadata>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<MetadataRegistry>> = OnceLock::new();

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// Install a process-wide read-only registry.
    ///
    /// Returns the registry that ends up installed; a second install keeps the first.
    pub fn install_global(registry: Arc<MetadataRegistry>) -> Arc<MetadataRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| registry))
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<Arc<MetadataRegistry>> {
        GLOBAL_REGISTRY.get().cloned()
    }

    pub fn get(&self, entity: &str) -> Result<&EntityMetadata> {
        self.entities.get(entity).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownEntity,
                format!("entity '{}' is not registered", entity),
            )
        })
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    pub fn edge(&self, entity: &str, name: &str) -> Result<&RelationshipEdge> {
        self.get(entity)?.edge(name).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownRelationship,
                format!("entity '{}' has no relationship '{}'", entity, name),
            )
        })
    }

    /// The owning counterpart of a non-owning edge.
    pub fn inverse(&self, edge: &RelationshipEdge) -> Option<&RelationshipEdge> {
        let mapped_by = edge.mapped_by?;
        self.entities.get(edge.target)?.edge(mapped_by)
    }

    /// The non-owning back reference of an owning edge, if one is declared.
    pub fn back_reference(&self, edge: &RelationshipEdge) -> Option<&RelationshipEdge> {
        if !edge.owning {
            return None;
        }
        self.entities
            .get(edge.target)?
            .relationships
            .iter()
            .find(|e| e.target == edge.source && e.mapped_by == Some(edge.name))
    }

    /// The foreign key column that links `edge`'s source and target.
    ///
    /// For owning edges the column lives on the source row; for non-owning
    /// edges it lives on the target row.
    pub fn join_column(&self, edge: &RelationshipEdge) -> Result<&'static str> {
        let column = if edge.owning {
            edge.foreign_key
        } else {
            self.inverse(edge).and_then(|inv| inv.foreign_key)
        };
        column.ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::Invalid,
                format!(
                    "relationship '{}.{}' has no resolvable join column",
                    edge.source, edge.name
                ),
            )
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.values()
    }

    fn validate(&self) -> Result<()> {
        for meta in self.entities.values() {
            for edge in &meta.relationships {
                let invalid = |message: String| {
                    Err(Error::metadata(MetadataErrorKind::Invalid, message))
                };
                let Some(target) = self.entities.get(edge.target) else {
                    return invalid(format!(
                        "{}.{} targets unregistered entity '{}'",
                        meta.entity, edge.name, edge.target
                    ));
                };
                if edge.owning {
                    if edge.is_collection() {
                        return invalid(format!(
                            "{}.{}: owning edges must be to-one",
                            meta.entity, edge.name
                        ));
                    }
                    if edge.foreign_key.is_none() {
                        return invalid(format!(
                            "{}.{}: owning edge needs a join column",
                            meta.entity, edge.name
                        ));
                    }
                    if edge.mapped_by.is_some() {
                        return invalid(format!(
                            "{}.{}: an owning edge cannot be mapped_by another edge",
                            meta.entity, edge.name
                        ));
                    }
                    continue;
                }

                let Some(mapped_by) = edge.mapped_by else {
                    return invalid(format!(
                        "{}.{}: non-owning edge needs mapped_by",
                        meta.entity, edge.name
                    ));
                };
                let Some(inverse) = target.edge(mapped_by) else {
                    return invalid(format!(
                        "{}.{} is mapped_by '{}' but {}.{} does not exist",
                        meta.entity, edge.name, mapped_by, edge.target, mapped_by
                    ));
                };
                if !inverse.owning {
                    return invalid(format!(
                        "{}.{} and {}.{} are both non-owning; exactly one side must own the foreign key",
                        meta.entity, edge.name, edge.target, mapped_by
                    ));
                }
                if inverse.target != meta.entity {
                    return invalid(format!(
                        "{}.{} is mapped_by '{}' but {}.{} targets '{}' (expected '{}')",
                        meta.entity,
                        edge.name,
                        mapped_by,
                        edge.target,
                        mapped_by,
                        inverse.target,
                        meta.entity
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Collects entity descriptors and validates them into a [`MetadataRegistry`].
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetadataRegistryBuilder {
    pub fn entity(mut self, meta: EntityMetadata) -> Self {
        self.entities.push(meta);
        self
    }

    pub fn build(self) -> Result<MetadataRegistry> {
        let mut entities = HashMap::with_capacity(self.entities.len());
        for meta in self.entities {
            let entity = meta.entity;
            if entities.insert(entity, meta).is_some() {
                return Err(Error::metadata(
                    MetadataErrorKind::Invalid,
                    format!("entity '{}' registered twice", entity),
                ));
            }
        }
        let registry = MetadataRegistry { entities };
        registry.validate()?;
        tracing::debug!(
            entities = registry.entities.len(),
            "Metadata registry built"
        );
        Ok(registry)
    }
}
