//! Core types for persistkit.
//!
//! This crate provides the foundations the unit of work is built on:
//!
//! - `Value` and `Row` for dynamically-typed column data
//! - `EntityMetadata` and `MetadataRegistry` describing entity shapes and relationships
//! - `Entity` / `EntityRef` in-memory instances with their lifecycle `EntityState`
//! - `LazyHandle` and the `LazyLoader` trait for unfetched relationships
//! - `Store` trait with structured `QueryPlan`s and ordered `WriteSet`s
//! - `Outcome` and `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod lazy;
pub mod metadata;
pub mod row;
pub mod store;
pub mod value;

pub use entity::{Entity, EntityRef, EntityState, Relation};
pub use error::{
    CycleError, Error, IllegalStateError, LazyInitializationError, MetadataError,
    MetadataErrorKind, NotFoundError, NotManagedError, PaginatedCollectionFetchWarning,
    QueryError, QueryErrorKind, Result, SessionUnusableError, StaleWriteError,
    TransientReferenceError, TypeError,
};
pub use lazy::{LazyHandle, LazyLoader, LazyState, LazyTarget, Resolved, initialize};
pub use metadata::{
    Cardinality, CascadeSet, CascadeType, EntityMetadata, EntityType, FetchMode, FieldInfo,
    IdentityInfo, IdentityStrategy, MetadataRegistry, MetadataRegistryBuilder, RelationshipEdge,
};
pub use row::{FromValue, Row};
pub use store::{
    JoinKind, JoinSpec, Predicate, QueryPlan, Store, Window, WriteKind, WriteOp, WriteSet,
};
pub use value::Value;
