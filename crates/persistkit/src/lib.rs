//! persistkit - a unit-of-work persistence core.
//!
//! persistkit keeps track of dynamically-typed entities between an
//! application and a relational store:
//!
//! - Identity map: one in-memory instance per stored row
//! - Snapshot dirty checking with minimal UPDATEs
//! - Cascading persist and remove, orphan removal
//! - Lazy relationship handles with batched IN-list loading
//! - Fetch planning with fetch-join deduplication and safe windowing
//!
//! # Quick Start
//!
//! ```ignore
//! use persistkit::prelude::*;
//!
//! let registry = Arc::new(
//!     MetadataRegistry::builder()
//!         .entity(
//!             EntityMetadata::new("school_class")
//!                 .field(FieldInfo::new("name"))
//!                 .relationship(
//!                     RelationshipEdge::one_to_many("persons", "person")
//!                         .mapped_by("my_class")
//!                         .cascade(CascadeSet::ALL)
//!                         .orphan_removal(true),
//!                 ),
//!         )
//!         .entity(
//!             EntityMetadata::new("person")
//!                 .field(FieldInfo::new("name"))
//!                 .relationship(
//!                     RelationshipEdge::many_to_one("my_class", "school_class")
//!                         .join_column("class_id"),
//!                 ),
//!         )
//!         .build()?,
//! );
//!
//! let factory = SessionFactory::new(Arc::clone(&registry), MemoryStore::new(registry));
//! let mut session = factory.open_session();
//!
//! let class = Entity::new("school_class").with("name", "1a").into_ref();
//! session.persist(&class)?;
//! session.commit(&cx).await?;
//!
//! let classes = session
//!     .query(&cx, &Query::new("school_class").fetch("persons").window(0, 10))
//!     .await?;
//! ```
//!
//! # Crates
//!
//! - `persistkit-core`: values, rows, metadata, entities, lazy handles, the `Store` trait
//! - `persistkit-session`: the session and its unit of work
//! - `persistkit-memory`: an in-memory `Store`

pub use persistkit_core::{
    Cardinality, CascadeSet, CascadeType, Cx, Entity, EntityMetadata, EntityRef, EntityState,
    EntityType, Error, FetchMode, FieldInfo, IdentityStrategy, JoinKind, JoinSpec, LazyHandle,
    LazyLoader, LazyState, LazyTarget, MetadataErrorKind, MetadataRegistry, Outcome, Predicate,
    QueryErrorKind, QueryPlan, Relation, RelationshipEdge, Resolved, Result, Row, Store, Value,
    Window, WriteKind, WriteOp, WriteSet,
};
pub use persistkit_core::error;
pub use persistkit_memory::{MemoryStats, MemoryStore};
pub use persistkit_session::{
    FetchWarning, FlushResult, IdentityGenerator, N1QueryTracker, N1Stats,
    ObjectKey, PagedCollectionFetch, Query, QueryResult, SequenceGenerator, Session,
    SessionConfig, SessionDebugInfo, SessionFactory, SessionStats, SessionStatus,
};

/// Everything needed to declare entities and drive a session.
pub mod prelude {
    pub use crate::{
        CascadeSet, Cx, Entity, EntityMetadata, EntityRef, EntityState, Error, FetchMode,
        FieldInfo, IdentityStrategy, MemoryStore, MetadataRegistry, Outcome, Predicate, Query,
        Relation, RelationshipEdge, Resolved, Result, Row, Session, SessionConfig,
        SessionFactory, Store, Value,
    };
    pub use std::sync::Arc;
}
