//! Persistence context for persistkit.
//!
//! `persistkit-session` is the **unit-of-work layer**. A [`Session`] keeps one
//! in-memory instance per stored row, notices which of them changed, and
//! turns all of that into one ordered write set per flush.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one `EntityRef` per (entity type, identity).
//! - **Dirty checking**: column snapshots compared at flush time.
//! - **Cascades**: persist and remove follow the relationship graph.
//! - **Fetch planning**: fetch-joins, windows and batched lazy loading.
//!
//! # Design Philosophy
//!
//! - **Explicit lifecycle**: every entity is Transient, Managed, Detached or Removed.
//! - **Auto-flush before queries** that could observe pending changes.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(registry, store);
//! let mut session = factory.open_session();
//!
//! let class = Entity::new("school_class").with("name", "1a").into_ref();
//! session.persist(&class)?;
//!
//! let found = session.find(&cx, "school_class", 1_i64).await?;
//! assert!(found.is_some_and(|c| c.ptr_eq(&class)));
//!
//! session.commit(&cx).await?;
//! ```

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            asupersync::Outcome::Ok(value) => value,
            asupersync::Outcome::Err(e) => return asupersync::Outcome::Err(e),
            asupersync::Outcome::Cancelled(r) => return asupersync::Outcome::Cancelled(r),
            asupersync::Outcome::Panicked(p) => return asupersync::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return asupersync::Outcome::Err(e),
        }
    };
}

pub mod cascade;
pub mod change_tracker;
pub mod fetch_plan;
pub mod flush;
pub mod generator;
pub mod hydrate;
pub mod identity_map;
pub mod n1_detection;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, ColumnValues, ObjectSnapshot};
pub use fetch_plan::{
    FetchPlan, FetchPlanResolver, FetchWarning, PagedCollectionFetch, Query, SecondaryFetch,
    SecondaryStrategy,
};
pub use flush::{FlushOrderer, FlushResult, PendingWrite};
pub use generator::{IdentityGenerator, SequenceGenerator};
pub use identity_map::IdentityMap;
pub use n1_detection::{N1QueryTracker, N1Stats};
pub use unit_of_work::{PendingCounts, PreparedFlush, UnitOfWork, key_of};

use asupersync::{Cx, Outcome};
use persistkit_core::{
    Entity, EntityMetadata, EntityRef, EntityState, EntityType, Error, IdentityStrategy,
    LazyHandle, LazyInitializationError, LazyLoader, LazyTarget, MetadataErrorKind,
    MetadataRegistry, NotFoundError, QueryPlan, Relation, RelationshipEdge, Resolved, Result,
    Row, SessionUnusableError, Store, Value, initialize,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use unit_of_work::{illegal_state, not_managed};

// ============================================================================
// Object Key
// ============================================================================

/// Unique key for an entity in the identity map.
///
/// Identities compare by value, so `Int(7)` and `BigInt(7)` are the same key.
#[derive(Debug, Clone)]
pub struct ObjectKey {
    entity: EntityType,
    id: Value,
}

impl ObjectKey {
    pub fn new(entity: EntityType, id: Value) -> Self {
        Self { entity, id }
    }

    /// The entity type name.
    pub fn entity(&self) -> EntityType {
        self.entity
    }

    /// The identity value.
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id.same_identity(&other.id)
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash_identity(state);
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush pending changes before a query that could observe them.
    pub auto_flush: bool,
    /// What to do with a window combined with a collection fetch-join.
    pub paged_collection_fetch: PagedCollectionFetch,
    /// How many eager edges `find` follows in a single join chain.
    pub max_fetch_depth: usize,
    /// N+1 warning threshold; `None` disables detection.
    pub n1_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            paged_collection_fetch: PagedCollectionFetch::InMemory,
            max_fetch_depth: 3,
            n1_threshold: Some(3),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn paged_collection_fetch(mut self, policy: PagedCollectionFetch) -> Self {
        self.paged_collection_fetch = policy;
        self
    }

    #[must_use]
    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    #[must_use]
    pub fn n1_threshold(mut self, threshold: Option<usize>) -> Self {
        self.n1_threshold = threshold;
        self
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// Accepts every operation.
    Active,
    /// A flush or store call failed; only `rollback` and `close` are accepted.
    Failed,
    /// An operation was cancelled mid-flight; only `close` is accepted.
    Poisoned,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Failed => "failed",
            SessionStatus::Poisoned => "poisoned",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters kept by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Read plans sent to the store.
    pub queries: usize,
    /// Lazy relationship loads that reached the store.
    pub lazy_loads: usize,
    /// Flushes that sent a non-empty write set.
    pub flushes: usize,
}

/// Entities returned by [`Session::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub entities: Vec<EntityRef>,
    /// Non-fatal plan degradations, such as an in-memory window.
    pub warnings: Vec<FetchWarning>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Was the plan degraded?
    pub fn degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_entities(self) -> Vec<EntityRef> {
        self.entities
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Number of entities in the identity map.
    pub tracked: usize,
    /// Entities waiting to be inserted.
    pub pending_new: usize,
    /// Entities waiting to be deleted.
    pub pending_delete: usize,
    /// Managed entities whose columns differ from their snapshot.
    pub pending_dirty: usize,
    /// Whether a store transaction is open.
    pub in_transaction: bool,
    pub status: SessionStatus,
    pub stats: SessionStats,
}

// ============================================================================
// Session Factory
// ============================================================================

/// Opens sessions over a shared registry and store.
pub struct SessionFactory<S> {
    registry: Arc<MetadataRegistry>,
    store: S,
    generator: Arc<dyn IdentityGenerator>,
    config: SessionConfig,
}

impl<S: Store + Clone> SessionFactory<S> {
    pub fn new(registry: Arc<MetadataRegistry>, store: S) -> Self {
        Self {
            registry,
            store,
            generator: Arc::new(SequenceGenerator::new()),
            config: SessionConfig::default(),
        }
    }

    /// Use a custom identity generator. It is shared by every session.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn IdentityGenerator>) -> Self {
        self.generator = generator;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a new, empty persistence context.
    pub fn open_session(&self) -> Session<S> {
        Session::with_config(
            self.store.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.generator),
            self.config.clone(),
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// A persistence context: identity map, change tracking and the store
/// transaction they are flushed into.
pub struct Session<S: Store> {
    store: S,
    uow: UnitOfWork,
    config: SessionConfig,
    status: SessionStatus,
    in_transaction: bool,
    n1_tracker: Option<N1QueryTracker>,
    stats: SessionStats,
    identities_seeded: bool,
}

impl<S: Store> Session<S> {
    /// Create a session with the default configuration.
    pub fn new(
        store: S,
        registry: Arc<MetadataRegistry>,
        generator: Arc<dyn IdentityGenerator>,
    ) -> Self {
        Self::with_config(store, registry, generator, SessionConfig::default())
    }

    pub fn with_config(
        store: S,
        registry: Arc<MetadataRegistry>,
        generator: Arc<dyn IdentityGenerator>,
        config: SessionConfig,
    ) -> Self {
        let n1_tracker = config
            .n1_threshold
            .map(N1QueryTracker::with_threshold);
        Self {
            store,
            uow: UnitOfWork::new(registry, generator),
            config,
            status: SessionStatus::Active,
            in_transaction: false,
            n1_tracker,
            stats: SessionStats::default(),
            identities_seeded: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &MetadataRegistry {
        self.uow.registry()
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<()> {
        if self.status == SessionStatus::Active {
            Ok(())
        } else {
            Err(Error::SessionUnusable(SessionUnusableError {
                status: self.status.as_str(),
                operation,
            }))
        }
    }

    /// Update the session status from the outcome of a store-facing call.
    fn track<T>(&mut self, outcome: Outcome<T, Error>, flushing: bool) -> Outcome<T, Error> {
        match &outcome {
            Outcome::Cancelled(_) | Outcome::Panicked(_) | Outcome::Err(Error::Cancelled) => {
                tracing::warn!("Session poisoned by cancellation");
                self.status = SessionStatus::Poisoned;
            }
            Outcome::Err(e) if flushing || e.poisons_session() => {
                if self.status == SessionStatus::Active {
                    tracing::warn!(error = %e, "Session failed; rollback required");
                    self.status = SessionStatus::Failed;
                }
            }
            _ => {}
        }
        outcome
    }

    fn resolver(&self) -> FetchPlanResolver<'_> {
        FetchPlanResolver::new(
            self.uow.registry(),
            self.config.paged_collection_fetch,
            self.config.max_fetch_depth,
        )
    }

    async fn run_query(&mut self, cx: &Cx, plan: &QueryPlan) -> Outcome<Vec<Row>, Error> {
        self.stats.queries += 1;
        tracing::trace!(entity = plan.entity, joins = plan.joins.len(), "Sending query plan");
        let outcome = self.store.query(cx, plan).await;
        self.track(outcome, false)
    }

    /// Move the shared generator past every identity the store already
    /// holds for entities with generated identities. Runs once per session.
    fn seed_identities(&mut self) {
        if self.identities_seeded {
            return;
        }
        self.identities_seeded = true;
        for meta in self.uow.registry.entities() {
            if meta.identity.strategy != IdentityStrategy::Generated {
                continue;
            }
            if let Some(max) = self.store.max_identity(meta.entity) {
                tracing::trace!(entity = meta.entity, max = %max, "Seeding identity sequence");
                self.uow.generator.observe(meta.entity, &max);
            }
        }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Make a transient entity managed, cascading through `PERSIST` edges.
    ///
    /// Persisting an entity this session already manages is a no-op.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_usable("persist")?;
        self.seed_identities();
        let persisted = self.uow.persist(entity)?;
        tracing::debug!(count = persisted.len(), "Entities persisted");
        Ok(())
    }

    /// Find an entity by identity.
    ///
    /// The identity map is consulted first; an entity removed in this session
    /// is reported as absent.
    #[tracing::instrument(level = "debug", skip(self, cx, id))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: EntityType,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        try_result!(self.ensure_usable("find"));
        let id = id.into();
        if let Some(existing) = self.uow.get(&ObjectKey::new(entity, id.clone())) {
            tracing::trace!(entity, id = %id, "Identity map hit");
            let visible = existing.state() != EntityState::Removed;
            return Outcome::Ok(visible.then_some(existing));
        }
        let plan = try_result!(self.resolver().resolve_find(entity, &id)).plan;
        let rows = try_outcome!(self.run_query(cx, &plan).await);
        let roots = try_result!(self.uow.hydrate(&plan, &rows));
        Outcome::Ok(roots.into_iter().next())
    }

    /// Schedule a managed entity for deletion, cascading through `REMOVE`
    /// and orphan-removal edges. Unloaded relationships on those edges are
    /// loaded first.
    #[tracing::instrument(level = "debug", skip(self, cx, entity))]
    pub async fn remove(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        try_result!(self.ensure_usable("remove"));
        let held = self.uow.holds(entity);
        match entity.state() {
            EntityState::Removed if held => return Outcome::Ok(()),
            EntityState::Managed if held => {}
            _ => return Outcome::Err(not_managed("remove", entity)),
        }
        try_outcome!(self.load_remove_graph(cx, entity).await);
        let order = try_result!(cascade::collect_remove(self.uow.registry(), entity));
        tracing::debug!(count = order.len(), "Scheduling removal");
        self.uow.schedule_remove(&order);
        Outcome::Ok(())
    }

    /// Load every unresolved relationship a removal of `root` would follow.
    async fn load_remove_graph(&mut self, cx: &Cx, root: &EntityRef) -> Outcome<(), Error> {
        loop {
            let pending = try_result!(cascade::unresolved_on_remove(self.uow.registry(), root));
            if pending.is_empty() {
                return Outcome::Ok(());
            }
            for (owner, relationship) in pending {
                try_outcome!(self.resolve_relation(cx, &owner, relationship).await);
            }
        }
    }

    /// Stop managing an entity. Pending writes for it are dropped.
    pub fn detach(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_usable("detach")?;
        self.uow.detach(entity)
    }

    /// Copy the state of a detached or transient entity onto the managed
    /// instance with the same identity, loading or creating it as needed.
    ///
    /// The argument itself never becomes managed.
    #[tracing::instrument(level = "debug", skip(self, cx, entity))]
    pub async fn merge(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<EntityRef, Error> {
        try_result!(self.ensure_usable("merge"));
        let (entity_type, id, state) = {
            let guard = entity.read();
            (guard.entity_type(), guard.id().cloned(), guard.state())
        };
        if state == EntityState::Removed {
            return Outcome::Err(illegal_state(
                "merge",
                entity_type,
                id,
                "cannot merge a removed entity",
            ));
        }
        if self.uow.holds(entity) {
            return Outcome::Ok(entity.clone());
        }

        let meta = try_result!(self.uow.registry().get(entity_type)).clone();
        let existing = match &id {
            Some(id) => match self.uow.get(&ObjectKey::new(entity_type, id.clone())) {
                Some(current) if current.state() == EntityState::Removed => {
                    return Outcome::Err(illegal_state(
                        "merge",
                        entity_type,
                        Some(id.clone()),
                        "identity is scheduled for removal",
                    ));
                }
                Some(current) => Some(current),
                None => try_outcome!(self.find(cx, entity_type, id.clone()).await),
            },
            None => None,
        };

        let target = existing.unwrap_or_else(|| {
            let mut copy = Entity::new(entity_type);
            if let Some(id) = &id {
                copy.set_id(id.clone());
            }
            copy.into_ref()
        });
        self.copy_state(&meta, entity, &target);
        if target.state() == EntityState::Transient {
            self.seed_identities();
            try_result!(self.uow.persist(&target));
        }
        Outcome::Ok(target)
    }

    /// Copy fields and owning references from `source` onto `target`.
    fn copy_state(&self, meta: &EntityMetadata, source: &EntityRef, target: &EntityRef) {
        let (fields, references) = {
            let src = source.read();
            let fields: Vec<(&'static str, Value)> = meta
                .fields
                .iter()
                .filter_map(|f| src.get(f.name).map(|v| (f.name, v.clone())))
                .collect();
            let references: Vec<(&RelationshipEdge, Relation)> = meta
                .owning_edges()
                .filter_map(|(edge, _)| src.relation(edge.name).map(|r| (edge, r.clone())))
                .collect();
            (fields, references)
        };
        let references: Vec<(&'static str, Relation)> = references
            .into_iter()
            .map(|(edge, relation)| (edge.name, self.merged_reference(edge, &relation)))
            .collect();

        let mut guard = target.write();
        for (name, value) in fields {
            guard.set(name, value);
        }
        for (name, relation) in references {
            guard.set_relation(name, relation);
        }
    }

    /// Point a merged reference at this session's instance of the target.
    fn merged_reference(&self, edge: &RelationshipEdge, relation: &Relation) -> Relation {
        let referenced = match relation {
            Relation::Lazy(handle) if !handle.is_loaded() => {
                return Relation::Lazy(LazyHandle::new(handle.target().clone()));
            }
            other => other.targets().and_then(|t| t.into_iter().next()),
        };
        let Some(referenced) = referenced else {
            return Relation::one(None);
        };
        let Some(id) = referenced.id() else {
            return Relation::one(Some(referenced));
        };
        match self.uow.get(&ObjectKey::new(edge.target, id.clone())) {
            Some(managed) => Relation::one(Some(managed)),
            None => Relation::Lazy(LazyHandle::new(LazyTarget::Reference {
                owner: edge.source,
                relationship: edge.name,
                target: edge.target,
                id,
            })),
        }
    }

    // ========================================================================
    // Flush / commit / rollback
    // ========================================================================

    /// Write all pending changes to the store as one ordered write set.
    ///
    /// Opens a store transaction if none is open. A failed flush leaves the
    /// session `Failed` until [`Session::rollback`].
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_result!(self.ensure_usable("flush"));
        let outcome = self.flush_inner(cx).await;
        self.track(outcome, true)
    }

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let start = Instant::now();
        self.seed_identities();
        try_result!(self.uow.cascade_persist_all());

        loop {
            let orphans = try_result!(self.uow.orphan_candidates());
            if orphans.is_empty() {
                break;
            }
            tracing::debug!(count = orphans.len(), "Removing orphans");
            for orphan in orphans {
                if orphan.state() != EntityState::Managed {
                    continue;
                }
                try_outcome!(self.load_remove_graph(cx, &orphan).await);
                let order = try_result!(cascade::collect_remove(self.uow.registry(), &orphan));
                self.uow.schedule_remove(&order);
            }
        }

        try_result!(self.uow.check_transient_references());
        let prepared = try_result!(self.uow.prepare_flush());
        if prepared.writes.is_empty() {
            self.uow.complete_flush(prepared);
            tracing::debug!("Nothing to flush");
            return Outcome::Ok(FlushResult::default());
        }

        if !self.in_transaction {
            try_outcome!(self.store.begin(cx).await);
            self.in_transaction = true;
        }
        try_outcome!(self.store.execute(cx, &prepared.writes).await);

        let result = FlushResult::new(prepared.writes.clone());
        self.uow.complete_flush(prepared);
        self.stats.flushes += 1;
        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    /// Flush, then commit the store transaction.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_result!(self.ensure_usable("commit"));
        let result = try_outcome!(self.flush(cx).await);
        if self.in_transaction {
            let outcome = self.store.commit(cx).await;
            try_outcome!(self.track(outcome, true));
            self.in_transaction = false;
            tracing::info!("Transaction committed");
        }
        Outcome::Ok(result)
    }

    /// Roll back the store transaction and discard pending work.
    ///
    /// Unflushed inserts become detached, entities scheduled for removal
    /// become managed again, and every managed entity is re-snapshotted from
    /// its in-memory values. In-memory state of already flushed changes is
    /// not reverted; use [`Session::refresh`] to see the store's state.
    /// A failed session becomes active again.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if matches!(self.status, SessionStatus::Poisoned | SessionStatus::Closed) {
            return Outcome::Err(Error::SessionUnusable(SessionUnusableError {
                status: self.status.as_str(),
                operation: "rollback",
            }));
        }
        if self.in_transaction {
            let outcome = self.store.rollback(cx).await;
            self.in_transaction = false;
            try_outcome!(self.track(outcome, false));
        }
        try_result!(self.uow.discard_pending());
        self.status = SessionStatus::Active;
        tracing::info!("Transaction rolled back");
        Outcome::Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Flush when auto-flush is on and pending changes touch `types`, so a
    /// following store read observes them.
    async fn auto_flush_for(&mut self, cx: &Cx, types: &[EntityType]) -> Outcome<(), Error> {
        if !self.config.auto_flush {
            return Outcome::Ok(());
        }
        self.seed_identities();
        try_result!(self.uow.cascade_persist_all());
        if self.uow.has_changes_for(types) {
            tracing::debug!(?types, "Auto-flushing before read");
            try_outcome!(self.flush(cx).await);
        }
        Outcome::Ok(())
    }

    /// Run a query, flushing first when pending changes touch the queried
    /// entity types.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(entity = query.entity))]
    pub async fn query(&mut self, cx: &Cx, query: &Query) -> Outcome<QueryResult, Error> {
        try_result!(self.ensure_usable("query"));
        let plan = try_result!(self.resolver().resolve_query(query));

        let mut types = vec![plan.plan.entity];
        types.extend(plan.plan.joins.iter().map(|j| j.target));
        try_outcome!(self.auto_flush_for(cx, &types).await);

        let rows = try_outcome!(self.run_query(cx, &plan.plan).await);
        let roots = try_result!(self.uow.hydrate(&plan.plan, &rows));
        let mut entities: Vec<EntityRef> = roots
            .into_iter()
            .filter(|e| e.state() != EntityState::Removed)
            .collect();
        if let Some(window) = plan.in_memory_window {
            entities = window.apply(entities);
        }

        for secondary in &plan.secondary {
            match secondary.strategy {
                SecondaryStrategy::PerRow => {
                    for entity in &entities {
                        try_outcome!(self.load_relation(cx, entity, secondary.relationship).await);
                    }
                }
                SecondaryStrategy::Batched(_) => {
                    try_outcome!(self.load_batch(cx, &entities, secondary.relationship).await);
                }
            }
        }

        Outcome::Ok(QueryResult {
            entities,
            warnings: plan.warnings,
        })
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Resolve relationship `relationship` of `owner`.
    ///
    /// Like [`Session::query`], an unresolved relationship is loaded only
    /// after pending changes to its target type were flushed. Fails with
    /// [`Error::LazyInitialization`] when `owner` is not managed.
    #[tracing::instrument(level = "debug", skip(self, cx, owner))]
    pub async fn load_relation(
        &mut self,
        cx: &Cx,
        owner: &EntityRef,
        relationship: &str,
    ) -> Outcome<Resolved, Error> {
        try_result!(self.ensure_usable("load_relation"));
        let unresolved = owner
            .read()
            .relation(relationship)
            .is_some_and(|relation| !relation.is_resolved());
        if unresolved && owner.state() == EntityState::Managed {
            let edge = *try_result!(self.uow.registry().edge(owner.entity_type(), relationship));
            try_outcome!(self.auto_flush_for(cx, &[edge.target]).await);
        }
        self.resolve_relation(cx, owner, relationship).await
    }

    /// [`Session::load_relation`] without the auto-flush; used while
    /// flushing and removing.
    async fn resolve_relation(
        &mut self,
        cx: &Cx,
        owner: &EntityRef,
        relationship: &str,
    ) -> Outcome<Resolved, Error> {
        let was_resolved = owner
            .read()
            .relation(relationship)
            .is_some_and(Relation::is_resolved);
        let outcome = initialize(cx, owner, relationship, &mut *self).await;
        let outcome = self.track(outcome, false);
        if let (false, Outcome::Ok(value)) = (was_resolved, &outcome) {
            self.uow.record_baseline(owner, relationship, value.entities());
        }
        outcome
    }

    /// Resolve `relationship` for many owners with one IN-list query per
    /// batch (the edge's batch size, or all owners at once). Pending changes
    /// to the target type are auto-flushed first.
    ///
    /// Returns the number of load queries issued.
    #[tracing::instrument(level = "debug", skip(self, cx, owners), fields(owners = owners.len()))]
    pub async fn load_batch(
        &mut self,
        cx: &Cx,
        owners: &[EntityRef],
        relationship: &str,
    ) -> Outcome<usize, Error> {
        try_result!(self.ensure_usable("load_batch"));
        let mut pending = Vec::new();
        for owner in owners {
            let guard = owner.read();
            match guard.relation(relationship) {
                Some(Relation::Lazy(handle)) if !handle.is_loaded() => {}
                _ => continue,
            }
            if guard.state() != EntityState::Managed {
                return Outcome::Err(Error::LazyInitialization(LazyInitializationError {
                    entity: guard.entity_type(),
                    id: guard.id().cloned(),
                    relationship: relationship.to_string(),
                    state: guard.state(),
                }));
            }
            drop(guard);
            pending.push(owner.clone());
        }
        let Some(first) = pending.first() else {
            return Outcome::Ok(0);
        };
        let edge = *try_result!(self.uow.registry().edge(first.entity_type(), relationship));
        let size = edge.effective_batch_size().unwrap_or(pending.len()).max(1);
        try_outcome!(self.auto_flush_for(cx, &[edge.target]).await);

        let mut queries = 0;
        for chunk in pending.chunks(size) {
            if edge.owning {
                queries += try_outcome!(self.load_reference_chunk(cx, &edge, chunk).await);
            } else {
                let ids: Vec<Value> = chunk.iter().filter_map(EntityRef::id).collect();
                let groups = try_outcome!(self.fetch_inverse(cx, &edge, &ids).await);
                queries += 1;
                for (owner, members) in chunk.iter().zip(groups) {
                    self.fill_loaded(owner, &edge, members);
                }
            }
        }
        tracing::debug!(queries, relationship = edge.name, "Batch load complete");
        Outcome::Ok(queries)
    }

    /// Resolve owning to-one references of `chunk`, querying only the
    /// targets missing from the identity map.
    async fn load_reference_chunk(
        &mut self,
        cx: &Cx,
        edge: &RelationshipEdge,
        chunk: &[EntityRef],
    ) -> Outcome<usize, Error> {
        let targets: Vec<(EntityRef, Value)> = chunk
            .iter()
            .filter_map(|owner| {
                let guard = owner.read();
                match guard.relation(edge.name) {
                    Some(Relation::Lazy(handle)) => match handle.target() {
                        LazyTarget::Reference { id, .. } => Some((owner.clone(), id.clone())),
                        LazyTarget::Inverse { .. } => None,
                    },
                    _ => None,
                }
            })
            .collect();

        let mut missing: Vec<Value> = Vec::new();
        for (_, id) in &targets {
            let key = ObjectKey::new(edge.target, id.clone());
            if !self.uow.identity_map().contains(&key) && !missing.iter().any(|m| m.same_identity(id)) {
                missing.push(id.clone());
            }
        }

        let mut queries = 0;
        if !missing.is_empty() {
            let plan = try_result!(self.resolver().batch_plan(edge, missing));
            let rows = try_outcome!(self.run_query(cx, &plan).await);
            try_result!(self.uow.hydrate(&plan, &rows));
            queries = 1;
        }
        for (owner, id) in targets {
            let target = self.uow.get(&ObjectKey::new(edge.target, id));
            self.fill_loaded(&owner, edge, target.into_iter().collect());
        }
        Outcome::Ok(queries)
    }

    /// Query the targets of non-owning `edge` for the given owner
    /// identities, grouped per owner in the order of `owner_ids`.
    async fn fetch_inverse(
        &mut self,
        cx: &Cx,
        edge: &RelationshipEdge,
        owner_ids: &[Value],
    ) -> Outcome<Vec<Vec<EntityRef>>, Error> {
        let fk = try_result!(self.uow.registry().join_column(edge));
        let target_identity = try_result!(self.uow.registry().get(edge.target)).identity.field;
        let plan = try_result!(self.resolver().batch_plan(edge, owner_ids.to_vec()));
        let rows = try_outcome!(self.run_query(cx, &plan).await);
        try_result!(self.uow.hydrate(&plan, &rows));

        let mut groups: Vec<Vec<EntityRef>> = vec![Vec::new(); owner_ids.len()];
        for row in &rows {
            let (Some(owner), Some(id)) = (row.get_by_name(fk), row.get_by_name(target_identity))
            else {
                continue;
            };
            let Some(slot) = owner_ids.iter().position(|o| o.same_identity(owner)) else {
                continue;
            };
            if let Some(child) = self.uow.get(&ObjectKey::new(edge.target, id.clone())) {
                if !groups[slot].iter().any(|c| c.ptr_eq(&child)) {
                    groups[slot].push(child);
                }
            }
        }
        Outcome::Ok(groups)
    }

    /// Complete an unloaded handle of `owner` and record its baseline.
    fn fill_loaded(&mut self, owner: &EntityRef, edge: &RelationshipEdge, members: Vec<EntityRef>) {
        let value = resolved_value(edge, members);
        let filled = owner
            .write()
            .relation_mut(edge.name)
            .is_some_and(|relation| relation.fill(value.clone()));
        if filled {
            self.uow.record_baseline(owner, edge.name, value.entities());
        }
    }

    /// Resolve a lazy target. Inverse loads on an edge with a batch size
    /// also fill the same relationship of other managed owners.
    async fn load_target(&mut self, cx: &Cx, target: &LazyTarget) -> Outcome<Resolved, Error> {
        match target {
            LazyTarget::Reference {
                owner,
                relationship,
                target,
                id,
            } => {
                let target = *target;
                if let Some(existing) = self.uow.get(&ObjectKey::new(target, id.clone())) {
                    return Outcome::Ok(Resolved::One(Some(existing)));
                }
                let plan = try_result!(self.resolver().identity_plan(target, id));
                if let Some(tracker) = self.n1_tracker.as_mut() {
                    tracker.record_load(*owner, *relationship);
                }
                self.stats.lazy_loads += 1;
                let rows = try_outcome!(self.run_query(cx, &plan).await);
                let loaded = try_result!(self.uow.hydrate(&plan, &rows));
                match loaded.into_iter().next() {
                    Some(entity) => Outcome::Ok(Resolved::One(Some(entity))),
                    None => Outcome::Err(Error::NotFound(NotFoundError {
                        entity: target,
                        id: id.clone(),
                    })),
                }
            }
            LazyTarget::Inverse {
                owner,
                owner_id,
                relationship,
            } => {
                let (owner, relationship) = (*owner, *relationship);
                let edge = *try_result!(self.uow.registry().edge(owner, relationship));
                let mut owner_ids = vec![owner_id.clone()];
                let mut siblings = Vec::new();
                if let Some(size) = edge.effective_batch_size() {
                    for (key, entity) in self.uow.identity_map().entries_of(owner) {
                        if owner_ids.len() >= size {
                            break;
                        }
                        if key.id().same_identity(owner_id)
                            || entity.state() != EntityState::Managed
                        {
                            continue;
                        }
                        let unloaded = matches!(
                            entity.read().relation(relationship),
                            Some(Relation::Lazy(handle)) if handle.is_unloaded()
                        );
                        if unloaded {
                            owner_ids.push(key.id().clone());
                            siblings.push(entity);
                        }
                    }
                }

                if let Some(tracker) = self.n1_tracker.as_mut() {
                    tracker.record_load(owner, relationship);
                }
                self.stats.lazy_loads += 1;
                let groups = try_outcome!(self.fetch_inverse(cx, &edge, &owner_ids).await);
                let mut groups = groups.into_iter();
                let own = groups.next().unwrap_or_default();
                for (sibling, members) in siblings.iter().zip(groups) {
                    self.fill_loaded(sibling, &edge, members);
                }
                Outcome::Ok(resolved_value(&edge, own))
            }
        }
    }

    /// Add `child` to a collection of `parent`, loading the collection first
    /// and pointing the child's owning back-reference at `parent`.
    #[tracing::instrument(level = "debug", skip(self, cx, parent, child))]
    pub async fn add_to_collection(
        &mut self,
        cx: &Cx,
        parent: &EntityRef,
        relationship: &str,
        child: &EntityRef,
    ) -> Outcome<(), Error> {
        try_result!(self.ensure_usable("add_to_collection"));
        let edge = try_outcome!(
            self.prepare_collection(cx, parent, relationship, "add_to_collection")
                .await
        );
        if !parent.write().push_related(edge.name, child.clone()) {
            return Outcome::Err(Error::metadata(
                MetadataErrorKind::Invalid,
                format!("'{}.{}' is not an in-memory collection", edge.source, edge.name),
            ));
        }
        if let Some(inverse) = self.uow.registry().inverse(&edge) {
            child.write().set_reference(inverse.name, Some(parent.clone()));
        }
        Outcome::Ok(())
    }

    /// Remove `child` from a collection of `parent` and clear its owning
    /// back-reference. Returns false if it was not a member.
    ///
    /// With orphan removal on the edge, the child is deleted at the next flush.
    #[tracing::instrument(level = "debug", skip(self, cx, parent, child))]
    pub async fn remove_from_collection(
        &mut self,
        cx: &Cx,
        parent: &EntityRef,
        relationship: &str,
        child: &EntityRef,
    ) -> Outcome<bool, Error> {
        try_result!(self.ensure_usable("remove_from_collection"));
        let edge = try_outcome!(
            self.prepare_collection(cx, parent, relationship, "remove_from_collection")
                .await
        );
        if !parent.write().remove_related(edge.name, child) {
            return Outcome::Ok(false);
        }
        if let Some(inverse) = self.uow.registry().inverse(&edge) {
            let parent_id = parent.id();
            let points_at_parent = match child.read().relation(inverse.name) {
                Some(Relation::Lazy(handle)) if !handle.is_loaded() => matches!(
                    handle.target(),
                    LazyTarget::Reference { id, .. }
                        if parent_id.as_ref().is_some_and(|p| p.same_identity(id))
                ),
                Some(relation) => relation
                    .targets()
                    .is_some_and(|t| t.iter().any(|x| x.ptr_eq(parent))),
                None => false,
            };
            if points_at_parent {
                child.write().set_reference(inverse.name, None);
            }
        }
        Outcome::Ok(true)
    }

    /// Validate a collection edge of `parent` and make sure it is resolved.
    async fn prepare_collection(
        &mut self,
        cx: &Cx,
        parent: &EntityRef,
        relationship: &str,
        operation: &'static str,
    ) -> Outcome<RelationshipEdge, Error> {
        let state = parent.state();
        let managed = state == EntityState::Managed && self.uow.holds(parent);
        if !managed && state != EntityState::Transient {
            return Outcome::Err(not_managed(operation, parent));
        }
        let edge = *try_result!(self.uow.registry().edge(parent.entity_type(), relationship));
        if !edge.is_collection() {
            return Outcome::Err(Error::metadata(
                MetadataErrorKind::Invalid,
                format!("'{}.{}' is not a collection", edge.source, edge.name),
            ));
        }
        if managed {
            try_outcome!(self.load_relation(cx, parent, relationship).await);
        }
        Outcome::Ok(edge)
    }

    /// Reload a managed entity's columns from the store, discarding
    /// in-memory changes.
    #[tracing::instrument(level = "debug", skip(self, cx, entity))]
    pub async fn refresh(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        try_result!(self.ensure_usable("refresh"));
        let key = match key_of(entity) {
            Some(key) if entity.state() == EntityState::Managed && self.uow.holds(entity) => key,
            _ => return Outcome::Err(not_managed("refresh", entity)),
        };
        let plan = try_result!(self.resolver().identity_plan(key.entity(), key.id()));
        let rows = try_outcome!(self.run_query(cx, &plan).await);
        match rows.first() {
            Some(row) => {
                try_result!(self.uow.reload(entity, row));
                Outcome::Ok(())
            }
            None => Outcome::Err(Error::NotFound(NotFoundError {
                entity: key.entity(),
                id: key.id().clone(),
            })),
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Is `entity` managed by this session?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        entity.state() == EntityState::Managed && self.uow.holds(entity)
    }

    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        entity.state()
    }

    /// Detach every entity. Returns how many were tracked.
    pub fn clear(&mut self) -> usize {
        let count = self.uow.clear();
        tracing::debug!(count, "Session cleared");
        count
    }

    /// Roll back any open transaction, detach everything and close the session.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.status == SessionStatus::Closed {
            return Outcome::Ok(());
        }
        let mut outcome = Outcome::Ok(());
        if self.in_transaction {
            outcome = self.store.rollback(cx).await;
            self.in_transaction = false;
        }
        self.uow.clear();
        self.status = SessionStatus::Closed;
        outcome
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.uow.pending_counts();
        SessionDebugInfo {
            tracked: self.uow.identity_map().len(),
            pending_new: counts.new,
            pending_delete: counts.deleted,
            pending_dirty: counts.dirty,
            in_transaction: self.in_transaction,
            status: self.status,
            stats: self.stats,
        }
    }

    // ========================================================================
    // N+1 Query Detection
    // ========================================================================

    /// Enable N+1 detection with the given threshold, resetting the counts.
    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1_tracker = Some(N1QueryTracker::with_threshold(threshold));
    }

    pub fn disable_n1_detection(&mut self) {
        self.n1_tracker = None;
    }

    pub fn n1_tracker(&self) -> Option<&N1QueryTracker> {
        self.n1_tracker.as_ref()
    }

    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1_tracker.as_ref().map(N1QueryTracker::stats)
    }
}

fn resolved_value(edge: &RelationshipEdge, members: Vec<EntityRef>) -> Resolved {
    if edge.is_collection() {
        Resolved::Many(members)
    } else {
        Resolved::One(members.into_iter().next())
    }
}

impl<S: Store> LazyLoader for Session<S> {
    fn load(
        &mut self,
        cx: &Cx,
        target: &LazyTarget,
    ) -> impl Future<Output = Outcome<Resolved, Error>> {
        self.load_target(cx, target)
    }
}
