//! Fetch-plan resolution.
//!
//! Turns a [`Query`] (root entity, predicate, requested fetch and filter
//! paths, optional window) into a [`QueryPlan`] the store can execute, and
//! decides how the relationships that were not joined get loaded afterwards.
//!
//! - To-one fetch joins are always safe and folded into the single query.
//! - To-many fetch joins multiply rows; roots are deduplicated by hydration.
//! - A window combined with a to-many fetch join cannot be pushed to the
//!   store. Under [`PagedCollectionFetch::Refuse`] the query fails; under
//!   [`PagedCollectionFetch::InMemory`] everything is fetched and paged in
//!   memory, and the result carries a [`FetchWarning`].
//! - Eager edges of the root that are not joined are loaded after the query,
//!   one query per row or batched by the edge's batch size.
//!
//! # Example
//!
//! ```ignore
//! let resolver = FetchPlanResolver::new(&registry, PagedCollectionFetch::InMemory, 3);
//! let plan = resolver.resolve_query(
//!     &Query::new("school_class")
//!         .fetch("persons")
//!         .filter(Predicate::like("persons.name", "%1%"))
//!         .window(0, 2),
//! )?;
//! assert!(plan.degraded());
//! ```

use persistkit_core::{
    EntityType, Error, JoinKind, JoinSpec, MetadataErrorKind, MetadataRegistry,
    PaginatedCollectionFetchWarning, Predicate, QueryPlan, RelationshipEdge, Result, Value, Window,
};
use std::fmt;

/// What to do with a window over a collection fetch join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PagedCollectionFetch {
    /// Fetch every row, page roots in memory, and report a warning.
    #[default]
    InMemory,
    /// Fail with [`Error::PaginatedCollectionFetch`].
    Refuse,
}

/// Non-fatal signal attached to a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchWarning {
    PaginatedCollectionFetch(PaginatedCollectionFetchWarning),
}

impl fmt::Display for FetchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchWarning::PaginatedCollectionFetch(w) => {
                write!(f, "window applied in memory: {w}")
            }
        }
    }
}

/// A root-level query request.
#[derive(Debug, Clone)]
pub struct Query {
    pub entity: EntityType,
    pub predicate: Predicate,
    /// Dotted relationship paths to load in the same query.
    pub fetch: Vec<String>,
    /// Dotted relationship paths joined only to filter roots.
    pub joins: Vec<String>,
    pub window: Option<Window>,
}

impl Query {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            predicate: Predicate::All,
            fetch: Vec::new(),
            joins: Vec::new(),
            window: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    pub fn fetch(mut self, path: impl Into<String>) -> Self {
        self.fetch.push(path.into());
        self
    }

    pub fn join(mut self, path: impl Into<String>) -> Self {
        self.joins.push(path.into());
        self
    }

    pub fn window(mut self, offset: usize, limit: usize) -> Self {
        self.window = Some(Window::new(offset, limit));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        let window = self.window.get_or_insert_with(Window::default);
        window.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        let window = self.window.get_or_insert_with(Window::default);
        window.limit = Some(limit);
        self
    }
}

/// How an unjoined eager edge is loaded after the root query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryStrategy {
    /// One query per root.
    PerRow,
    /// IN-list queries of up to this many roots.
    Batched(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryFetch {
    pub relationship: &'static str,
    pub strategy: SecondaryStrategy,
}

/// A resolved plan.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub plan: QueryPlan,
    /// Window to apply to deduplicated roots after hydration.
    pub in_memory_window: Option<Window>,
    pub secondary: Vec<SecondaryFetch>,
    pub warnings: Vec<FetchWarning>,
}

impl FetchPlan {
    fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            in_memory_window: None,
            secondary: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Is the window applied in memory instead of by the store?
    pub fn degraded(&self) -> bool {
        self.in_memory_window.is_some()
    }
}

/// Join `path` relative to `parent_path` (empty for the root).
pub fn child_path(parent_path: &str, name: &str) -> String {
    if parent_path.is_empty() {
        name.to_string()
    } else {
        format!("{parent_path}.{name}")
    }
}

/// Resolves queries into plans using the metadata registry.
pub struct FetchPlanResolver<'a> {
    registry: &'a MetadataRegistry,
    policy: PagedCollectionFetch,
    max_fetch_depth: usize,
}

impl<'a> FetchPlanResolver<'a> {
    pub fn new(
        registry: &'a MetadataRegistry,
        policy: PagedCollectionFetch,
        max_fetch_depth: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            max_fetch_depth,
        }
    }

    /// Build the join for `edge`, reached from the entity at `parent_path`.
    fn join_spec(
        &self,
        parent_path: &str,
        edge: &RelationshipEdge,
        kind: JoinKind,
        fetch: bool,
    ) -> Result<JoinSpec> {
        let column = self.registry.join_column(edge)?;
        let (parent_column, target_column) = if edge.owning {
            (column, self.registry.get(edge.target)?.identity.field)
        } else {
            (self.registry.get(edge.source)?.identity.field, column)
        };
        Ok(JoinSpec {
            path: child_path(parent_path, edge.name),
            parent_path: parent_path.to_string(),
            relationship: edge.name,
            target: edge.target,
            parent_column,
            target_column,
            collection: edge.is_collection(),
            kind,
            fetch,
        })
    }

    /// Add `path` and its prefixes to `joins`.
    fn add_path(
        &self,
        root: EntityType,
        path: &str,
        fetch: bool,
        joins: &mut Vec<JoinSpec>,
    ) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidPath,
                format!("invalid fetch path '{path}' on '{root}'"),
            ));
        }
        let mut entity = root;
        let mut parent_path = String::new();
        for segment in path.split('.') {
            let edge = self.registry.edge(entity, segment).map_err(|_| {
                Error::metadata(
                    MetadataErrorKind::InvalidPath,
                    format!("'{path}': '{entity}' has no relationship '{segment}'"),
                )
            })?;
            let current = child_path(&parent_path, segment);
            match joins.iter_mut().find(|j| j.path == current) {
                Some(existing) if fetch => existing.fetch = true,
                Some(existing) => existing.kind = JoinKind::Inner,
                None => {
                    let kind = if fetch { JoinKind::Left } else { JoinKind::Inner };
                    joins.push(self.join_spec(&parent_path, edge, kind, fetch)?);
                }
            }
            entity = edge.target;
            parent_path = current;
        }
        Ok(())
    }

    /// Resolve a predicate query.
    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = query.entity))]
    pub fn resolve_query(&self, query: &Query) -> Result<FetchPlan> {
        let meta = self.registry.get(query.entity)?;
        let mut joins = Vec::new();
        for path in &query.fetch {
            self.add_path(query.entity, path, true, &mut joins)?;
        }
        for path in &query.joins {
            self.add_path(query.entity, path, false, &mut joins)?;
        }

        let mut plan = QueryPlan::new(query.entity).filter(query.predicate.clone());
        plan.distinct = joins.iter().any(|j| !j.fetch && j.collection);
        plan.joins = joins;

        let mut resolved = FetchPlan::new(plan);
        if let Some(window) = query.window {
            let collection_fetch = resolved
                .plan
                .joins
                .iter()
                .find(|j| j.fetch && j.collection)
                .map(|j| j.path.clone());
            match collection_fetch {
                Some(path) => {
                    let warning = PaginatedCollectionFetchWarning {
                        entity: query.entity,
                        path,
                        offset: window.offset,
                        limit: window.limit,
                    };
                    if self.policy == PagedCollectionFetch::Refuse {
                        return Err(Error::PaginatedCollectionFetch(warning));
                    }
                    tracing::warn!(
                        entity = query.entity,
                        path = %warning.path,
                        offset = window.offset,
                        limit = ?window.limit,
                        "Window combined with a collection fetch; applying it in memory"
                    );
                    resolved.in_memory_window = Some(window);
                    resolved
                        .warnings
                        .push(FetchWarning::PaginatedCollectionFetch(warning));
                }
                None => resolved.plan.window = Some(window),
            }
        }

        resolved.secondary = meta
            .relationships
            .iter()
            .filter(|edge| edge.is_eager())
            .filter(|edge| {
                !resolved
                    .plan
                    .joins
                    .iter()
                    .any(|j| j.fetch && j.path == edge.name)
            })
            .map(|edge| SecondaryFetch {
                relationship: edge.name,
                strategy: edge
                    .effective_batch_size()
                    .map_or(SecondaryStrategy::PerRow, SecondaryStrategy::Batched),
            })
            .collect();

        tracing::debug!(
            joins = resolved.plan.joins.len(),
            distinct = resolved.plan.distinct,
            degraded = resolved.degraded(),
            secondary = resolved.secondary.len(),
            "Resolved query plan"
        );
        Ok(resolved)
    }

    /// Resolve a lookup by identity; eager edges are joined into the plan.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn resolve_find(&self, entity: EntityType, id: &Value) -> Result<FetchPlan> {
        let meta = self.registry.get(entity)?;
        let mut joins = Vec::new();
        self.add_eager_joins(entity, "", 0, &mut vec![entity], &mut joins)?;
        let plan = QueryPlan {
            entity,
            predicate: Predicate::eq(meta.identity.field, id.clone()),
            joins,
            distinct: false,
            window: None,
        };
        Ok(FetchPlan::new(plan))
    }

    fn add_eager_joins(
        &self,
        entity: EntityType,
        parent_path: &str,
        depth: usize,
        on_path: &mut Vec<EntityType>,
        joins: &mut Vec<JoinSpec>,
    ) -> Result<()> {
        if depth >= self.max_fetch_depth {
            return Ok(());
        }
        let meta = self.registry.get(entity)?;
        for edge in meta.relationships.iter().filter(|e| e.is_eager()) {
            if on_path.contains(&edge.target) {
                continue;
            }
            let join = self.join_spec(parent_path, edge, JoinKind::Left, true)?;
            let path = join.path.clone();
            joins.push(join);
            on_path.push(edge.target);
            self.add_eager_joins(edge.target, &path, depth + 1, on_path, joins)?;
            on_path.pop();
        }
        Ok(())
    }

    /// Plan loading `edge` for the owners with the given identities.
    ///
    /// For a non-owning edge `ids` are owner identities, matched against the
    /// target's foreign key; for an owning edge they are target identities.
    pub fn batch_plan(&self, edge: &RelationshipEdge, ids: Vec<Value>) -> Result<QueryPlan> {
        let column = if edge.owning {
            self.registry.get(edge.target)?.identity.field
        } else {
            self.registry.join_column(edge)?
        };
        let predicate = match ids.len() {
            1 => Predicate::eq(column, ids.into_iter().next().unwrap_or(Value::Null)),
            _ => Predicate::is_in(column, ids),
        };
        Ok(QueryPlan::new(edge.target).filter(predicate))
    }

    /// Plan fetching one row by identity, without joins.
    pub fn identity_plan(&self, entity: EntityType, id: &Value) -> Result<QueryPlan> {
        let meta = self.registry.get(entity)?;
        Ok(QueryPlan::new(entity).filter(Predicate::eq(meta.identity.field, id.clone())))
    }
}
