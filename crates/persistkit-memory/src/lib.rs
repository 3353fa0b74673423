//! In-memory `Store` implementation for persistkit.
//!
//! `MemoryStore` keeps one table per entity type, evaluates query plans
//! (joins, predicates, DISTINCT and windows) over them and applies write sets
//! atomically with foreign key checks. It is the reference backend for the
//! unit-of-work tests and a convenient store for examples.
//!
//! All state sits behind an `Arc<Mutex<>>`, so clones share the same tables.
//! Operations run synchronously under the mutex and hand back ready futures.
//!
//! # Transactions
//!
//! Without `begin`, every write set is applied directly. After `begin`,
//! writes go to a working copy that `commit` publishes and `rollback` drops.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new(Arc::clone(&registry));
//! store.insert_row("school_class", Row::from_pairs(vec![("id", Value::BigInt(1))]))?;
//! let factory = SessionFactory::new(registry, store.clone());
//! ```

use asupersync::{Cx, Outcome};
use persistkit_core::{
    EntityType, Error, JoinKind, MetadataRegistry, Predicate, QueryError, QueryErrorKind,
    QueryPlan, Result, Row, StaleWriteError, Store, Value, WriteKind, WriteOp, WriteSet,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

type StoredRow = BTreeMap<String, Value>;

/// Flat row under construction: `(column, value)` in output order.
type FlatRow = Vec<(String, Value)>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<EntityType, Vec<StoredRow>>,
}

impl Tables {
    fn table(&self, entity: EntityType) -> &[StoredRow] {
        self.rows.get(entity).map_or(&[], Vec::as_slice)
    }
}

/// Counters and recordings kept by a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Query plans received, in order.
    pub plans: Vec<QueryPlan>,
    /// Write sets that were applied, in order.
    pub write_sets: Vec<WriteSet>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

impl MemoryStats {
    pub fn queries(&self) -> usize {
        self.plans.len()
    }

    /// Queries whose root is `entity`.
    pub fn queries_for(&self, entity: EntityType) -> usize {
        self.plans.iter().filter(|p| p.entity == entity).count()
    }

    pub fn executes(&self) -> usize {
        self.write_sets.len()
    }
}

struct MemoryInner {
    committed: Tables,
    /// Working copy of an open transaction.
    working: Option<Tables>,
    stats: MemoryStats,
}

impl MemoryInner {
    fn current(&self) -> &Tables {
        self.working.as_ref().unwrap_or(&self.committed)
    }

    fn current_mut(&mut self) -> &mut Tables {
        self.working.as_mut().unwrap_or(&mut self.committed)
    }
}

/// A store whose tables live in memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    registry: Arc<MetadataRegistry>,
}

impl MemoryStore {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                committed: Tables::default(),
                working: None,
                stats: MemoryStats::default(),
            })),
            registry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().working.is_some()
    }

    /// Snapshot of the recorded plans, write sets and transaction counts.
    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.lock().stats = MemoryStats::default();
    }

    // ========================================================================
    // Out-of-band access
    // ========================================================================

    /// Insert a row directly, bypassing sessions and constraint checks.
    ///
    /// The row becomes visible to the committed state and to an open
    /// transaction alike.
    pub fn insert_row(&self, entity: EntityType, row: Row) -> Result<()> {
        self.registry.get(entity)?;
        let stored: StoredRow = row
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let mut inner = self.lock();
        if let Some(working) = inner.working.as_mut() {
            working.rows.entry(entity).or_default().push(stored.clone());
        }
        inner.committed.rows.entry(entity).or_default().push(stored);
        Ok(())
    }

    /// Overwrite one column of a stored row, as a concurrent writer would.
    /// Returns false if the row does not exist.
    pub fn update_column(
        &self,
        entity: EntityType,
        id: &Value,
        column: &str,
        value: Value,
    ) -> Result<bool> {
        let identity = self.registry.get(entity)?.identity.field;
        let mut inner = self.lock();
        let MemoryInner {
            committed, working, ..
        } = &mut *inner;
        let mut found = false;
        for tables in std::iter::once(committed).chain(working.as_mut()) {
            if let Some(row) = find_row_mut(tables, entity, identity, id) {
                row.insert(column.to_string(), value.clone());
                found = true;
            }
        }
        Ok(found)
    }

    /// Delete a stored row directly, as a concurrent writer would.
    /// Returns false if the row does not exist.
    pub fn delete_row(&self, entity: EntityType, id: &Value) -> Result<bool> {
        let identity = self.registry.get(entity)?.identity.field;
        let mut inner = self.lock();
        let MemoryInner {
            committed, working, ..
        } = &mut *inner;
        let mut found = false;
        for tables in std::iter::once(committed).chain(working.as_mut()) {
            if let Some(rows) = tables.rows.get_mut(entity) {
                let before = rows.len();
                rows.retain(|row| !row.get(identity).is_some_and(|v| v.same_identity(id)));
                found |= rows.len() != before;
            }
        }
        Ok(found)
    }

    /// Rows of `entity` as currently visible, in insertion order.
    pub fn rows(&self, entity: EntityType) -> Result<Vec<Row>> {
        let columns = self.registry.get(entity)?.column_names();
        let inner = self.lock();
        Ok(inner
            .current()
            .table(entity)
            .iter()
            .map(|stored| {
                Row::from_pairs(
                    columns
                        .iter()
                        .map(|c| (*c, stored.get(*c).cloned().unwrap_or(Value::Null))),
                )
            })
            .collect())
    }

    pub fn row_count(&self, entity: EntityType) -> usize {
        self.lock().current().table(entity).len()
    }

    /// The currently visible row of `entity` with identity `id`.
    pub fn row(&self, entity: EntityType, id: &Value) -> Result<Option<Row>> {
        let identity = self.registry.get(entity)?.identity.field;
        Ok(self.rows(entity)?.into_iter().find(|row| {
            row.get_by_name(identity)
                .is_some_and(|v| v.same_identity(id))
        }))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn query_sync(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        inner.stats.plans.push(plan.clone());
        let tables = inner.current();

        let root_meta = self.registry.get(plan.entity)?;
        let root_columns = root_meta.column_names();
        let mut rows: Vec<FlatRow> = tables
            .table(plan.entity)
            .iter()
            .map(|stored| flatten(stored, "", &root_columns))
            .collect();

        for join in &plan.joins {
            let target_columns = self.registry.get(join.target)?.column_names();
            let parent_column = qualified(&join.parent_path, join.parent_column);
            let candidates = tables.table(join.target);
            let mut joined = Vec::with_capacity(rows.len());
            for row in rows {
                let parent_value = lookup(&row, &parent_column).cloned();
                let matches: Vec<&StoredRow> = match &parent_value {
                    Some(value) if !value.is_null() => candidates
                        .iter()
                        .filter(|c| {
                            c.get(join.target_column)
                                .is_some_and(|v| v.same_identity(value))
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                if matches.is_empty() {
                    if join.kind == JoinKind::Left {
                        let mut row = row;
                        row.extend(
                            target_columns
                                .iter()
                                .map(|c| (qualified(&join.path, c), Value::Null)),
                        );
                        joined.push(row);
                    }
                    continue;
                }
                for target in matches {
                    let mut extended = row.clone();
                    extended.extend(flatten(target, &join.path, &target_columns));
                    joined.push(extended);
                }
            }
            rows = joined;
        }

        let predicate = CompiledPredicate::compile(&plan.predicate)?;
        rows.retain(|row| predicate.eval(row));

        let hidden: Vec<String> = plan
            .joins
            .iter()
            .filter(|j| !j.fetch)
            .map(|j| format!("{}.", j.path))
            .collect();
        if !hidden.is_empty() {
            for row in &mut rows {
                row.retain(|(name, _)| !hidden.iter().any(|prefix| name.starts_with(prefix)));
            }
        }

        if plan.distinct {
            let mut unique: Vec<FlatRow> = Vec::with_capacity(rows.len());
            for row in rows {
                if !unique.contains(&row) {
                    unique.push(row);
                }
            }
            rows = unique;
        }
        if let Some(window) = plan.window {
            rows = window.apply(rows);
        }

        tracing::trace!(entity = plan.entity, rows = rows.len(), "Memory query");
        Ok(rows.into_iter().map(Row::from_pairs).collect())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn execute_sync(&self, writes: &WriteSet) -> Result<()> {
        let mut inner = self.lock();
        let mut staged = inner.current().clone();
        for op in writes.iter() {
            match op.kind {
                WriteKind::Insert => self.apply_insert(&mut staged, op)?,
                WriteKind::Update => self.apply_update(&mut staged, op)?,
                WriteKind::Delete => self.apply_delete(&mut staged, op)?,
            }
        }
        *inner.current_mut() = staged;
        inner.stats.write_sets.push(writes.clone());
        tracing::debug!(writes = writes.len(), "Memory write set applied");
        Ok(())
    }

    fn apply_insert(&self, tables: &mut Tables, op: &WriteOp) -> Result<()> {
        let identity = self.registry.get(op.entity)?.identity.field;
        if find_row_mut(tables, op.entity, identity, &op.id).is_some() {
            return Err(Error::Query(QueryError::constraint(
                op.entity,
                format!("duplicate identity {}#{}", op.entity, op.id),
            )));
        }
        let row: StoredRow = op.columns.iter().cloned().collect();
        self.check_foreign_keys(tables, op.entity, &row)?;
        tables.rows.entry(op.entity).or_default().push(row);
        Ok(())
    }

    fn apply_update(&self, tables: &mut Tables, op: &WriteOp) -> Result<()> {
        let identity = self.registry.get(op.entity)?.identity.field;
        let Some(row) = find_row_mut(tables, op.entity, identity, &op.id) else {
            return Err(stale(op));
        };
        for (name, value) in &op.columns {
            row.insert(name.clone(), value.clone());
        }
        let row = row.clone();
        self.check_foreign_keys(tables, op.entity, &row)
    }

    fn apply_delete(&self, tables: &mut Tables, op: &WriteOp) -> Result<()> {
        let identity = self.registry.get(op.entity)?.identity.field;
        if find_row_mut(tables, op.entity, identity, &op.id).is_none() {
            return Err(stale(op));
        }
        for meta in self.registry.entities() {
            for (edge, fk) in meta.owning_edges() {
                if edge.target != op.entity {
                    continue;
                }
                let referenced = tables
                    .table(meta.entity)
                    .iter()
                    .any(|row| row.get(fk).is_some_and(|v| v.same_identity(&op.id)));
                if referenced {
                    return Err(Error::Query(QueryError::constraint(
                        op.entity,
                        format!(
                            "{}#{} is still referenced by {}.{}",
                            op.entity, op.id, meta.entity, fk
                        ),
                    )));
                }
            }
        }
        if let Some(rows) = tables.rows.get_mut(op.entity) {
            rows.retain(|row| !row.get(identity).is_some_and(|v| v.same_identity(&op.id)));
        }
        Ok(())
    }

    fn check_foreign_keys(&self, tables: &Tables, entity: EntityType, row: &StoredRow) -> Result<()> {
        let meta = self.registry.get(entity)?;
        for (edge, fk) in meta.owning_edges() {
            let Some(value) = row.get(fk).filter(|v| !v.is_null()) else {
                continue;
            };
            let target_identity = self.registry.get(edge.target)?.identity.field;
            let exists = tables
                .table(edge.target)
                .iter()
                .any(|r| r.get(target_identity).is_some_and(|v| v.same_identity(value)));
            if !exists {
                return Err(Error::Query(QueryError::constraint(
                    entity,
                    format!("{entity}.{fk} references missing {}#{value}", edge.target),
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.working.is_some() {
            return Err(transaction_error("Already in a transaction"));
        }
        inner.working = Some(inner.committed.clone());
        inner.stats.begins += 1;
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(working) = inner.working.take() else {
            return Err(transaction_error("Not in a transaction"));
        };
        inner.committed = working;
        inner.stats.commits += 1;
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.working.take().is_none() {
            return Err(transaction_error("Not in a transaction"));
        }
        inner.stats.rollbacks += 1;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn execute(&self, _cx: &Cx, writes: &WriteSet) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.execute_sync(writes);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query(
        &self,
        _cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(plan);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn max_identity(&self, entity: EntityType) -> Option<Value> {
        let identity = self.registry.get(entity).ok()?.identity.field;
        let inner = self.lock();
        let max = std::iter::once(&inner.committed)
            .chain(inner.working.as_ref())
            .flat_map(|tables| tables.table(entity))
            .filter_map(|row| row.get(identity).and_then(Value::as_i64))
            .max();
        max.map(Value::BigInt)
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn stale(op: &WriteOp) -> Error {
    Error::StaleWrite(StaleWriteError {
        entity: op.entity,
        id: op.id.clone(),
        message: format!("{} found no row", op.kind),
    })
}

fn transaction_error(message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Store,
        entity: None,
        message: message.to_string(),
        source: None,
    })
}

fn find_row_mut<'t>(
    tables: &'t mut Tables,
    entity: EntityType,
    identity: &str,
    id: &Value,
) -> Option<&'t mut StoredRow> {
    tables
        .rows
        .get_mut(entity)?
        .iter_mut()
        .find(|row| row.get(identity).is_some_and(|v| v.same_identity(id)))
}

fn qualified(path: &str, column: &str) -> String {
    if path.is_empty() {
        column.to_string()
    } else {
        format!("{path}.{column}")
    }
}

fn flatten(stored: &StoredRow, path: &str, columns: &[&'static str]) -> FlatRow {
    columns
        .iter()
        .map(|c| {
            (
                qualified(path, c),
                stored.get(*c).cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn lookup<'r>(row: &'r FlatRow, column: &str) -> Option<&'r Value> {
    row.iter().find(|(name, _)| name == column).map(|(_, v)| v)
}

/// A predicate with its LIKE patterns compiled.
enum CompiledPredicate {
    All,
    Eq(String, Value),
    Like(String, Regex),
    In(String, Vec<Value>),
    IsNull(String),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    fn compile(predicate: &Predicate) -> Result<Self> {
        Ok(match predicate {
            Predicate::All => Self::All,
            Predicate::Eq(column, value) => Self::Eq(column.clone(), value.clone()),
            Predicate::Like(column, pattern) => Self::Like(column.clone(), like_regex(pattern)?),
            Predicate::In(column, values) => Self::In(column.clone(), values.clone()),
            Predicate::IsNull(column) => Self::IsNull(column.clone()),
            Predicate::And(parts) => {
                Self::And(parts.iter().map(Self::compile).collect::<Result<_>>()?)
            }
            Predicate::Or(parts) => Self::Or(parts.iter().map(Self::compile).collect::<Result<_>>()?),
            Predicate::Not(inner) => Self::Not(Box::new(Self::compile(inner)?)),
        })
    }

    fn eval(&self, row: &FlatRow) -> bool {
        match self {
            Self::All => true,
            Self::Eq(column, value) => lookup(row, column).is_some_and(|v| v.same_identity(value)),
            Self::Like(column, regex) => lookup(row, column)
                .and_then(Value::as_str)
                .is_some_and(|s| regex.is_match(s)),
            Self::In(column, values) => lookup(row, column)
                .is_some_and(|v| values.iter().any(|candidate| candidate.same_identity(v))),
            Self::IsNull(column) => lookup(row, column).is_none_or(Value::is_null),
            Self::And(parts) => parts.iter().all(|p| p.eval(row)),
            Self::Or(parts) => parts.iter().any(|p| p.eval(row)),
            Self::Not(inner) => !inner.eval(row),
        }
    }
}

/// Translate a SQL LIKE pattern (`%`, `_`) into an anchored regex.
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| {
        Error::Query(QueryError::unsupported(format!(
            "invalid LIKE pattern '{pattern}': {e}"
        )))
    })
}
