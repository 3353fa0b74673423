//! The store collaborator.
//!
//! The unit of work never emits query text. It talks to a [`Store`] in
//! structured terms: a [`QueryPlan`] to read rows and an ordered [`WriteSet`]
//! to apply changes.
//!
//! - [`Store`] - execute write sets, run query plans, transaction hooks
//! - [`QueryPlan`] / [`Predicate`] / [`JoinSpec`] / [`Window`] - reads
//! - [`WriteSet`] / [`WriteOp`] - writes
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation.

use crate::error::Error;
use crate::metadata::EntityType;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Reads
// ============================================================================

/// Row filter, evaluated against the flat row layout (joined columns are
/// addressed as `"<path>.<column>"`).
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every row.
    All,
    /// `column = value`
    Eq(String, Value),
    /// SQL `LIKE` with `%` and `_` wildcards.
    Like(String, String),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like(column.into(), pattern.into())
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In(column.into(), values)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull(column.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, other) => Predicate::And(vec![p, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(vec![self, other])
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

/// Offset/limit window over the plan's result rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Window {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Window {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// Apply the window to an in-memory sequence.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum JoinKind {
    /// Keep parents without a match (joined columns are NULL).
    #[default]
    Left,
    /// Drop parents without a match.
    Inner,
}

/// One join in a plan.
///
/// The join condition is resolved from metadata by the planner, so stores
/// only compare `parent.<parent_column>` with `target.<target_column>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinSpec {
    /// Dotted path from the root (`"classes.persons"`); also the column prefix.
    pub path: String,
    /// Path of the joined-from entity; empty for the root.
    pub parent_path: String,
    pub relationship: &'static str,
    pub target: EntityType,
    pub parent_column: &'static str,
    pub target_column: &'static str,
    pub collection: bool,
    pub kind: JoinKind,
    /// Fetch joins return the target's columns; filter-only joins do not.
    pub fetch: bool,
}

/// Structured read request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub entity: EntityType,
    pub predicate: Predicate,
    pub joins: Vec<JoinSpec>,
    /// Collapse duplicate result rows (set when filter-only joins multiply rows).
    pub distinct: bool,
    pub window: Option<Window>,
}

impl QueryPlan {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            predicate: Predicate::All,
            joins: Vec::new(),
            distinct: false,
            window: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    pub fn has_collection_fetch(&self) -> bool {
        self.joins.iter().any(|j| j.fetch && j.collection)
    }
}

// ============================================================================
// Writes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
        })
    }
}

/// One row-level write.
///
/// Inserts carry every column, updates only the changed columns, deletes none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub entity: EntityType,
    pub id: Value,
    pub columns: Vec<(String, Value)>,
}

impl WriteOp {
    pub fn changed_fields(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}#{}", self.kind, self.entity, self.id)?;
        if !self.columns.is_empty() {
            write!(f, " [{}]", self.changed_fields().join(", "))?;
        }
        Ok(())
    }
}

/// Ordered list of writes produced by one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    pub fn new(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn count(&self, kind: WriteKind) -> usize {
        self.ops.iter().filter(|op| op.kind == kind).count()
    }

    pub fn of_kind(&self, kind: WriteKind) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter().filter(move |op| op.kind == kind)
    }

    /// Position of the write for `(entity, id)` of the given kind.
    pub fn position(&self, kind: WriteKind, entity: EntityType, id: &Value) -> Option<usize> {
        self.ops
            .iter()
            .position(|op| op.kind == kind && op.entity == entity && op.id.same_identity(id))
    }
}

impl IntoIterator for WriteSet {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// The backing relational store.
///
/// `execute` must apply a write set atomically: either every write succeeds
/// or none is visible. A write that finds its row missing reports
/// [`Error::StaleWrite`].
pub trait Store: Send + Sync {
    /// Apply an ordered write set.
    fn execute(
        &self,
        cx: &Cx,
        writes: &WriteSet,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Run a read plan and return rows in the flat join layout.
    fn query(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Highest identity currently stored for `entity`.
    ///
    /// Sessions use it to seed generated identities before the first
    /// persist, so it must answer without I/O. Stores that cannot keep the
    /// default and need an identity generator that knows their sequences.
    fn max_identity(&self, _entity: EntityType) -> Option<Value> {
        None
    }

    /// Start a transaction. Stores without transactions can keep the default.
    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    /// Make the current transaction's writes durable.
    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    /// Discard the current transaction's writes.
    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}
