//! Flush operation ordering for the persistence context.
//!
//! A flush produces one [`WriteSet`] ordered so that foreign keys are valid
//! after every single write:
//! - INSERT parent-first (a referenced row before the rows referencing it)
//! - UPDATE in registration order
//! - DELETE child-first (a referencing row before the row it references)
//!
//! Within each category the order is a stable topological sort over the
//! owning-edge references among the rows of the same category.

use crate::ObjectKey;
use persistkit_core::{CycleError, EntityType, Error, Result, WriteKind, WriteOp, WriteSet};
use serde::Serialize;
use std::collections::BTreeSet;

/// A write waiting to be ordered.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub op: WriteOp,
    pub key: ObjectKey,
    /// Rows this row points at through its owning foreign keys.
    pub references: Vec<ObjectKey>,
}

impl PendingWrite {
    pub fn new(op: WriteOp, key: ObjectKey) -> Self {
        Self {
            op,
            key,
            references: Vec::new(),
        }
    }

    pub fn references(mut self, references: Vec<ObjectKey>) -> Self {
        self.references = references;
        self
    }

    pub fn kind(&self) -> WriteKind {
        self.op.kind
    }

    pub fn entity(&self) -> EntityType {
        self.key.entity()
    }
}

/// Orders pending writes into a write set.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    inserts: Vec<PendingWrite>,
    updates: Vec<PendingWrite>,
    deletes: Vec<PendingWrite>,
}

impl FlushOrderer {
    /// Create a new flush orderer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: PendingWrite) {
        match write.kind() {
            WriteKind::Insert => self.inserts.push(write),
            WriteKind::Update => self.updates.push(write),
            WriteKind::Delete => self.deletes.push(write),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Produce the ordered write set.
    ///
    /// Fails with [`Error::Cycle`] when inserts or deletes reference each
    /// other in a cycle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn order(self) -> Result<WriteSet> {
        tracing::debug!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Ordering flush writes"
        );
        let mut ops = Vec::with_capacity(self.len());
        ops.extend(topo_sort(self.inserts, false)?);
        ops.extend(self.updates.into_iter().map(|w| w.op));
        ops.extend(topo_sort(self.deletes, true)?);
        Ok(WriteSet::new(ops))
    }
}

/// Stable Kahn sort. Ties are broken by original position.
///
/// With `referencing_first` a row precedes the rows it references (deletes);
/// otherwise it follows them (inserts).
fn topo_sort(writes: Vec<PendingWrite>, referencing_first: bool) -> Result<Vec<WriteOp>> {
    let n = writes.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0_usize; n];

    for (i, write) in writes.iter().enumerate() {
        for reference in &write.references {
            let Some(j) = writes.iter().position(|w| &w.key == reference) else {
                continue;
            };
            if i == j {
                continue;
            }
            let (before, after) = if referencing_first { (i, j) } else { (j, i) };
            if !successors[before].contains(&after) {
                successors[before].push(after);
                indegree[after] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &succ in &successors[next] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() < n {
        let mut entities: Vec<EntityType> = (0..n)
            .filter(|i| indegree[*i] > 0)
            .map(|i| writes[i].entity())
            .collect();
        entities.dedup();
        tracing::warn!(entities = ?entities, "Write set contains a reference cycle");
        return Err(Error::Cycle(CycleError { entities }));
    }

    let mut slots: Vec<Option<WriteOp>> = writes.into_iter().map(|w| Some(w.op)).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// The write set sent to the store.
    pub writes: WriteSet,
}

impl FlushResult {
    pub fn new(writes: WriteSet) -> Self {
        Self {
            inserted: writes.count(WriteKind::Insert),
            updated: writes.count(WriteKind::Update),
            deleted: writes.count(WriteKind::Delete),
            writes,
        }
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
