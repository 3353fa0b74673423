//! Change tracking and dirty detection for the persistence context.
//!
//! Every managed entity gets a snapshot of its persistent columns when it is
//! loaded, persisted or flushed. At flush the current columns are compared
//! against the snapshot, and only entities whose columns differ produce an
//! update, carrying only the changed columns.
//!
//! The tracker also keeps a baseline of collection memberships for
//! relationships with orphan removal, so members that disappeared from a
//! collection since it was last synchronized can be found.

use crate::ObjectKey;
use persistkit_core::{EntityMetadata, EntityRef, LazyTarget, Relation, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Persistent columns of one entity, by column name.
pub type ColumnValues = BTreeMap<String, Value>;

/// Snapshot of an object's persistent state at a point in time.
#[derive(Debug)]
pub struct ObjectSnapshot {
    columns: ColumnValues,
    memberships: BTreeMap<&'static str, Vec<EntityRef>>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    fn new(columns: ColumnValues) -> Self {
        Self {
            columns,
            memberships: BTreeMap::new(),
            taken_at: Instant::now(),
        }
    }

    pub fn columns(&self) -> &ColumnValues {
        &self.columns
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Read the persistent columns of `entity`: scalar fields and the foreign
/// keys of owning edges. The identity column is not included.
///
/// A foreign key comes from the referenced instance's identity when the
/// reference is in memory, or from the lazy handle when it was never loaded.
pub fn capture_columns(entity: &EntityRef, meta: &EntityMetadata) -> ColumnValues {
    enum Fk {
        Known(Value),
        Target(EntityRef),
    }

    // Targets are read after the owner's guard is released.
    let (mut columns, fks) = {
        let guard = entity.read();
        let columns: ColumnValues = meta
            .fields
            .iter()
            .map(|field| {
                let value = guard.get(field.name).cloned().unwrap_or(Value::Null);
                (field.name.to_string(), value)
            })
            .collect();
        let fks: Vec<(&'static str, Fk)> = meta
            .owning_edges()
            .map(|(edge, column)| {
                let fk = match guard.relation(edge.name) {
                    None => Fk::Known(Value::Null),
                    Some(Relation::Lazy(handle)) if !handle.is_loaded() => match handle.target() {
                        LazyTarget::Reference { id, .. } => Fk::Known(id.clone()),
                        LazyTarget::Inverse { .. } => Fk::Known(Value::Null),
                    },
                    Some(relation) => match relation.targets().and_then(|t| t.into_iter().next()) {
                        Some(target) => Fk::Target(target),
                        None => Fk::Known(Value::Null),
                    },
                };
                (column, fk)
            })
            .collect();
        (columns, fks)
    };

    for (column, fk) in fks {
        let value = match fk {
            Fk::Known(value) => value,
            Fk::Target(target) => target.id().unwrap_or(Value::Null),
        };
        columns.insert(column.to_string(), value);
    }
    columns
}

/// Tracks changes to objects in the session.
#[derive(Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `columns` as the synchronized state of `key`.
    ///
    /// Membership baselines survive a re-snapshot.
    #[tracing::instrument(level = "trace", skip(self, columns))]
    pub fn snapshot(&mut self, key: ObjectKey, columns: ColumnValues) {
        tracing::trace!(columns = columns.len(), "Taking object snapshot");
        match self.snapshots.get_mut(&key) {
            Some(existing) => {
                existing.columns = columns;
                existing.taken_at = Instant::now();
            }
            None => {
                self.snapshots.insert(key, ObjectSnapshot::new(columns));
            }
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Check if `current` differs from the snapshot.
    ///
    /// An object without a snapshot is dirty.
    pub fn is_dirty(&self, key: &ObjectKey, current: &ColumnValues) -> bool {
        let Some(snapshot) = self.snapshots.get(key) else {
            return true;
        };
        snapshot.columns != *current
    }

    /// Columns whose value differs from the snapshot, in column order.
    ///
    /// Without a snapshot every column counts as changed.
    #[tracing::instrument(level = "trace", skip(self, current))]
    pub fn changed_columns(&self, key: &ObjectKey, current: &ColumnValues) -> Vec<String> {
        let Some(snapshot) = self.snapshots.get(key) else {
            return current.keys().cloned().collect();
        };
        let changed: Vec<String> = current
            .iter()
            .filter(|(name, value)| snapshot.columns.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();
        tracing::trace!(changed = changed.len(), "Changed columns computed");
        changed
    }

    /// Record the synchronized members of an orphan-removal relationship.
    pub fn record_membership(
        &mut self,
        key: &ObjectKey,
        relationship: &'static str,
        members: Vec<EntityRef>,
    ) {
        if let Some(snapshot) = self.snapshots.get_mut(key) {
            snapshot.memberships.insert(relationship, members);
        }
    }

    /// The recorded members of `relationship`, if a baseline exists.
    pub fn membership(&self, key: &ObjectKey, relationship: &str) -> Option<&[EntityRef]> {
        self.snapshots
            .get(key)?
            .memberships
            .get(relationship)
            .map(Vec::as_slice)
    }

    /// Baseline members of `relationship` that are not in `current`.
    pub fn orphans(
        &self,
        key: &ObjectKey,
        relationship: &str,
        current: &[EntityRef],
    ) -> Vec<EntityRef> {
        self.membership(key, relationship)
            .map(|baseline| {
                baseline
                    .iter()
                    .filter(|member| !current.iter().any(|c| c.ptr_eq(member)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop tracking `key`.
    pub fn forget(&mut self, key: &ObjectKey) -> Option<ObjectSnapshot> {
        self.snapshots.remove(key)
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
