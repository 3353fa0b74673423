//! Unit of Work pattern implementation.
//!
//! The unit of work is the synchronous bookkeeping half of a session. It
//! owns the identity map and the change tracker and knows which entities are
//! waiting to be inserted or deleted. It never talks to the store: the
//! session drives it through the flush protocol
//!
//! 1. [`UnitOfWork::cascade_persist_all`]
//! 2. [`UnitOfWork::orphan_candidates`] / [`UnitOfWork::schedule_remove`]
//! 3. [`UnitOfWork::check_transient_references`]
//! 4. [`UnitOfWork::prepare_flush`], store execution, then
//!    [`UnitOfWork::complete_flush`]
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, Arc::new(SequenceGenerator::new()));
//! uow.persist(&class)?;
//! let prepared = uow.prepare_flush()?;
//! store.execute(&cx, &prepared.writes).await;
//! uow.complete_flush(prepared);
//! ```

use crate::ObjectKey;
use crate::cascade;
use crate::change_tracker::{ChangeTracker, ColumnValues, capture_columns};
use crate::flush::{FlushOrderer, PendingWrite};
use crate::generator::IdentityGenerator;
use crate::identity_map::IdentityMap;
use persistkit_core::{
    EntityMetadata, EntityRef, EntityState, EntityType, Error, IdentityStrategy,
    IllegalStateError, MetadataRegistry, NotManagedError, Relation, Result,
    TransientReferenceError, Value, WriteKind, WriteOp, WriteSet,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks and manages all pending changes of one persistence context.
pub struct UnitOfWork {
    pub(crate) registry: Arc<MetadataRegistry>,
    pub(crate) identity_map: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    /// Managed entities whose row does not exist in the store yet.
    pending_inserts: Vec<ObjectKey>,
    /// Removed entities whose row still exists in the store.
    pending_deletes: Vec<ObjectKey>,
    pub(crate) generator: Arc<dyn IdentityGenerator>,
}

/// A write set computed from the current state, plus the snapshots to
/// install once the store accepted it.
#[derive(Debug)]
pub struct PreparedFlush {
    pub writes: WriteSet,
    snapshots: Vec<(ObjectKey, ColumnValues)>,
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// The identity map key of `entity`, if it has an identity.
pub fn key_of(entity: &EntityRef) -> Option<ObjectKey> {
    let guard = entity.read();
    guard
        .id()
        .map(|id| ObjectKey::new(guard.entity_type(), id.clone()))
}

pub(crate) fn not_managed(operation: &'static str, entity: &EntityRef) -> Error {
    let guard = entity.read();
    Error::NotManaged(NotManagedError {
        operation,
        entity: guard.entity_type(),
        id: guard.id().cloned(),
        state: guard.state(),
    })
}

pub(crate) fn illegal_state(
    operation: &'static str,
    entity: EntityType,
    id: Option<Value>,
    message: impl Into<String>,
) -> Error {
    Error::IllegalState(IllegalStateError {
        operation,
        entity,
        id,
        message: message.into(),
    })
}

/// Foreign keys in `columns` that point at another row.
fn references(meta: &EntityMetadata, columns: &ColumnValues) -> Vec<ObjectKey> {
    meta.owning_edges()
        .filter_map(|(edge, fk)| {
            columns
                .get(fk)
                .filter(|v| !v.is_null())
                .map(|v| ObjectKey::new(edge.target, v.clone()))
        })
        .collect()
}

/// Resolved members of every orphan-removal relationship of `entity`.
fn orphan_baselines(
    entity: &EntityRef,
    meta: &EntityMetadata,
) -> Vec<(&'static str, Vec<EntityRef>)> {
    let guard = entity.read();
    meta.relationships
        .iter()
        .filter(|edge| edge.orphan_removal)
        .filter_map(|edge| {
            guard
                .relation(edge.name)
                .and_then(Relation::targets)
                .map(|targets| (edge.name, targets))
        })
        .collect()
}

impl UnitOfWork {
    pub fn new(registry: Arc<MetadataRegistry>, generator: Arc<dyn IdentityGenerator>) -> Self {
        Self {
            registry,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            pending_inserts: Vec::new(),
            pending_deletes: Vec::new(),
            generator,
        }
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Is this exact instance registered in the identity map?
    pub fn holds(&self, entity: &EntityRef) -> bool {
        key_of(entity).is_some_and(|key| self.identity_map.holds(&key, entity))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<EntityRef> {
        self.identity_map.get(key).cloned()
    }

    fn managed_entities(&self) -> Vec<(ObjectKey, EntityRef)> {
        self.identity_map
            .entries()
            .into_iter()
            .filter(|(_, entity)| entity.state() == EntityState::Managed)
            .collect()
    }

    /// Snapshot columns and orphan-removal memberships of a managed entity.
    pub(crate) fn take_snapshot(&mut self, key: &ObjectKey, entity: &EntityRef) -> Result<()> {
        let meta = self.registry.get(key.entity())?;
        self.tracker.snapshot(key.clone(), capture_columns(entity, meta));
        for (relationship, members) in orphan_baselines(entity, meta) {
            self.tracker.record_membership(key, relationship, members);
        }
        Ok(())
    }

    /// Record the synchronized members of `relationship` when it removes orphans.
    pub(crate) fn record_baseline(
        &mut self,
        owner: &EntityRef,
        relationship: &str,
        members: Vec<EntityRef>,
    ) {
        let Some(key) = key_of(owner) else {
            return;
        };
        let Ok(edge) = self.registry.edge(key.entity(), relationship) else {
            return;
        };
        if edge.orphan_removal {
            let name = edge.name;
            self.tracker.record_membership(&key, name, members);
        }
    }

    // ========================================================================
    // Persist
    // ========================================================================

    /// Make `entity` managed and cascade persist through its resolved relations.
    ///
    /// Returns every entity that became managed, root first.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<Vec<EntityRef>> {
        let mut persisted = Vec::new();
        if self.persist_one(entity, "persist")? {
            persisted.push(entity.clone());
        }
        for reached in cascade::collect_persist(&self.registry, std::slice::from_ref(entity))? {
            if self.persist_one(&reached, "persist")? {
                persisted.push(reached);
            }
        }
        Ok(persisted)
    }

    /// Returns false when the entity already is managed by this unit of work.
    fn persist_one(&mut self, entity: &EntityRef, operation: &'static str) -> Result<bool> {
        let (entity_type, state, id) = {
            let guard = entity.read();
            (guard.entity_type(), guard.state(), guard.id().cloned())
        };
        let held = self.holds(entity);
        match state {
            EntityState::Managed if held => return Ok(false),
            EntityState::Managed => {
                return Err(illegal_state(
                    operation,
                    entity_type,
                    id,
                    "entity is managed by another unit of work",
                ));
            }
            EntityState::Detached => {
                return Err(illegal_state(
                    operation,
                    entity_type,
                    id,
                    "detached entity passed to persist; use merge",
                ));
            }
            EntityState::Removed if held => {
                return Err(illegal_state(
                    operation,
                    entity_type,
                    id,
                    "entity is scheduled for removal",
                ));
            }
            // A removed entity whose delete was flushed is new again.
            EntityState::Removed | EntityState::Transient => {}
        }

        let meta = self.registry.get(entity_type)?;
        let id = match id {
            Some(id) => {
                self.generator.observe(entity_type, &id);
                id
            }
            None => match meta.identity.strategy {
                IdentityStrategy::Generated => self.generator.next_id(entity_type),
                IdentityStrategy::Assigned => {
                    return Err(illegal_state(
                        operation,
                        entity_type,
                        None,
                        format!(
                            "identity '{}' must be assigned before persist",
                            meta.identity.field
                        ),
                    ));
                }
            },
        };

        let key = ObjectKey::new(entity_type, id.clone());
        if self.identity_map.contains(&key) {
            return Err(illegal_state(
                operation,
                entity_type,
                Some(id),
                "a different instance with the same identity is already managed",
            ));
        }

        {
            let mut guard = entity.write();
            guard.set_id(id);
            guard.set_state(EntityState::Managed);
        }
        self.identity_map.put(key.clone(), entity.clone());
        self.pending_inserts.push(key.clone());
        self.take_snapshot(&key, entity)?;
        tracing::debug!(entity = entity_type, id = %key.id(), "Entity persisted");
        Ok(true)
    }

    /// Persist every transient entity reachable through persist cascades
    /// from the managed entities.
    pub fn cascade_persist_all(&mut self) -> Result<usize> {
        let roots: Vec<EntityRef> = self
            .managed_entities()
            .into_iter()
            .map(|(_, entity)| entity)
            .collect();
        let mut count = 0;
        for entity in cascade::collect_persist(&self.registry, &roots)? {
            if self.persist_one(&entity, "flush")? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Register an entity materialized from a store row.
    pub(crate) fn register_loaded(&mut self, key: ObjectKey, entity: EntityRef) -> Result<()> {
        self.generator.observe(key.entity(), key.id());
        self.identity_map.put(key.clone(), entity.clone());
        self.take_snapshot(&key, &entity)
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Managed entities that left an orphan-removal relationship since the
    /// last synchronization.
    pub fn orphan_candidates(&self) -> Result<Vec<EntityRef>> {
        let mut seen = HashSet::new();
        let mut orphans = Vec::new();
        for (key, entity) in self.managed_entities() {
            let meta = self.registry.get(key.entity())?;
            for edge in meta.relationships.iter().filter(|e| e.orphan_removal) {
                let Some(current) = entity.read().relation(edge.name).and_then(Relation::targets)
                else {
                    continue;
                };
                for orphan in self.tracker.orphans(&key, edge.name, &current) {
                    if orphan.state() == EntityState::Managed && seen.insert(orphan.instance_id()) {
                        orphans.push(orphan);
                    }
                }
            }
        }
        if !orphans.is_empty() {
            tracing::debug!(count = orphans.len(), "Orphaned entities detected");
        }
        Ok(orphans)
    }

    /// Mark entities removed, in the given order.
    ///
    /// An entity whose insert is still pending leaves the unit of work
    /// immediately and no write is produced for it.
    pub fn schedule_remove(&mut self, entities: &[EntityRef]) {
        for entity in entities {
            let Some(key) = key_of(entity) else {
                continue;
            };
            if !self.identity_map.holds(&key, entity) {
                continue;
            }
            entity.write().set_state(EntityState::Removed);
            if let Some(pos) = self.pending_inserts.iter().position(|k| *k == key) {
                self.pending_inserts.remove(pos);
                self.identity_map.remove(&key);
                self.tracker.forget(&key);
                tracing::debug!(entity = key.entity(), id = %key.id(), "Pending insert cancelled");
                continue;
            }
            if !self.pending_deletes.contains(&key) {
                tracing::debug!(entity = key.entity(), id = %key.id(), "Entity scheduled for removal");
                self.pending_deletes.push(key);
            }
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Fail if a managed entity references an entity that will not be saved.
    pub fn check_transient_references(&self) -> Result<()> {
        for (key, entity) in self.managed_entities() {
            let meta = self.registry.get(key.entity())?;
            for (edge, _) in meta.owning_edges() {
                let Some(target) = entity.read().reference(edge.name) else {
                    continue;
                };
                if target.state() == EntityState::Transient {
                    return Err(Error::TransientReference(TransientReferenceError {
                        entity: key.entity(),
                        id: Some(key.id().clone()),
                        relationship: edge.name.to_string(),
                        target: edge.target,
                    }));
                }
            }
        }
        Ok(())
    }

    /// Compute the ordered write set for the current state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare_flush(&self) -> Result<PreparedFlush> {
        let mut orderer = FlushOrderer::new();
        let mut snapshots = Vec::new();
        let inserting: HashSet<&ObjectKey> = self.pending_inserts.iter().collect();

        for key in &self.pending_inserts {
            let Some(entity) = self.identity_map.get(key) else {
                continue;
            };
            let meta = self.registry.get(key.entity())?;
            let current = capture_columns(entity, meta);
            let columns = meta
                .column_names()
                .into_iter()
                .map(|name| {
                    let value = if name == meta.identity.field {
                        key.id().clone()
                    } else {
                        current.get(name).cloned().unwrap_or(Value::Null)
                    };
                    (name.to_string(), value)
                })
                .collect();
            let op = WriteOp {
                kind: WriteKind::Insert,
                entity: key.entity(),
                id: key.id().clone(),
                columns,
            };
            orderer.push(PendingWrite::new(op, key.clone()).references(references(meta, &current)));
            snapshots.push((key.clone(), current));
        }

        for (key, entity) in self.managed_entities() {
            if inserting.contains(&key) {
                continue;
            }
            let meta = self.registry.get(key.entity())?;
            let current = capture_columns(&entity, meta);
            let changed = self.tracker.changed_columns(&key, &current);
            if changed.is_empty() {
                continue;
            }
            tracing::trace!(entity = key.entity(), id = %key.id(), changed = ?changed, "Dirty entity");
            let columns = changed
                .into_iter()
                .map(|name| {
                    let value = current.get(&name).cloned().unwrap_or(Value::Null);
                    (name, value)
                })
                .collect();
            let op = WriteOp {
                kind: WriteKind::Update,
                entity: key.entity(),
                id: key.id().clone(),
                columns,
            };
            orderer.push(PendingWrite::new(op, key.clone()).references(references(meta, &current)));
            snapshots.push((key, current));
        }

        for key in &self.pending_deletes {
            let meta = self.registry.get(key.entity())?;
            let baseline = self
                .tracker
                .get(key)
                .map(|snapshot| references(meta, snapshot.columns()))
                .unwrap_or_default();
            let op = WriteOp {
                kind: WriteKind::Delete,
                entity: key.entity(),
                id: key.id().clone(),
                columns: Vec::new(),
            };
            orderer.push(PendingWrite::new(op, key.clone()).references(baseline));
        }

        let writes = orderer.order()?;
        Ok(PreparedFlush { writes, snapshots })
    }

    /// Install the state the store now holds: new snapshots and membership
    /// baselines, deleted entities purged from the identity map.
    pub fn complete_flush(&mut self, prepared: PreparedFlush) {
        for (key, columns) in prepared.snapshots {
            self.tracker.snapshot(key, columns);
        }
        self.pending_inserts.clear();
        for key in std::mem::take(&mut self.pending_deletes) {
            self.tracker.forget(&key);
            self.identity_map.remove(&key);
        }
        self.refresh_baselines();
    }

    fn refresh_baselines(&mut self) {
        for (key, entity) in self.managed_entities() {
            let Ok(meta) = self.registry.get(key.entity()) else {
                continue;
            };
            for (relationship, members) in orphan_baselines(&entity, meta) {
                self.tracker.record_membership(&key, relationship, members);
            }
        }
    }

    /// Does anything pending touch one of `types`?
    pub fn has_changes_for(&self, types: &[EntityType]) -> bool {
        let touches = |key: &ObjectKey| types.contains(&key.entity());
        if self.pending_inserts.iter().any(touches) || self.pending_deletes.iter().any(touches) {
            return true;
        }
        self.managed_entities().into_iter().any(|(key, entity)| {
            touches(&key)
                && self
                    .registry
                    .get(key.entity())
                    .is_ok_and(|meta| self.tracker.is_dirty(&key, &capture_columns(&entity, meta)))
        })
    }

    /// Count pending operations (dirty entities are counted by comparing snapshots).
    pub fn pending_counts(&self) -> PendingCounts {
        let inserting: HashSet<&ObjectKey> = self.pending_inserts.iter().collect();
        let dirty = self
            .managed_entities()
            .into_iter()
            .filter(|(key, _)| !inserting.contains(key))
            .filter(|(key, entity)| {
                self.registry
                    .get(key.entity())
                    .is_ok_and(|meta| self.tracker.is_dirty(key, &capture_columns(entity, meta)))
            })
            .count();
        PendingCounts {
            new: self.pending_inserts.len(),
            dirty,
            deleted: self.pending_deletes.len(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.pending_counts().is_empty()
    }

    // ========================================================================
    // Rollback / detach / clear
    // ========================================================================

    /// Drop pending work after a rolled-back transaction.
    ///
    /// Never-written inserts become detached, removed entities become managed
    /// again, and every snapshot is re-taken from the in-memory values.
    pub fn discard_pending(&mut self) -> Result<()> {
        for key in std::mem::take(&mut self.pending_inserts) {
            if let Some(entity) = self.identity_map.remove(&key) {
                entity.write().set_state(EntityState::Detached);
            }
            self.tracker.forget(&key);
        }
        for key in std::mem::take(&mut self.pending_deletes) {
            if let Some(entity) = self.identity_map.get(&key) {
                entity.write().set_state(EntityState::Managed);
            }
        }
        for (key, entity) in self.managed_entities() {
            self.take_snapshot(&key, &entity)?;
        }
        Ok(())
    }

    /// Stop tracking `entity`. Pending writes for it are dropped.
    pub fn detach(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(key) = key_of(entity).filter(|key| self.identity_map.holds(key, entity)) else {
            return Err(not_managed("detach", entity));
        };
        self.identity_map.remove(&key);
        self.tracker.forget(&key);
        self.pending_inserts.retain(|k| *k != key);
        self.pending_deletes.retain(|k| *k != key);
        entity.write().set_state(EntityState::Detached);
        tracing::debug!(entity = key.entity(), id = %key.id(), "Entity detached");
        Ok(())
    }

    /// Detach everything.
    pub fn clear(&mut self) -> usize {
        let entries = self.identity_map.drain();
        for (_, entity) in &entries {
            entity.write().set_state(EntityState::Detached);
        }
        self.tracker.clear();
        self.pending_inserts.clear();
        self.pending_deletes.clear();
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::SequenceGenerator;
    use persistkit_core::{CascadeSet, Entity, FieldInfo, RelationshipEdge};

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::builder()
                .entity(
                    EntityMetadata::new("school_class")
                        .field(FieldInfo::new("name"))
                        .relationship(
                            RelationshipEdge::one_to_many("persons", "person")
                                .mapped_by("my_class")
                                .cascade(CascadeSet::PERSIST)
                                .orphan_removal(true),
                        ),
                )
                .entity(
                    EntityMetadata::new("person")
                        .field(FieldInfo::new("name"))
                        .relationship(
                            RelationshipEdge::many_to_one("my_class", "school_class")
                                .join_column("class_id"),
                        ),
                )
                .entity(
                    EntityMetadata::new("badge")
                        .identity("code", IdentityStrategy::Assigned)
                        .field(FieldInfo::new("label")),
                )
                .build()
                .unwrap(),
        )
    }

    fn uow() -> UnitOfWork {
        UnitOfWork::new(registry(), Arc::new(SequenceGenerator::new()))
    }

    fn class_with_persons(names: &[&str]) -> (EntityRef, Vec<EntityRef>) {
        let class = Entity::new("school_class").with("name", "1a").into_ref();
        let persons: Vec<EntityRef> = names
            .iter()
            .map(|name| Entity::new("person").with("name", *name).into_ref())
            .collect();
        for person in &persons {
            person.write().set_reference("my_class", Some(class.clone()));
            class.write().push_related("persons", person.clone());
        }
        (class, persons)
    }

    fn render(set: &WriteSet) -> Vec<String> {
        set.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_persist_cascades_and_orders_parent_first() {
        let mut uow = uow();
        let (class, persons) = class_with_persons(&["a", "b"]);
        let persisted = uow.persist(&class).unwrap();
        assert_eq!(persisted.len(), 3);
        assert!(persons.iter().all(|p| p.state() == EntityState::Managed));

        let prepared = uow.prepare_flush().unwrap();
        assert_eq!(
            render(&prepared.writes),
            vec![
                "INSERT school_class#1 [id, name]",
                "INSERT person#1 [id, name, class_id]",
                "INSERT person#2 [id, name, class_id]"
            ]
        );
        assert_eq!(
            prepared.writes.ops()[1].column("class_id"),
            Some(&Value::BigInt(1))
        );
    }

    #[test]
    fn test_persist_rejects_detached_and_duplicates() {
        let mut uow = uow();
        let detached = Entity::new("person").with_id(1_i64).into_ref();
        detached.write().set_state(EntityState::Detached);
        assert!(matches!(uow.persist(&detached), Err(Error::IllegalState(_))));

        let first = Entity::new("person").with_id(5_i64).into_ref();
        let second = Entity::new("person").with_id(5_i64).into_ref();
        uow.persist(&first).unwrap();
        assert!(uow.persist(&first).unwrap().is_empty());
        assert!(matches!(uow.persist(&second), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_assigned_identity_required() {
        let mut uow = uow();
        let badge = Entity::new("badge").with("label", "x").into_ref();
        match uow.persist(&badge) {
            Err(Error::IllegalState(e)) => assert!(e.message.contains("code")),
            other => panic!("expected illegal state, got {other:?}"),
        }
        let badge = Entity::new("badge").with_id("gold").into_ref();
        uow.persist(&badge).unwrap();
        assert_eq!(badge.id(), Some(Value::Text("gold".into())));
    }

    #[test]
    fn test_update_only_changed_columns() {
        let mut uow = uow();
        let (class, _) = class_with_persons(&["a"]);
        uow.persist(&class).unwrap();
        let prepared = uow.prepare_flush().unwrap();
        uow.complete_flush(prepared);
        assert!(!uow.has_changes());

        class.set("name", "1b");
        assert!(uow.has_changes_for(&["school_class"]));
        assert!(!uow.has_changes_for(&["person"]));
        let prepared = uow.prepare_flush().unwrap();
        assert_eq!(render(&prepared.writes), vec!["UPDATE school_class#1 [name]"]);
    }

    #[test]
    fn test_orphan_candidates_after_unlink() {
        let mut uow = uow();
        let (class, persons) = class_with_persons(&["a", "b"]);
        uow.persist(&class).unwrap();
        let prepared = uow.prepare_flush().unwrap();
        uow.complete_flush(prepared);

        class.write().remove_related("persons", &persons[0]);
        let orphans = uow.orphan_candidates().unwrap();
        assert_eq!(orphans, vec![persons[0].clone()]);

        uow.schedule_remove(&orphans);
        assert_eq!(persons[0].state(), EntityState::Removed);
        assert!(uow.orphan_candidates().unwrap().is_empty());
        let prepared = uow.prepare_flush().unwrap();
        assert_eq!(render(&prepared.writes), vec!["DELETE person#1"]);
        uow.complete_flush(prepared);
        assert!(!uow.holds(&persons[0]));
    }

    #[test]
    fn test_removing_pending_insert_cancels_it() {
        let mut uow = uow();
        let person = Entity::new("person").with("name", "a").into_ref();
        uow.persist(&person).unwrap();
        uow.schedule_remove(std::slice::from_ref(&person));
        assert!(uow.prepare_flush().unwrap().writes.is_empty());
        assert_eq!(person.state(), EntityState::Removed);
        assert!(!uow.holds(&person));
    }

    #[test]
    fn test_transient_reference_check() {
        let mut uow = uow();
        let person = Entity::new("person").with("name", "a").into_ref();
        uow.persist(&person).unwrap();
        let class = Entity::new("school_class").into_ref();
        person.write().set_reference("my_class", Some(class));
        match uow.check_transient_references() {
            Err(Error::TransientReference(e)) => {
                assert_eq!(e.relationship, "my_class");
                assert_eq!(e.target, "school_class");
            }
            other => panic!("expected transient reference error, got {other:?}"),
        }
    }

    #[test]
    fn test_detach_drops_pending_insert() {
        let mut uow = uow();
        let person = Entity::new("person").with("name", "a").into_ref();
        uow.persist(&person).unwrap();
        uow.detach(&person).unwrap();
        assert_eq!(person.state(), EntityState::Detached);
        assert!(uow.prepare_flush().unwrap().writes.is_empty());
        assert!(uow.detach(&person).unwrap_err().is_not_managed());
    }

    #[test]
    fn test_discard_pending() {
        let mut uow = uow();
        let (class, persons) = class_with_persons(&["a"]);
        uow.persist(&class).unwrap();
        let prepared = uow.prepare_flush().unwrap();
        uow.complete_flush(prepared);

        let fresh = Entity::new("person").with("name", "new").into_ref();
        uow.persist(&fresh).unwrap();
        uow.schedule_remove(std::slice::from_ref(&persons[0]));
        class.set("name", "changed");

        uow.discard_pending().unwrap();
        assert_eq!(fresh.state(), EntityState::Detached);
        assert_eq!(persons[0].state(), EntityState::Managed);
        assert_eq!(class.get("name"), Some(Value::Text("changed".into())));
        assert!(!uow.has_changes());
    }

    #[test]
    fn test_clear_detaches_everything() {
        let mut uow = uow();
        let (class, persons) = class_with_persons(&["a", "b"]);
        uow.persist(&class).unwrap();
        assert_eq!(uow.clear(), 3);
        assert_eq!(class.state(), EntityState::Detached);
        assert!(persons.iter().all(|p| p.state() == EntityState::Detached));
        assert!(uow.identity_map().is_empty());
    }
}
