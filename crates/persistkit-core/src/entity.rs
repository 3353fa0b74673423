//! Dynamic entity instances.
//!
//! An [`Entity`] is one in-memory row: a type tag, a nullable identity, the
//! scalar field values and the relationship slots. Instances are shared
//! between application code and the session through [`EntityRef`]; identity
//! equality is pointer equality of the shared handle.

use crate::lazy::{LazyHandle, Resolved};
use crate::metadata::EntityType;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of an entity with respect to a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not yet known to any session.
    #[default]
    Transient,
    /// Tracked by a session: in its identity map and dirty-checked at flush.
    Managed,
    /// Was managed; no longer tracked. Mutations are invisible to flushes.
    Detached,
    /// Scheduled for deletion at the next flush.
    Removed,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Transient => "transient",
            EntityState::Managed => "managed",
            EntityState::Detached => "detached",
            EntityState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Value of a relationship slot.
#[derive(Debug, Clone)]
pub enum Relation {
    /// In-memory reference or collection.
    Resolved(Resolved),
    /// Not fetched yet; resolved through the session.
    Lazy(LazyHandle),
}

impl Relation {
    pub fn one(target: Option<EntityRef>) -> Self {
        Relation::Resolved(Resolved::One(target))
    }

    pub fn many(targets: Vec<EntityRef>) -> Self {
        Relation::Resolved(Resolved::Many(targets))
    }

    /// The in-memory value, if this relation needs no store access.
    pub fn resolved(&self) -> Option<&Resolved> {
        match self {
            Relation::Resolved(value) => Some(value),
            Relation::Lazy(handle) => handle.loaded(),
        }
    }

    pub fn resolved_mut(&mut self) -> Option<&mut Resolved> {
        match self {
            Relation::Resolved(value) => Some(value),
            Relation::Lazy(handle) => handle.loaded_mut(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved().is_some()
    }

    /// Resolved targets, or `None` while unresolved.
    pub fn targets(&self) -> Option<Vec<EntityRef>> {
        self.resolved().map(Resolved::entities)
    }

    /// Fill an unloaded lazy handle with a value fetched elsewhere.
    ///
    /// Returns false, leaving the slot untouched, when it already holds an
    /// in-memory value.
    pub fn fill(&mut self, value: Resolved) -> bool {
        match self {
            Relation::Resolved(_) => false,
            Relation::Lazy(handle) => {
                if handle.is_loaded() {
                    false
                } else {
                    handle.complete(value);
                    true
                }
            }
        }
    }
}

/// One in-memory entity instance.
#[derive(Clone)]
pub struct Entity {
    entity_type: EntityType,
    id: Option<Value>,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Relation>,
    state: EntityState,
}

impl Entity {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            id: None,
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            state: EntityState::Transient,
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn with_relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    pub fn into_ref(self) -> EntityRef {
        EntityRef::new(self)
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref().filter(|id| !id.is_null())
    }

    /// Set the identity (internal use by the session at persist time).
    pub fn set_id(&mut self, id: Value) {
        self.id = Some(id);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a scalar field, returning the previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut Relation> {
        self.relations.get_mut(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &Relation)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn set_relation(&mut self, name: impl Into<String>, relation: Relation) -> Option<Relation> {
        self.relations.insert(name.into(), relation)
    }

    /// Point a to-one relationship at `target` (or clear it).
    pub fn set_reference(&mut self, name: impl Into<String>, target: Option<EntityRef>) {
        self.relations.insert(name.into(), Relation::one(target));
    }

    /// The resolved to-one target, `None` when unset, unresolved or null.
    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        match self.relations.get(name)?.resolved()? {
            Resolved::One(target) => target.clone(),
            Resolved::Many(_) => None,
        }
    }

    /// The resolved collection, `None` when unset or unresolved.
    pub fn collection(&self, name: &str) -> Option<Vec<EntityRef>> {
        match self.relations.get(name)?.resolved()? {
            Resolved::Many(targets) => Some(targets.clone()),
            Resolved::One(_) => None,
        }
    }

    /// Append to an in-memory collection, creating it when the slot is empty.
    ///
    /// Returns false if the slot holds an unresolved lazy handle or a to-one
    /// value. Adding an instance that is already a member is a no-op.
    pub fn push_related(&mut self, name: &str, target: EntityRef) -> bool {
        let relation = self
            .relations
            .entry(name.to_string())
            .or_insert_with(|| Relation::many(Vec::new()));
        match relation.resolved_mut() {
            Some(Resolved::Many(targets)) => {
                if !targets.iter().any(|t| t.ptr_eq(&target)) {
                    targets.push(target);
                }
                true
            }
            _ => false,
        }
    }

    /// Remove an instance from an in-memory collection. Returns true if it was a member.
    pub fn remove_related(&mut self, name: &str, target: &EntityRef) -> bool {
        match self.relations.get_mut(name).and_then(Relation::resolved_mut) {
            Some(Resolved::Many(targets)) => {
                let before = targets.len();
                targets.retain(|t| !t.ptr_eq(target));
                targets.len() != before
            }
            Some(Resolved::One(current)) => {
                if current.as_ref().is_some_and(|t| t.ptr_eq(target)) {
                    *current = None;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Set the lifecycle state (internal use by the session).
    pub fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }
}

impl fmt::Debug for Entity {
    // Relations can form cycles; only summarize them.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relations: BTreeMap<&str, String> = self
            .relations
            .iter()
            .map(|(name, relation)| {
                let summary = match relation {
                    Relation::Resolved(value) => format!("{value:?}"),
                    Relation::Lazy(handle) if handle.is_loaded() => "lazy(loaded)".to_string(),
                    Relation::Lazy(_) => "lazy".to_string(),
                };
                (name.as_str(), summary)
            })
            .collect();
        f.debug_struct("Entity")
            .field("type", &self.entity_type)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fields", &self.fields)
            .field("relations", &relations)
            .finish()
    }
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Same instance?
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based instance identity, stable while the instance is alive.
    pub fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn entity_type(&self) -> EntityType {
        self.read().entity_type()
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id().cloned()
    }

    pub fn state(&self) -> EntityState {
        self.read().state()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.read().get(field).cloned()
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.write().set(field, value)
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => match entity.id() {
                Some(id) => write!(f, "{}#{}", entity.entity_type(), id),
                None => write!(f, "{}@{:x}", entity.entity_type(), self.instance_id()),
            },
            Err(_) => write!(f, "EntityRef@{:x}", self.instance_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_accessors() {
        let person = Entity::new("person").with_id(3_i64).with("name", "kim");
        assert_eq!(person.entity_type(), "person");
        assert_eq!(person.id(), Some(&Value::BigInt(3)));
        assert_eq!(person.get("name"), Some(&Value::Text("kim".into())));
        assert_eq!(person.state(), EntityState::Transient);
    }

    #[test]
    fn test_null_id_is_unassigned() {
        let entity = Entity::new("person").with_id(Value::Null);
        assert!(entity.id().is_none());
    }

    #[test]
    fn test_collection_membership() {
        let class = Entity::new("school_class").into_ref();
        let a = Entity::new("person").into_ref();
        let b = Entity::new("person").into_ref();

        assert!(class.write().push_related("persons", a.clone()));
        assert!(class.write().push_related("persons", b.clone()));
        assert!(class.write().push_related("persons", a.clone()));
        assert_eq!(class.read().collection("persons").map(|c| c.len()), Some(2));

        assert!(class.write().remove_related("persons", &a));
        assert!(!class.write().remove_related("persons", &a));
        let remaining = class.read().collection("persons").unwrap_or_default();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn test_reference_slot() {
        let class = Entity::new("school_class").with_id(1_i64).into_ref();
        let mut person = Entity::new("person");
        assert!(person.reference("my_class").is_none());
        person.set_reference("my_class", Some(class.clone()));
        assert_eq!(person.reference("my_class"), Some(class.clone()));
        assert!(person.remove_related("my_class", &class));
        assert!(person.reference("my_class").is_none());
    }

    #[test]
    fn test_identity_equality_is_pointer_equality() {
        let a = Entity::new("person").with_id(1_i64).into_ref();
        let b = Entity::new("person").with_id(1_i64).into_ref();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(format!("{a:?}"), "person#1");
    }

    #[test]
    fn test_debug_does_not_follow_cycles() {
        let class = Entity::new("school_class").with_id(1_i64).into_ref();
        let person = Entity::new("person").with_id(2_i64).into_ref();
        class.write().push_related("persons", person.clone());
        person.write().set_reference("my_class", Some(class.clone()));
        let rendered = format!("{:?}", *class.read());
        assert!(rendered.contains("Many(len=1)"));
    }
}
