//! Identity Map pattern for tracking unique entity instances per identity.
//!
//! The Identity Map ensures that each store row corresponds to exactly one
//! in-memory instance within a unit of work:
//!
//! - **Uniqueness**: the same (entity type, identity) always yields the same `EntityRef`
//! - **Cache**: identity lookups are answered without a store round trip
//! - **Consistency**: a second load of a row returns the existing instance,
//!   even if the row changed in the store meanwhile
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = ObjectKey::new("person", Value::BigInt(1));
//! map.put(key.clone(), person.clone());
//!
//! let again = map.get(&key).unwrap();
//! assert!(again.ptr_eq(&person));
//! ```

use crate::ObjectKey;
use persistkit_core::{EntityRef, EntityType};
use std::collections::HashMap;

struct IdentityEntry {
    entity: EntityRef,
    /// Registration order, used to keep flushes deterministic.
    seq: u64,
}

/// Identity Map for tracking unique entity instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, IdentityEntry>,
    next_seq: u64,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the instance registered under `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<&EntityRef> {
        self.entries.get(key).map(|entry| &entry.entity)
    }

    /// Register `entity` under `key`, returning the instance previously there.
    ///
    /// Re-registering the same instance keeps its original position.
    pub fn put(&mut self, key: ObjectKey, entity: EntityRef) -> Option<EntityRef> {
        if let Some(existing) = self.entries.get_mut(&key) {
            let previous = std::mem::replace(&mut existing.entity, entity);
            return Some(previous);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, IdentityEntry { entity, seq });
        None
    }

    /// Remove the entry for `key`.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<EntityRef> {
        self.entries.remove(key).map(|entry| entry.entity)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Is this exact instance the one registered under `key`?
    pub fn holds(&self, key: &ObjectKey, entity: &EntityRef) -> bool {
        self.get(key).is_some_and(|e| e.ptr_eq(entity))
    }

    /// All entries in registration order.
    pub fn entries(&self) -> Vec<(ObjectKey, EntityRef)> {
        let mut entries: Vec<(&ObjectKey, &IdentityEntry)> = self.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(key, entry)| (key.clone(), entry.entity.clone()))
            .collect()
    }

    /// Entries of one entity type, in registration order.
    pub fn entries_of(&self, entity: EntityType) -> Vec<(ObjectKey, EntityRef)> {
        self.entries()
            .into_iter()
            .filter(|(key, _)| key.entity() == entity)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning them in registration order.
    pub fn drain(&mut self) -> Vec<(ObjectKey, EntityRef)> {
        let entries = self.entries();
        self.entries.clear();
        entries
    }
}
