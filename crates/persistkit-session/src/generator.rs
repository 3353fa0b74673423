//! Identity generation for entities with a generated identity.
//!
//! Identities are assigned when an entity is persisted, before any write
//! reaches the store, so that children can reference a new parent in the
//! same flush. One generator is shared by every session a
//! [`SessionFactory`](crate::SessionFactory) opens.

use persistkit_core::{EntityType, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Produces fresh identity values.
pub trait IdentityGenerator: Send + Sync {
    fn next_id(&self, entity: EntityType) -> Value;

    /// Called with every identity the session sees that it did not generate
    /// (loaded rows, application-assigned identities).
    fn observe(&self, _entity: EntityType, _id: &Value) {}
}

/// Per-entity-type counter producing `BigInt` identities.
#[derive(Debug)]
pub struct SequenceGenerator {
    start: i64,
    next: Mutex<HashMap<EntityType, i64>>,
}

impl SequenceGenerator {
    /// Sequences start at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            start,
            next: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityGenerator for SequenceGenerator {
    fn next_id(&self, entity: EntityType) -> Value {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = next.entry(entity).or_insert(self.start);
        let id = *slot;
        *slot += 1;
        Value::BigInt(id)
    }

    /// Make sure the sequence for `entity` will not hand out `id` or anything below it.
    fn observe(&self, entity: EntityType, id: &Value) {
        let Some(id) = id.as_i64() else {
            return;
        };
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = next.entry(entity).or_insert(self.start);
        if *slot <= id {
            *slot = id + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_per_entity() {
        let generator = SequenceGenerator::new();
        assert_eq!(generator.next_id("person"), Value::BigInt(1));
        assert_eq!(generator.next_id("person"), Value::BigInt(2));
        assert_eq!(generator.next_id("school"), Value::BigInt(1));
    }

    #[test]
    fn test_observe_skips_used_ids() {
        let generator = SequenceGenerator::starting_at(10);
        generator.observe("person", &Value::BigInt(41));
        assert_eq!(generator.next_id("person"), Value::BigInt(42));
        generator.observe("person", &Value::BigInt(5));
        assert_eq!(generator.next_id("person"), Value::BigInt(43));
        generator.observe("person", &Value::Text("x".into()));
        assert_eq!(generator.next_id("school"), Value::BigInt(10));
    }
}
