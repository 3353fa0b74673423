//! N+1 query detection.
//!
//! Loading N owners and then touching a lazy relationship on each issues one
//! query per owner. The tracker counts lazy-load queries per
//! (entity, relationship) and warns once the count reaches a threshold.
//!
//! ```ignore
//! let classes = session.query(&cx, &Query::new("school_class")).await?.entities;
//!
//! // Warns on the third query for school_class.persons:
//! for class in &classes {
//!     session.load_relation(&cx, class, "persons").await?;
//! }
//!
//! // One IN-list query per batch instead:
//! session.load_batch(&cx, &classes, "persons").await?;
//! ```

use persistkit_core::EntityType;
use serde::Serialize;
use std::collections::HashMap;

/// Lazy-load query counts for one session.
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(EntityType, &'static str), usize>,
    threshold: usize,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a tracker's counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct N1Stats {
    /// Lazy-load queries recorded.
    pub total_loads: usize,
    /// Distinct (entity, relationship) pairs loaded.
    pub relationships_loaded: usize,
    /// Pairs at or above the threshold.
    pub potential_n1: usize,
}

impl N1QueryTracker {
    pub const DEFAULT_THRESHOLD: usize = 3;

    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(Self::DEFAULT_THRESHOLD)
    }

    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy-load query for `entity.relationship`. Warns exactly
    /// once per pair, when its count reaches the threshold.
    pub fn record_load(&mut self, entity: EntityType, relationship: &'static str) {
        let count = self.counts.entry((entity, relationship)).or_default();
        *count += 1;
        tracing::trace!(
            target: "persistkit::n1",
            entity,
            relationship,
            queries = *count,
            "lazy load query"
        );
        if *count == self.threshold {
            tracing::warn!(
                target: "persistkit::n1",
                entity,
                relationship,
                queries = *count,
                threshold = self.threshold,
                "N+1 query pattern detected; declare a batch_size on the relationship, fetch-join it, or use Session::load_batch()"
            );
        }
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    #[must_use]
    pub fn count_for(&self, entity: EntityType, relationship: &str) -> usize {
        self.counts
            .iter()
            .find(|((e, r), _)| *e == entity && *r == relationship)
            .map_or(0, |(_, n)| *n)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relationships_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|n| **n >= self.threshold)
                .count(),
        }
    }
}
