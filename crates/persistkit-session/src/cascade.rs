//! Cascade traversal over in-memory entity graphs.
//!
//! Cascades only follow relationships that are already in memory. Persist
//! cascades run at flush time from every managed entity; remove cascades run
//! from the removed root after the session made sure every reachable lazy
//! relationship is loaded (see [`unresolved_on_remove`]).

use persistkit_core::{
    CascadeType, EntityRef, EntityState, MetadataRegistry, Relation, RelationshipEdge, Result,
};
use std::collections::HashSet;

fn edges_of(registry: &MetadataRegistry, entity: &EntityRef) -> Result<Vec<RelationshipEdge>> {
    let entity_type = entity.entity_type();
    Ok(registry.get(entity_type)?.relationships.clone())
}

fn resolved_targets(entity: &EntityRef, edge: &RelationshipEdge) -> Vec<EntityRef> {
    entity
        .read()
        .relation(edge.name)
        .and_then(Relation::targets)
        .unwrap_or_default()
}

/// Transient entities reachable from `roots` through persist cascades, in
/// discovery order (parents before children).
///
/// Traversal passes through managed entities and stops at detached and
/// removed ones. Roots themselves are never returned.
pub fn collect_persist(registry: &MetadataRegistry, roots: &[EntityRef]) -> Result<Vec<EntityRef>> {
    let mut visited: HashSet<usize> = roots.iter().map(EntityRef::instance_id).collect();
    let mut stack: Vec<EntityRef> = roots.iter().rev().cloned().collect();
    let mut found = Vec::new();

    while let Some(entity) = stack.pop() {
        let mut next = Vec::new();
        for edge in edges_of(registry, &entity)? {
            if !edge.cascade.contains(CascadeType::Persist) {
                continue;
            }
            for target in resolved_targets(&entity, &edge) {
                if !visited.insert(target.instance_id()) {
                    continue;
                }
                match target.state() {
                    EntityState::Transient => {
                        found.push(target.clone());
                        next.push(target);
                    }
                    EntityState::Managed => next.push(target),
                    EntityState::Detached | EntityState::Removed => {}
                }
            }
        }
        stack.extend(next.into_iter().rev());
    }

    if !found.is_empty() {
        tracing::debug!(count = found.len(), "Persist cascade reached transient entities");
    }
    Ok(found)
}

/// Managed entities reached by removing `root`, children before parents,
/// ending with `root` itself when it is managed.
///
/// Follows edges with a remove cascade or orphan removal.
pub fn collect_remove(registry: &MetadataRegistry, root: &EntityRef) -> Result<Vec<EntityRef>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit_remove(registry, root, &mut visited, &mut order)?;
    Ok(order)
}

fn visit_remove(
    registry: &MetadataRegistry,
    entity: &EntityRef,
    visited: &mut HashSet<usize>,
    order: &mut Vec<EntityRef>,
) -> Result<()> {
    if !visited.insert(entity.instance_id()) || entity.state() != EntityState::Managed {
        return Ok(());
    }
    for edge in edges_of(registry, entity)? {
        if !edge.reaches_on_remove() {
            continue;
        }
        for target in resolved_targets(entity, &edge) {
            visit_remove(registry, &target, visited, order)?;
        }
    }
    order.push(entity.clone());
    Ok(())
}

/// Lazy relationships that must be loaded before the remove cascade from
/// `root` is complete, as `(owner, relationship)` pairs.
pub fn unresolved_on_remove(
    registry: &MetadataRegistry,
    root: &EntityRef,
) -> Result<Vec<(EntityRef, &'static str)>> {
    let mut visited = HashSet::new();
    let mut stack = vec![root.clone()];
    let mut pending = Vec::new();

    while let Some(entity) = stack.pop() {
        if !visited.insert(entity.instance_id()) || entity.state() != EntityState::Managed {
            continue;
        }
        for edge in edges_of(registry, &entity)? {
            if !edge.reaches_on_remove() {
                continue;
            }
            let guard = entity.read();
            match guard.relation(edge.name) {
                Some(Relation::Lazy(handle)) if !handle.is_loaded() => {
                    pending.push((entity.clone(), edge.name));
                }
                Some(relation) => stack.extend(relation.targets().unwrap_or_default()),
                None => {}
            }
        }
    }
    Ok(pending)
}
