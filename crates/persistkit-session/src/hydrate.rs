//! Row materialization.
//!
//! Store rows arrive in the flat join layout: root columns unprefixed, each
//! fetch-joined path's columns under `"<path>."`. Materialization goes
//! through the identity map, so a row for an identity that is already
//! managed yields the existing instance untouched, and a to-many fetch join
//! that repeats the root on every row still produces each root once.

use crate::ObjectKey;
use crate::unit_of_work::{UnitOfWork, key_of};
use persistkit_core::{
    Entity, EntityMetadata, EntityRef, EntityState, JoinSpec, LazyHandle, LazyTarget, QueryPlan,
    Relation, Resolved, Result, Row, Value,
};
use std::collections::{HashMap, HashSet};

/// Children collected for one (parent, path) pair.
struct JoinGroup {
    parent: EntityRef,
    relationship: &'static str,
    collection: bool,
    members: Vec<EntityRef>,
}

/// Build an entity from the columns under `prefix`.
///
/// Owning edges become lazy references (or a resolved null), every other
/// edge a lazy inverse lookup.
fn build_entity(meta: &EntityMetadata, prefix: &str, row: &Row, id: &Value) -> Entity {
    let mut entity = Entity::new(meta.entity).with_id(id.clone());
    for field in &meta.fields {
        let value = row
            .get_prefixed(prefix, field.name)
            .cloned()
            .unwrap_or(Value::Null);
        entity.set(field.name, value);
    }
    for edge in &meta.relationships {
        let relation = if edge.owning {
            match edge.foreign_key.and_then(|fk| row.get_prefixed(prefix, fk)) {
                Some(fk) if !fk.is_null() => Relation::Lazy(LazyHandle::new(LazyTarget::Reference {
                    owner: meta.entity,
                    relationship: edge.name,
                    target: edge.target,
                    id: fk.clone(),
                })),
                _ => Relation::one(None),
            }
        } else {
            Relation::Lazy(LazyHandle::new(LazyTarget::Inverse {
                owner: meta.entity,
                owner_id: id.clone(),
                relationship: edge.name,
            }))
        };
        entity.set_relation(edge.name, relation);
    }
    entity.set_state(EntityState::Managed);
    entity
}

impl UnitOfWork {
    /// Materialize the roots of `rows`, deduplicated in first-seen order,
    /// and resolve the fetch-joined relationships from the same rows.
    #[tracing::instrument(level = "debug", skip(self, plan, rows), fields(entity = plan.entity, rows = rows.len()))]
    pub fn hydrate(&mut self, plan: &QueryPlan, rows: &[Row]) -> Result<Vec<EntityRef>> {
        let fetch_joins: Vec<&JoinSpec> = plan.joins.iter().filter(|j| j.fetch).collect();
        let mut roots = Vec::new();
        let mut seen_roots = HashSet::new();
        let mut groups: Vec<JoinGroup> = Vec::new();
        let mut group_index: HashMap<(usize, &str), usize> = HashMap::new();

        for row in rows {
            let Some(root) = self.materialize(plan.entity, "", row)? else {
                continue;
            };
            if seen_roots.insert(root.instance_id()) {
                roots.push(root.clone());
            }

            let mut by_path: HashMap<&str, EntityRef> = HashMap::new();
            by_path.insert("", root);
            for join in &fetch_joins {
                let Some(parent) = by_path.get(join.parent_path.as_str()).cloned() else {
                    continue;
                };
                let slot = *group_index
                    .entry((parent.instance_id(), join.path.as_str()))
                    .or_insert_with(|| {
                        groups.push(JoinGroup {
                            parent: parent.clone(),
                            relationship: join.relationship,
                            collection: join.collection,
                            members: Vec::new(),
                        });
                        groups.len() - 1
                    });
                if let Some(child) = self.materialize(join.target, &join.path, row)? {
                    let members = &mut groups[slot].members;
                    if !members.iter().any(|m| m.ptr_eq(&child)) {
                        members.push(child.clone());
                    }
                    by_path.insert(join.path.as_str(), child);
                }
            }
        }

        for group in groups {
            self.fill_relation(group);
        }
        tracing::debug!(roots = roots.len(), "Rows hydrated");
        Ok(roots)
    }

    /// The entity whose columns sit under `prefix`, or `None` for a null identity.
    fn materialize(
        &mut self,
        entity_type: &'static str,
        prefix: &str,
        row: &Row,
    ) -> Result<Option<EntityRef>> {
        let meta = self.registry.get(entity_type)?;
        let id = match row.get_prefixed(prefix, meta.identity.field) {
            Some(id) if !id.is_null() => id.clone(),
            _ => return Ok(None),
        };
        let key = ObjectKey::new(entity_type, id);
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(Some(existing.clone()));
        }
        let entity = build_entity(meta, prefix, row, key.id()).into_ref();
        self.register_loaded(key, entity.clone())?;
        Ok(Some(entity))
    }

    /// Fill a lazy relation with joined children; in-memory values win.
    fn fill_relation(&mut self, group: JoinGroup) {
        let value = if group.collection {
            Resolved::Many(group.members)
        } else {
            Resolved::One(group.members.into_iter().next())
        };
        let filled = {
            let mut parent = group.parent.write();
            match parent.relation_mut(group.relationship) {
                Some(relation) => relation.fill(value.clone()),
                None => {
                    parent.set_relation(group.relationship, Relation::Resolved(value.clone()));
                    true
                }
            }
        };
        if filled {
            self.record_baseline(&group.parent, group.relationship, value.entities());
        }
    }

    /// Overwrite a managed entity's fields and relations with `row` and
    /// reset its snapshot.
    pub fn reload(&mut self, entity: &EntityRef, row: &Row) -> Result<()> {
        let Some(key) = key_of(entity) else {
            return Ok(());
        };
        let meta = self.registry.get(key.entity())?;
        let fresh = build_entity(meta, "", row, key.id());
        {
            let mut guard = entity.write();
            for (name, value) in fresh.fields() {
                guard.set(name.clone(), value.clone());
            }
            for (name, relation) in fresh.relations() {
                guard.set_relation(name, relation.clone());
            }
        }
        self.tracker.forget(&key);
        self.take_snapshot(&key, entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::SequenceGenerator;
    use persistkit_core::{
        CascadeSet, FieldInfo, JoinKind, MetadataRegistry, Predicate, RelationshipEdge,
    };
    use std::sync::Arc;

    fn uow() -> UnitOfWork {
        let registry = MetadataRegistry::builder()
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
            .build()
            .unwrap();
        UnitOfWork::new(Arc::new(registry), Arc::new(SequenceGenerator::new()))
    }

    fn persons_join() -> JoinSpec {
        JoinSpec {
            path: "persons".to_string(),
            parent_path: String::new(),
            relationship: "persons",
            target: "person",
            parent_column: "id",
            target_column: "class_id",
            collection: true,
            kind: JoinKind::Left,
            fetch: true,
        }
    }

    fn joined_row(class_id: i64, person: Option<(i64, &str)>) -> Row {
        let (pid, pname, fk) = match person {
            Some((id, name)) => (Value::BigInt(id), Value::Text(name.into()), Value::BigInt(class_id)),
            None => (Value::Null, Value::Null, Value::Null),
        };
        Row::from_pairs(vec![
            ("id", Value::BigInt(class_id)),
            ("name", Value::Text(format!("class {class_id}"))),
            ("persons.id", pid),
            ("persons.name", pname),
            ("persons.class_id", fk),
        ])
    }

    #[test]
    fn test_collection_join_deduplicates_roots() {
        let mut uow = uow();
        let plan = QueryPlan::new("school_class").join(persons_join());
        let rows = vec![
            joined_row(1, Some((10, "a"))),
            joined_row(1, Some((11, "b"))),
            joined_row(2, Some((12, "c"))),
            joined_row(3, None),
        ];
        let roots = uow.hydrate(&plan, &rows).unwrap();
        assert_eq!(roots.len(), 3);

        let first = roots[0].read().collection("persons").unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].get("name"), Some(Value::Text("b".into())));
        assert!(roots[2].read().collection("persons").unwrap().is_empty());
        assert_eq!(uow.identity_map().len(), 6);

        // The joined collection is the orphan-removal baseline.
        let key = ObjectKey::new("school_class", Value::BigInt(1));
        assert_eq!(
            uow.change_tracker().membership(&key, "persons").map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn test_existing_instance_is_returned_untouched() {
        let mut uow = uow();
        let plan = QueryPlan::new("school_class").filter(Predicate::eq("id", 1_i64));
        let first = uow
            .hydrate(&plan, &[Row::from_pairs(vec![("id", Value::BigInt(1)), ("name", Value::Text("x".into()))])])
            .unwrap();
        first[0].set("name", "local change");
        let second = uow
            .hydrate(&plan, &[Row::from_pairs(vec![("id", Value::BigInt(1)), ("name", Value::Text("y".into()))])])
            .unwrap();
        assert!(first[0].ptr_eq(&second[0]));
        assert_eq!(second[0].get("name"), Some(Value::Text("local change".into())));
    }

    #[test]
    fn test_owning_edges_become_lazy_references() {
        let mut uow = uow();
        let plan = QueryPlan::new("person");
        let rows = vec![
            Row::from_pairs(vec![
                ("id", Value::BigInt(1)),
                ("name", Value::Text("a".into())),
                ("class_id", Value::BigInt(4)),
            ]),
            Row::from_pairs(vec![
                ("id", Value::BigInt(2)),
                ("name", Value::Text("b".into())),
                ("class_id", Value::Null),
            ]),
        ];
        let persons = uow.hydrate(&plan, &rows).unwrap();
        let a = persons[0].read();
        match a.relation("my_class") {
            Some(Relation::Lazy(handle)) => assert_eq!(
                handle.target(),
                &LazyTarget::Reference {
                    owner: "person",
                    relationship: "my_class",
                    target: "school_class",
                    id: Value::BigInt(4)
                }
            ),
            other => panic!("unexpected relation: {other:?}"),
        }
        assert!(persons[1].read().relation("my_class").unwrap().is_resolved());
        assert_eq!(a.state(), EntityState::Managed);
    }

    #[test]
    fn test_reload_overwrites_and_resets_snapshot() {
        let mut uow = uow();
        let plan = QueryPlan::new("school_class");
        let row = Row::from_pairs(vec![("id", Value::BigInt(1)), ("name", Value::Text("x".into()))]);
        let class = uow.hydrate(&plan, std::slice::from_ref(&row)).unwrap().remove(0);
        class.set("name", "changed");
        assert!(uow.has_changes());

        uow.reload(&class, &row).unwrap();
        assert_eq!(class.get("name"), Some(Value::Text("x".into())));
        assert!(!uow.has_changes());
    }
}
