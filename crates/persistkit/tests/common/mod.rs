//! Shared fixture: a school with classes and persons in a `MemoryStore`.

#![allow(dead_code)]

use persistkit::prelude::*;
use persistkit::{SequenceGenerator, WriteSet};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// school -(classes, eager, cascade all)-> school_class -(persons, cascade all,
/// orphan removal)-> person. `badge` has an application-assigned identity.
pub fn registry(persons_batch_size: Option<usize>) -> Arc<MetadataRegistry> {
    let mut persons = RelationshipEdge::one_to_many("persons", "person")
        .mapped_by("my_class")
        .cascade(CascadeSet::ALL)
        .orphan_removal(true);
    if let Some(size) = persons_batch_size {
        persons = persons.batch_size(size);
    }
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("school")
                .field(FieldInfo::new("name"))
                .relationship(
                    RelationshipEdge::one_to_many("classes", "school_class")
                        .mapped_by("school")
                        .cascade(CascadeSet::ALL)
                        .fetch(FetchMode::Eager),
                ),
        )
        .entity(
            EntityMetadata::new("school_class")
                .field(FieldInfo::new("name"))
                .relationship(
                    RelationshipEdge::many_to_one("school", "school").join_column("school_id"),
                )
                .relationship(persons),
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
        .expect("valid registry");
    Arc::new(registry)
}

pub struct Fixture {
    pub store: MemoryStore,
    pub factory: SessionFactory<MemoryStore>,
}

impl Fixture {
    /// One school (id 1) with `classes` classes (ids 1..) of
    /// `persons_per_class` persons each (ids 1.., named "person <id>").
    pub fn new(classes: i64, persons_per_class: i64) -> Self {
        Self::with(classes, persons_per_class, None, SessionConfig::default())
    }

    /// Generated identities start at 1000, clear of the seeded rows.
    pub fn with(
        classes: i64,
        persons_per_class: i64,
        persons_batch_size: Option<usize>,
        config: SessionConfig,
    ) -> Self {
        let registry = registry(persons_batch_size);
        let store = MemoryStore::new(Arc::clone(&registry));
        seed(&store, classes, persons_per_class);
        let factory = SessionFactory::new(registry, store.clone())
            .with_generator(Arc::new(SequenceGenerator::starting_at(1000)))
            .with_config(config);
        Self { store, factory }
    }

    /// Same rows, but sessions come from a factory with every default,
    /// including its identity generator.
    pub fn with_defaults(classes: i64, persons_per_class: i64) -> Self {
        let registry = registry(None);
        let store = MemoryStore::new(Arc::clone(&registry));
        seed(&store, classes, persons_per_class);
        let factory = SessionFactory::new(registry, store.clone());
        Self { store, factory }
    }

    pub fn session(&self) -> Session<MemoryStore> {
        self.factory.open_session()
    }

    pub fn queries(&self) -> usize {
        self.store.stats().queries()
    }

    /// The write sets applied so far, rendered one op per string.
    pub fn writes(&self) -> Vec<Vec<String>> {
        self.store.stats().write_sets.iter().map(rendered).collect()
    }
}

pub fn rendered(set: &WriteSet) -> Vec<String> {
    set.iter().map(ToString::to_string).collect()
}

fn seed(store: &MemoryStore, classes: i64, persons_per_class: i64) {
    store
        .insert_row(
            "school",
            Row::from_pairs(vec![("id", Value::BigInt(1)), ("name", Value::Text("north".into()))]),
        )
        .expect("seed school");
    let mut person_id = 1;
    for class_id in 1..=classes {
        store
            .insert_row(
                "school_class",
                Row::from_pairs(vec![
                    ("id", Value::BigInt(class_id)),
                    ("name", Value::Text(format!("class {class_id}"))),
                    ("school_id", Value::BigInt(1)),
                ]),
            )
            .expect("seed class");
        for _ in 0..persons_per_class {
            store
                .insert_row(
                    "person",
                    Row::from_pairs(vec![
                        ("id", Value::BigInt(person_id)),
                        ("name", Value::Text(format!("person {person_id}"))),
                        ("class_id", Value::BigInt(class_id)),
                    ]),
                )
                .expect("seed person");
            person_id += 1;
        }
    }
}
