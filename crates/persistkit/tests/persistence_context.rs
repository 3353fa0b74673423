//! Identity map, detach/merge and session-scoped visibility.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Fixture, unwrap_outcome};
use persistkit::prelude::*;

#[test]
fn test_find_twice_returns_the_same_instance() {
    let fixture = Fixture::new(2, 3);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let first = unwrap_outcome(session.find(&cx, "person", 1i64).await).expect("person 1");
        let second = unwrap_outcome(session.find(&cx, "person", 1i64).await).expect("person 1");
        assert!(first.ptr_eq(&second));
        assert_eq!(fixture.queries(), 1);

        let queried = unwrap_outcome(
            session
                .query(&cx, &Query::new("person").filter(Predicate::eq("id", 1i64)))
                .await,
        );
        assert_eq!(queried.len(), 1);
        assert!(queried.entities[0].ptr_eq(&first));
    });
}

#[test]
fn test_persisted_entity_is_found_without_a_query() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let class = Entity::new("school_class").with("name", "4d").into_ref();
        session.persist(&class).expect("persist");
        assert_eq!(class.state(), EntityState::Managed);
        assert_eq!(class.id(), Some(Value::BigInt(1000)));

        let found = unwrap_outcome(session.find(&cx, "school_class", 1000i64).await);
        assert!(found.is_some_and(|f| f.ptr_eq(&class)));
        assert_eq!(fixture.queries(), 0);
    });
}

#[test]
fn test_missing_identity_is_none() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let found = unwrap_outcome(session.find(&cx, "person", 999i64).await);
        assert!(found.is_none());
    });
}

#[test]
fn test_detached_entity_is_replaced_on_next_find() {
    let fixture = Fixture::new(1, 2);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let person = unwrap_outcome(session.find(&cx, "person", 2i64).await).expect("person 2");
        session.detach(&person).expect("detach");
        assert_eq!(person.state(), EntityState::Detached);
        assert!(!session.contains(&person));

        let again = unwrap_outcome(session.find(&cx, "person", 2i64).await).expect("person 2");
        assert!(!again.ptr_eq(&person));
        assert_eq!(again.state(), EntityState::Managed);
        assert_eq!(fixture.queries(), 2);
    });
}

#[test]
fn test_merge_detached_changes_only_changed_columns() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let class = unwrap_outcome(session.find(&cx, "school_class", 1i64).await).expect("class");
        session.detach(&class).expect("detach");
        class.set("name", "merged");

        let managed = unwrap_outcome(session.merge(&cx, &class).await);
        assert!(!managed.ptr_eq(&class));
        assert_eq!(class.state(), EntityState::Detached);
        assert_eq!(managed.state(), EntityState::Managed);
        assert_eq!(managed.get("name"), Some(Value::Text("merged".into())));

        unwrap_outcome(session.commit(&cx).await);
        let writes = fixture.writes();
        assert_eq!(
            writes.last().cloned(),
            Some(vec!["UPDATE school_class#1 [name]".to_string()])
        );
    });
}

#[test]
fn test_merging_two_copies_converges_on_one_instance() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let first = Entity::new("school_class").with_id(500i64).with("name", "a").into_ref();
        let second = Entity::new("school_class").with_id(500i64).with("name", "b").into_ref();

        let m1 = unwrap_outcome(session.merge(&cx, &first).await);
        let m2 = unwrap_outcome(session.merge(&cx, &second).await);
        assert!(m1.ptr_eq(&m2));
        assert_eq!(m1.get("name"), Some(Value::Text("b".into())));
        assert_eq!(first.state(), EntityState::Transient);
        assert_eq!(second.state(), EntityState::Transient);

        let found = unwrap_outcome(session.find(&cx, "school_class", 500i64).await);
        assert!(found.is_some_and(|f| f.ptr_eq(&m1)));
    });
}

#[test]
fn test_merge_onto_removed_identity_is_illegal() {
    let fixture = Fixture::new(1, 2);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let person = unwrap_outcome(session.find(&cx, "person", 1i64).await).expect("person");
        unwrap_outcome(session.remove(&cx, &person).await);

        let copy = Entity::new("person").with_id(1i64).with("name", "ghost").into_ref();
        match session.merge(&cx, &copy).await {
            Outcome::Err(Error::IllegalState(e)) => assert_eq!(e.operation, "merge"),
            other => panic!("expected IllegalState, got {other:?}"),
        }
    });
}

#[test]
fn test_clear_detaches_everything() {
    let fixture = Fixture::new(1, 3);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let people = unwrap_outcome(session.query(&cx, &Query::new("person")).await).into_entities();
        assert_eq!(people.len(), 3);
        assert!(people.iter().all(|p| session.contains(p)));

        assert_eq!(session.clear(), 3);
        assert!(people.iter().all(|p| p.state() == EntityState::Detached));
        assert_eq!(session.state_of(&people[0]), EntityState::Detached);
        assert_eq!(session.debug_state().tracked, 0);
    });
}

#[test]
fn test_rollback_undoes_store_writes_but_not_memory() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let class = Entity::new("school_class").with("name", "temp").into_ref();
        session.persist(&class).expect("persist");
        unwrap_outcome(session.flush(&cx).await);
        assert!(session.in_transaction());
        assert_eq!(fixture.store.row_count("school_class"), 2);

        let pending = Entity::new("school_class").with("name", "unflushed").into_ref();
        session.persist(&pending).expect("persist");

        unwrap_outcome(session.rollback(&cx).await);
        assert!(!session.in_transaction());
        assert!(!fixture.store.in_transaction());
        assert_eq!(fixture.store.row_count("school_class"), 1);

        // Flushed state stays in memory; unflushed inserts are dropped.
        assert_eq!(class.state(), EntityState::Managed);
        assert_eq!(class.get("name"), Some(Value::Text("temp".into())));
        assert_eq!(pending.state(), EntityState::Detached);

        match session.refresh(&cx, &class).await {
            Outcome::Err(Error::NotFound(e)) => assert_eq!(e.entity, "school_class"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    });
}

#[test]
fn test_committed_changes_are_visible_to_a_new_session() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut writer = fixture.session();
        let class = Entity::new("school_class").with("name", "fresh").into_ref();
        writer.persist(&class).expect("persist");
        unwrap_outcome(writer.commit(&cx).await);

        let mut reader = fixture.session();
        let loaded = unwrap_outcome(reader.find(&cx, "school_class", 1000i64).await).expect("committed");
        assert!(!loaded.ptr_eq(&class));
        assert_eq!(loaded.get("name"), Some(Value::Text("fresh".into())));
    });
}
