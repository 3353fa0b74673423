//! Store rejections, illegal states and session status transitions.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Fixture, expect_err, rendered, unwrap_outcome};
use persistkit::SessionStatus;
use persistkit::prelude::*;

#[test]
fn test_stale_update_fails_the_session_until_rollback() {
    let fixture = Fixture::new(1, 5);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let person = unwrap_outcome(session.find(&cx, "person", 5i64).await).expect("person");
        fixture
            .store
            .delete_row("person", &Value::BigInt(5))
            .expect("delete");
        person.set("name", "too late");

        let err = expect_err(session.flush(&cx).await);
        assert!(err.is_stale_write());
        assert_eq!(session.status(), SessionStatus::Failed);

        match expect_err(session.find(&cx, "person", 1i64).await) {
            Error::SessionUnusable(e) => {
                assert_eq!(e.status, "failed");
                assert_eq!(e.operation, "find");
            }
            other => panic!("expected SessionUnusable, got {other:?}"),
        }
        assert!(matches!(
            session.persist(&Entity::new("person").into_ref()),
            Err(Error::SessionUnusable(_))
        ));
        assert!(matches!(
            expect_err(session.commit(&cx).await),
            Error::SessionUnusable(_)
        ));

        unwrap_outcome(session.rollback(&cx).await);
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(!fixture.store.in_transaction());
        assert!(unwrap_outcome(session.find(&cx, "person", 1i64).await).is_some());
    });
}

#[test]
fn test_duplicate_identity_is_a_constraint_violation() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let duplicate = Entity::new("school_class")
            .with_id(1i64)
            .with("name", "dup")
            .into_ref();
        session.persist(&duplicate).expect("persist");

        let err = expect_err(session.commit(&cx).await);
        assert!(err.is_constraint_violation());
        assert_eq!(session.status(), SessionStatus::Failed);

        unwrap_outcome(session.rollback(&cx).await);
        assert_eq!(duplicate.state(), EntityState::Detached);
        assert_eq!(fixture.store.row_count("school_class"), 1);
        assert!(fixture.writes().is_empty());
    });
}

#[test]
fn test_assigned_identity_is_required_and_kept() {
    let fixture = Fixture::new(0, 0);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let unnamed = Entity::new("badge").with("label", "gold").into_ref();
        match session.persist(&unnamed) {
            Err(Error::IllegalState(e)) => assert_eq!(e.entity, "badge"),
            other => panic!("expected IllegalState, got {other:?}"),
        }
        assert_eq!(unnamed.state(), EntityState::Transient);

        let badge = Entity::new("badge")
            .with_id("b-1")
            .with("label", "gold")
            .into_ref();
        session.persist(&badge).expect("persist");
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(rendered(&result.writes), vec!["INSERT badge#'b-1' [code, label]"]);
    });
}

#[test]
fn test_detached_entity_cannot_be_persisted() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let person = unwrap_outcome(session.find(&cx, "person", 1i64).await).expect("person");
        session.detach(&person).expect("detach");

        assert!(matches!(session.persist(&person), Err(Error::IllegalState(_))));
        assert!(session.detach(&person).is_err_and(|e| e.is_not_managed()));
        assert_eq!(session.status(), SessionStatus::Active);
    });
}

#[test]
fn test_second_instance_for_a_managed_identity_is_rejected() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let person = unwrap_outcome(session.find(&cx, "person", 1i64).await).expect("person");
        let impostor = Entity::new("person").with_id(1i64).with("name", "twin").into_ref();

        assert!(matches!(session.persist(&impostor), Err(Error::IllegalState(_))));
        assert_eq!(impostor.state(), EntityState::Transient);
        let found = unwrap_outcome(session.find(&cx, "person", 1i64).await);
        assert!(found.is_some_and(|f| f.ptr_eq(&person)));
    });
}

#[test]
fn test_entity_managed_by_another_session_cannot_be_persisted() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut first = fixture.session();
        let mut second = fixture.session();
        let person = unwrap_outcome(first.find(&cx, "person", 1i64).await).expect("person");
        assert!(matches!(second.persist(&person), Err(Error::IllegalState(_))));
        assert!(!second.contains(&person));
    });
}

#[test]
fn test_closed_session_rejects_everything() {
    let fixture = Fixture::new(1, 1);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let class = Entity::new("school_class").with("name", "closing").into_ref();
        session.persist(&class).expect("persist");
        unwrap_outcome(session.flush(&cx).await);

        unwrap_outcome(session.close(&cx).await);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(class.state(), EntityState::Detached);
        assert_eq!(fixture.store.row_count("school_class"), 1);

        assert!(matches!(
            expect_err(session.find(&cx, "person", 1i64).await),
            Error::SessionUnusable(_)
        ));
        assert!(matches!(
            expect_err(session.rollback(&cx).await),
            Error::SessionUnusable(_)
        ));
        let info = serde_json::to_value(session.debug_state()).expect("serialize debug state");
        assert_eq!(info["status"], "Closed");
        assert_eq!(info["tracked"], 0);
    });
}
