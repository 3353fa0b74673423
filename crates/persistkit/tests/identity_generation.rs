//! Generated identities on a factory with every default.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Fixture, rendered, unwrap_outcome};
use persistkit::SessionStatus;
use persistkit::prelude::*;

#[test]
fn test_generated_identities_continue_after_stored_rows() {
    let fixture = Fixture::with_defaults(1, 2);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = fixture.session();
        let class = Entity::new("school_class").with("name", "2b").into_ref();
        let person = Entity::new("person")
            .with("name", "grace")
            .with_relation("my_class", Relation::one(Some(class.clone())))
            .into_ref();
        class
            .write()
            .set_relation("persons", Relation::many(vec![person.clone()]));

        session.persist(&class).expect("persist");
        assert_eq!(class.id(), Some(Value::BigInt(2)));
        assert_eq!(person.id(), Some(Value::BigInt(3)));

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(
            rendered(&result.writes),
            vec![
                "INSERT school_class#2 [id, name, school_id]",
                "INSERT person#3 [id, name, class_id]",
            ]
        );
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(fixture.store.row_count("school_class"), 2);
        assert_eq!(fixture.store.row_count("person"), 3);
    });
}

#[test]
fn test_each_session_sees_rows_written_since_the_last_one() {
    let fixture = Fixture::with_defaults(1, 0);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut first = fixture.session();
        let a = Entity::new("school_class").with("name", "a").into_ref();
        first.persist(&a).expect("persist a");
        unwrap_outcome(first.commit(&cx).await);
        assert_eq!(a.id(), Some(Value::BigInt(2)));

        // Another writer claims identities behind the factory's back.
        fixture
            .store
            .insert_row(
                "school_class",
                Row::from_pairs(vec![
                    ("id", Value::BigInt(10)),
                    ("name", Value::Text("outside".into())),
                    ("school_id", Value::Null),
                ]),
            )
            .expect("insert row");

        let mut second = fixture.session();
        let b = Entity::new("school_class").with("name", "b").into_ref();
        second.persist(&b).expect("persist b");
        assert_eq!(b.id(), Some(Value::BigInt(11)));
        let result = unwrap_outcome(second.commit(&cx).await);
        assert_eq!(
            rendered(&result.writes),
            vec!["INSERT school_class#11 [id, name, school_id]"]
        );
    });
}

#[test]
fn test_sessions_of_one_factory_never_share_an_identity() {
    let fixture = Fixture::with_defaults(1, 0);
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut first = fixture.session();
        let mut second = fixture.session();
        let a = Entity::new("school_class").with("name", "a").into_ref();
        let b = Entity::new("school_class").with("name", "b").into_ref();
        first.persist(&a).expect("persist a");
        second.persist(&b).expect("persist b");
        assert_eq!(a.id(), Some(Value::BigInt(2)));
        assert_eq!(b.id(), Some(Value::BigInt(3)));

        unwrap_outcome(second.commit(&cx).await);
        unwrap_outcome(first.commit(&cx).await);
        assert_eq!(fixture.store.row_count("school_class"), 3);
    });
}
