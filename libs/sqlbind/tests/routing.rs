#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{new_note, note, register_notes};
use sea_orm::EntityTrait;
use sqlbind::{Binds, DatabaseConfig, DbError, EngineManager};

const OTHER: &str = "routing_other";

fn manager() -> EngineManager {
    register_notes(OTHER);
    EngineManager::new(DatabaseConfig::multi([("default", "sqlite://"), (OTHER, "sqlite://")]))
        .unwrap()
}

#[test]
fn test_model_bound_to_other_key_only_touches_that_engine() {
    let db = manager();
    db.create_all_blocking(&Binds::All).unwrap();

    let session = db.session();
    let saved = db
        .block_on(async {
            let saved = session.insert(new_note("routed")).await?;
            session.commit().await?;
            Ok::<_, DbError>(saved)
        })
        .unwrap();
    assert_eq!(saved.title, "routed");

    let other = db.engine_for(OTHER).unwrap();
    assert!(db.block_on(other.has_table("notes")).unwrap());
    assert!(!db.block_on(db.engine().has_table("notes")).unwrap());

    let bound = session.bind_for::<note::Entity>().unwrap();
    assert_eq!(bound.bind_key(), OTHER);

    let rows = db
        .block_on(async {
            let rows = session.all(note::Entity::find()).await?;
            session.close().await?;
            Ok::<_, DbError>(rows)
        })
        .unwrap();
    assert_eq!(rows, [saved]);
    db.dispose_blocking();
}

#[test]
fn test_rollback_discards_uncommitted_rows() {
    let db = manager();
    db.create_all_blocking(&Binds::keys([OTHER])).unwrap();

    let session = db.session();
    let count = db
        .block_on(async {
            session.insert(new_note("discarded")).await?;
            assert_eq!(session.in_transaction().await, [OTHER]);
            session.rollback().await?;
            let count = session.scalar_count(note::Entity::find()).await?;
            session.close().await?;
            Ok::<_, DbError>(count)
        })
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn test_unknown_bind_key_is_unbound_execution() {
    let db = EngineManager::new(DatabaseConfig::new("sqlite://")).unwrap();
    register_notes(OTHER);
    let err = db.session().bind_for::<note::Entity>().unwrap_err();
    assert!(matches!(err, DbError::UnboundExecution(_)));
    assert!(err.to_string().contains(OTHER));
}
