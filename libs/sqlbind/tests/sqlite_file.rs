#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlbind::model::{Column, SqlType, TableDecl};
use sqlbind::{Binds, DatabaseConfig, EngineManager};

#[test]
fn test_relative_sqlite_file_lands_under_root_path() {
    let root = tempfile::tempdir().unwrap();
    TableDecl::new("file_items")
        .column(Column::new("id", SqlType::Integer).primary_key())
        .column(Column::new("name", SqlType::Text))
        .register()
        .unwrap();

    let db = EngineManager::new(
        DatabaseConfig::new("sqlite:///test.db").with_root_path(root.path()),
    )
    .unwrap();
    db.create_all_blocking(&Binds::All).unwrap();

    let file = root.path().join("sqlite").join("test.db");
    assert!(file.is_file());
    assert!(!db.engine().is_static_pool());
    assert!(db.block_on(db.engine().has_table("file_items")).unwrap());
    db.dispose_blocking();
}
