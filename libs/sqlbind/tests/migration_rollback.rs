#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlbind::migration::{Commands, RevisionArgs};
use sqlbind::model::{Column, SqlType, TableDecl};
use sqlbind::{DatabaseConfig, EngineManager};

const ARCHIVE: &str = "rollback_archive";

#[test]
fn test_failure_on_one_database_rolls_back_the_others() {
    let root = tempfile::tempdir().unwrap();
    TableDecl::new("audit_entries")
        .column(Column::new("id", SqlType::Integer).primary_key())
        .register()
        .unwrap();

    let config = DatabaseConfig::multi([
        ("default", "sqlite:///main.db"),
        (ARCHIVE, "sqlite:///archive.db"),
    ])
    .with_root_path(root.path());
    let db = EngineManager::new(config).unwrap();
    assert!(!db.migration_options().use_two_phase);
    let commands = Commands::new(&db);
    commands.init(true).unwrap();

    let revision = db
        .block_on(commands.revision(&RevisionArgs {
            message: Some("audit".to_owned()),
            autogenerate: true,
            ..RevisionArgs::default()
        }))
        .unwrap()
        .unwrap();
    assert_eq!(revision.operations["default_upgrades"].len(), 1);

    // the archive database fails after default has applied its table
    let mut script: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&revision.path).unwrap()).unwrap();
    script[format!("{ARCHIVE}_upgrades")] =
        serde_json::json!([{ "op": "execute", "sql": "THIS IS NOT SQL" }]);
    std::fs::write(&revision.path, serde_json::to_string_pretty(&script).unwrap()).unwrap();

    let err = db
        .block_on(commands.upgrade("head", false, None))
        .unwrap_err();
    assert!(
        err.to_string()
            .starts_with(&format!("Migration failed for database '{ARCHIVE}'")),
        "{err}"
    );

    assert!(!db.block_on(db.engine().has_table("audit_entries")).unwrap());
    let current = db.block_on(commands.current(false)).unwrap();
    assert!(!current.contains(&revision.revision), "{current}");

    db.dispose_blocking();
}
