#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlbind::migration::{Commands, MigrationOptions, RevisionArgs};
use sqlbind::model::{Column, SqlType, TableDecl};
use sqlbind::{DatabaseConfig, EngineManager};
use tracing_test::traced_test;

const REPORTS: &str = "multi_reports";

fn autogenerate(message: &str) -> RevisionArgs {
    RevisionArgs {
        message: Some(message.to_owned()),
        autogenerate: true,
        ..RevisionArgs::default()
    }
}

fn revision_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir.join("versions")).unwrap().count()
}

#[test]
#[traced_test]
fn test_multi_database_revisions_and_empty_diff_suppression() {
    let root = tempfile::tempdir().unwrap();
    TableDecl::new("users")
        .column(Column::new("id", SqlType::Integer).primary_key())
        .column(Column::new("email", SqlType::String(Some(120))).unique())
        .register()
        .unwrap();
    TableDecl::new("reports")
        .database(REPORTS)
        .column(Column::new("id", SqlType::Integer).primary_key())
        .column(Column::new("body", SqlType::Text))
        .register()
        .unwrap();

    let config = DatabaseConfig::multi([
        ("default", "sqlite:///main.db"),
        (REPORTS, "sqlite:///reports.db"),
    ])
    .with_root_path(root.path())
    .with_migration_options(MigrationOptions {
        directory: "db_migrations".into(),
        ..MigrationOptions::default()
    });
    let db = EngineManager::new(config).unwrap();
    let commands = Commands::new(&db);
    let dir = commands.directory().to_path_buf();
    assert_eq!(dir, root.path().join("db_migrations"));

    commands.init(true).unwrap();
    let first = db
        .block_on(commands.revision(&autogenerate("initial")))
        .unwrap()
        .unwrap();
    assert_eq!(first.operations["default_upgrades"].len(), 1);
    assert_eq!(first.operations[&format!("{REPORTS}_upgrades")].len(), 1);
    assert_eq!(revision_files(&dir), 1);

    let upgraded = db.block_on(commands.upgrade("head", false, None)).unwrap();
    assert_eq!(
        upgraded,
        format!(
            "default: 1 revision(s), now at {rev}\n{REPORTS}: 1 revision(s), now at {rev}",
            rev = first.revision
        )
    );
    let reports = db.engine_for(REPORTS).unwrap();
    assert!(db.block_on(db.engine().has_table("users")).unwrap());
    assert!(!db.block_on(db.engine().has_table("reports")).unwrap());
    assert!(db.block_on(reports.has_table("reports")).unwrap());
    assert!(!db.block_on(reports.has_table("users")).unwrap());

    let current = db.block_on(commands.current(false)).unwrap();
    assert_eq!(
        current,
        format!(
            "default: {rev} (head)\n{REPORTS}: {rev} (head)",
            rev = first.revision
        )
    );

    // nothing changed since the last migration
    let nothing = db
        .block_on(commands.revision(&autogenerate("no-op")))
        .unwrap();
    assert!(nothing.is_none());
    assert_eq!(revision_files(&dir), 1);
    assert!(logs_contain("No changes in schema detected."));

    // a change on one database keeps only that database's group
    TableDecl::new("report_tags")
        .database(REPORTS)
        .column(Column::new("id", SqlType::Integer).primary_key())
        .column(Column::new("tag", SqlType::String(Some(30))))
        .register()
        .unwrap();
    let second = db
        .block_on(commands.revision(&autogenerate("tags")))
        .unwrap()
        .unwrap();
    assert_eq!(second.down_revisions, [first.revision.clone()]);
    assert!(!second.operations.contains_key("default_upgrades"));
    assert!(!second.operations.contains_key("default_downgrades"));
    assert_eq!(second.operations[&format!("{REPORTS}_upgrades")].len(), 1);

    let range = format!("{}:{}", first.revision, second.revision);
    let written = db.block_on(commands.upgrade(&range, true, None)).unwrap();
    assert_eq!(written.lines().count(), 2);
    let reports_sql = std::fs::read_to_string(dir.join(format!("{REPORTS}.sql"))).unwrap();
    assert!(reports_sql.contains("CREATE TABLE \"report_tags\""));
    let default_sql = std::fs::read_to_string(dir.join("default.sql")).unwrap();
    assert!(!default_sql.contains("report_tags"));
    assert!(default_sql.contains(&second.revision));

    db.block_on(commands.upgrade("head", false, None)).unwrap();
    assert!(db.block_on(reports.has_table("report_tags")).unwrap());
    assert_eq!(
        db.block_on(commands.check()).unwrap(),
        "No new upgrade operations detected."
    );

    let downgraded = db.block_on(commands.downgrade("-1", false, None)).unwrap();
    assert_eq!(
        downgraded,
        format!(
            "default: 1 revision(s), now at {rev}\n{REPORTS}: 1 revision(s), now at {rev}",
            rev = first.revision
        )
    );
    assert!(!db.block_on(reports.has_table("report_tags")).unwrap());
    db.dispose_blocking();
}
