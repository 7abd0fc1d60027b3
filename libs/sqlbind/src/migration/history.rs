//! Per-bind-key revision history tables.
//!
//! Every bind key records the revisions applied to its database in a table
//! named `sqlbind_versions__<key>__<hash8>`, where `<hash8>` is derived from
//! the original key with `xxh3_64`. Keys that sanitize to the same fragment
//! therefore still get distinct tables.

use sea_orm::{ConnectionTrait, DatabaseBackend, FromQueryResult, Statement};
use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64;

use crate::Result;

pub const VERSION_TABLE_PREFIX: &str = "sqlbind_versions__";

#[derive(Debug, FromQueryResult)]
struct VersionRecord {
    version_num: String,
}

/// Replace everything outside `[a-zA-Z0-9_]` with `_`.
fn sanitize_key(key: &str) -> String {
    let out: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() { "_".to_owned() } else { out }
}

/// History table name for a bind key, capped to the 63-byte Postgres identifier limit.
#[must_use]
pub fn version_table_name(bind_key: &str) -> String {
    const SEP: &str = "__";
    const HASH_LEN: usize = 8;
    const PG_IDENT_MAX: usize = 63;

    let sanitized = sanitize_key(bind_key);
    let hash = xxh3_64(bind_key.as_bytes());
    let hash8 = &format!("{hash:016x}")[..HASH_LEN];

    let max_key_len = PG_IDENT_MAX.saturating_sub(VERSION_TABLE_PREFIX.len() + SEP.len() + HASH_LEN);
    let key_part = if sanitized.len() > max_key_len {
        &sanitized[..max_key_len]
    } else {
        sanitized.as_str()
    };
    format!("{VERSION_TABLE_PREFIX}{key_part}{SEP}{hash8}")
}

fn quote(backend: DatabaseBackend, table: &str) -> String {
    match backend {
        DatabaseBackend::MySql => format!("`{table}`"),
        DatabaseBackend::Postgres | DatabaseBackend::Sqlite => format!(r#""{table}""#),
    }
}

/// `CREATE TABLE IF NOT EXISTS` for the history table.
#[must_use]
pub fn create_statement(backend: DatabaseBackend, table: &str) -> Statement {
    let name = quote(backend, table);
    let sql = match backend {
        DatabaseBackend::Postgres => format!(
            "CREATE TABLE IF NOT EXISTS {name} (\
             version_num VARCHAR(64) PRIMARY KEY, \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        ),
        DatabaseBackend::MySql => format!(
            "CREATE TABLE IF NOT EXISTS {name} (\
             version_num VARCHAR(64) PRIMARY KEY, \
             applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        ),
        DatabaseBackend::Sqlite => format!(
            "CREATE TABLE IF NOT EXISTS {name} (\
             version_num TEXT PRIMARY KEY, \
             applied_at TEXT NOT NULL DEFAULT (datetime('now')))"
        ),
    };
    Statement::from_string(backend, sql)
}

#[must_use]
pub fn insert_statement(backend: DatabaseBackend, table: &str, revision: &str) -> Statement {
    let name = quote(backend, table);
    let sql = match backend {
        DatabaseBackend::Postgres => format!("INSERT INTO {name} (version_num) VALUES ($1)"),
        DatabaseBackend::MySql | DatabaseBackend::Sqlite => {
            format!("INSERT INTO {name} (version_num) VALUES (?)")
        }
    };
    Statement::from_sql_and_values(backend, sql, [revision.into()])
}

#[must_use]
pub fn delete_statement(backend: DatabaseBackend, table: &str, revision: &str) -> Statement {
    let name = quote(backend, table);
    let sql = match backend {
        DatabaseBackend::Postgres => format!("DELETE FROM {name} WHERE version_num = $1"),
        DatabaseBackend::MySql | DatabaseBackend::Sqlite => {
            format!("DELETE FROM {name} WHERE version_num = ?")
        }
    };
    Statement::from_sql_and_values(backend, sql, [revision.into()])
}

/// Create the history table if it doesn't exist.
///
/// # Errors
/// Returns the driver error.
pub async fn ensure_version_table(conn: &impl ConnectionTrait, table: &str) -> Result<()> {
    conn.execute(create_statement(conn.get_database_backend(), table))
        .await?;
    Ok(())
}

/// Every revision recorded as applied.
///
/// # Errors
/// Returns the driver error.
pub async fn applied_revisions(conn: &impl ConnectionTrait, table: &str) -> Result<BTreeSet<String>> {
    let backend = conn.get_database_backend();
    let sql = format!("SELECT version_num FROM {}", quote(backend, table));
    let records = VersionRecord::find_by_statement(Statement::from_string(backend, sql))
        .all(conn)
        .await?;
    Ok(records.into_iter().map(|r| r.version_num).collect())
}
