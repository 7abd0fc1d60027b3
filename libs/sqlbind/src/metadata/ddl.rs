//! DDL rendering and catalog reflection for schema containers.

use sea_orm::sea_query::{Alias, ForeignKey, Index, Table as SeaTable};
use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};

use super::schema::{Column, ConstraintTokens, NamingConvention, SqlType, TableSpec};
use crate::Result;
use crate::migration::history::VERSION_TABLE_PREFIX;

fn constraint_name(
    conv: &NamingConvention,
    kind: &str,
    table: &str,
    column: &str,
    referred: &str,
) -> Option<String> {
    conv.render(
        kind,
        &ConstraintTokens {
            table_name: table,
            column_0_name: column,
            referred_table_name: referred,
            constraint_name: column,
        },
    )
}

/// `CREATE TABLE` plus one `CREATE INDEX` per indexed column.
#[must_use]
pub fn create_table_statements(
    backend: DatabaseBackend,
    spec: &TableSpec,
    conv: &NamingConvention,
) -> Vec<Statement> {
    let pk = spec.primary_key();
    let inline_pk = pk.len() == 1;

    let mut create = SeaTable::create();
    create.table(Alias::new(&spec.name));
    for col in &spec.columns {
        create.col(col.to_column_def(inline_pk));
    }

    if pk.len() > 1 {
        let mut key = Index::create();
        if let Some(name) = constraint_name(conv, "pk", &spec.name, &pk[0].name, "") {
            key.name(name);
        }
        for col in &pk {
            key.col(Alias::new(&col.name));
        }
        create.primary_key(&mut key);
    }

    for col in spec.columns.iter().filter(|c| c.unique && !c.primary_key) {
        let mut uq = Index::create();
        uq.unique().col(Alias::new(&col.name));
        if let Some(name) = constraint_name(conv, "uq", &spec.name, &col.name, "") {
            uq.name(name);
        }
        create.index(&mut uq);
    }

    for col in &spec.columns {
        let Some(target) = &col.references else {
            continue;
        };
        let mut fk = ForeignKey::create();
        fk.from(Alias::new(&spec.name), Alias::new(&col.name))
            .to(Alias::new(&target.table), Alias::new(&target.column));
        if let Some(name) = constraint_name(conv, "fk", &spec.name, &col.name, &target.table) {
            fk.name(name);
        }
        create.foreign_key(&mut fk);
    }

    let mut out = vec![backend.build(&create)];
    for col in spec.columns.iter().filter(|c| c.index && !c.unique) {
        out.push(create_index_statement(backend, &spec.name, col, conv));
    }
    out
}

/// Name of the index emitted for an indexed column.
#[must_use]
pub fn index_name(table: &str, column: &str, conv: &NamingConvention) -> String {
    constraint_name(conv, "ix", table, column, "").unwrap_or_else(|| format!("ix_{table}_{column}"))
}

#[must_use]
pub fn create_index_statement(
    backend: DatabaseBackend,
    table: &str,
    col: &Column,
    conv: &NamingConvention,
) -> Statement {
    let mut idx = Index::create();
    idx.name(index_name(table, &col.name, conv))
        .table(Alias::new(table))
        .col(Alias::new(&col.name));
    backend.build(&idx)
}

#[must_use]
pub fn drop_index_statement(backend: DatabaseBackend, table: &str, name: &str) -> Statement {
    let mut idx = Index::drop();
    idx.name(name).table(Alias::new(table));
    backend.build(&idx)
}

#[must_use]
pub fn drop_table_statement(backend: DatabaseBackend, table: &str) -> Statement {
    backend.build(SeaTable::drop().table(Alias::new(table)))
}

/// Read every user table (and its columns) from the database catalog.
///
/// Version-history tables are skipped.
///
/// # Errors
/// Returns an error if a catalog query fails.
pub async fn reflect_tables<C: ConnectionTrait>(conn: &C) -> Result<Vec<TableSpec>> {
    let mut out = Vec::new();
    for name in table_names(conn).await? {
        if name.starts_with(VERSION_TABLE_PREFIX) {
            continue;
        }
        let columns = table_columns(conn, &name).await?;
        out.push(TableSpec { name, columns });
    }
    Ok(out)
}

/// Names of the user tables present in the database.
///
/// # Errors
/// Returns an error if the catalog query fails.
pub async fn table_names<C: ConnectionTrait>(conn: &C) -> Result<Vec<String>> {
    let backend = conn.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Sqlite => {
            "SELECT name AS table_name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        DatabaseBackend::Postgres => {
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
        DatabaseBackend::MySql => {
            "SELECT table_name AS table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
    };
    let rows = conn
        .query_all(Statement::from_string(backend, sql.to_owned()))
        .await?;
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        names.push(row.try_get::<String>("", "table_name")?);
    }
    Ok(names)
}

async fn table_columns<C: ConnectionTrait>(conn: &C, table: &str) -> Result<Vec<Column>> {
    let backend = conn.get_database_backend();
    match backend {
        DatabaseBackend::Sqlite => {
            let rows = conn
                .query_all(Statement::from_sql_and_values(
                    backend,
                    r#"SELECT name, type, "notnull" AS not_null, pk, dflt_value FROM pragma_table_info($1)"#,
                    [table.into()],
                ))
                .await?;
            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                let mut col = Column::new(
                    row.try_get::<String>("", "name")?,
                    SqlType::from_reflected(&row.try_get::<String>("", "type")?),
                );
                col.nullable = row.try_get::<i64>("", "not_null")? == 0;
                if row.try_get::<i64>("", "pk")? > 0 {
                    col = col.primary_key();
                }
                col.default = row.try_get::<Option<String>>("", "dflt_value")?;
                columns.push(col);
            }
            Ok(columns)
        }
        DatabaseBackend::Postgres => {
            let rows = conn
                .query_all(Statement::from_sql_and_values(
                    backend,
                    "SELECT c.column_name::text AS name, c.data_type::text AS data_type, \
                            c.is_nullable::text AS is_nullable, \
                            c.character_maximum_length::int4 AS max_len, \
                            c.column_default::text AS dflt_value, \
                            EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
                                    JOIN information_schema.key_column_usage kcu \
                                      ON tc.constraint_name = kcu.constraint_name \
                                     AND tc.table_schema = kcu.table_schema \
                                    WHERE tc.constraint_type = 'PRIMARY KEY' \
                                      AND tc.table_schema = c.table_schema \
                                      AND tc.table_name = c.table_name \
                                      AND kcu.column_name = c.column_name) AS pk \
                     FROM information_schema.columns c \
                     WHERE c.table_schema = current_schema() AND c.table_name = $1 \
                     ORDER BY c.ordinal_position",
                    [table.into()],
                ))
                .await?;
            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                let data_type = row.try_get::<String>("", "data_type")?;
                let sql_type = match row.try_get::<Option<i32>>("", "max_len")? {
                    Some(len) if len > 0 => {
                        SqlType::from_reflected(&format!("{data_type}({len})"))
                    }
                    _ => SqlType::from_reflected(&data_type),
                };
                let mut col = Column::new(row.try_get::<String>("", "name")?, sql_type);
                col.nullable = row.try_get::<String>("", "is_nullable")? == "YES";
                if row.try_get::<bool>("", "pk")? {
                    col = col.primary_key();
                }
                col.default = row.try_get::<Option<String>>("", "dflt_value")?;
                columns.push(col);
            }
            Ok(columns)
        }
        DatabaseBackend::MySql => {
            let rows = conn
                .query_all(Statement::from_sql_and_values(
                    backend,
                    "SELECT column_name AS name, column_type AS column_type, \
                            is_nullable AS is_nullable, column_key AS column_key, \
                            column_default AS dflt_value \
                     FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     ORDER BY ordinal_position",
                    [table.into()],
                ))
                .await?;
            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                let mut col = Column::new(
                    row.try_get::<String>("", "name")?,
                    SqlType::from_reflected(&row.try_get::<String>("", "column_type")?),
                );
                col.nullable = row.try_get::<String>("", "is_nullable")? == "YES";
                if row.try_get::<String>("", "column_key")? == "PRI" {
                    col = col.primary_key();
                }
                col.default = row.try_get::<Option<String>>("", "dflt_value")?;
                columns.push(col);
            }
            Ok(columns)
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn user_spec() -> TableSpec {
        TableSpec {
            name: "user".to_owned(),
            columns: vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("email", SqlType::String(Some(128))).unique(),
                Column::new("name", SqlType::String(Some(64))).index(),
                Column::new("group_id", SqlType::Integer).references("group", "id"),
            ],
        }
    }

    #[test]
    fn test_create_table_uses_naming_convention() {
        let stmts = create_table_statements(
            DatabaseBackend::Sqlite,
            &user_spec(),
            &NamingConvention::default(),
        );
        assert_eq!(stmts.len(), 2);
        let create = &stmts[0].sql;
        assert!(create.starts_with(r#"CREATE TABLE "user""#), "{create}");
        assert!(create.contains("uq_user_email"), "{create}");
        assert!(create.contains("fk_user_group_id_group"), "{create}");
        assert!(stmts[1].sql.contains("ix_user_name"), "{}", stmts[1].sql);
    }

    #[test]
    fn test_composite_primary_key_is_table_level() {
        let spec = TableSpec {
            name: "user_book".to_owned(),
            columns: vec![
                Column::new("user_id", SqlType::Integer).primary_key(),
                Column::new("book_id", SqlType::Integer).primary_key(),
            ],
        };
        let stmts =
            create_table_statements(DatabaseBackend::Sqlite, &spec, &NamingConvention::default());
        assert!(stmts[0].sql.contains("PRIMARY KEY"), "{}", stmts[0].sql);
        assert!(stmts[0].sql.contains("pk_user_book"), "{}", stmts[0].sql);
    }

    #[test]
    fn test_drop_table_statement() {
        let stmt = drop_table_statement(DatabaseBackend::Postgres, "user");
        assert_eq!(stmt.sql, r#"DROP TABLE "user""#);
    }
}
