//! Migration operations and their DDL.

use sea_orm::sea_query::{Alias, Index, Table as SeaTable};
use sea_orm::{DatabaseBackend, Statement};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::MigrationError;
use crate::Result;
use crate::metadata::{Column, NamingConvention, SqlType, TableSpec, ddl};

/// Prefix of the scratch table used by sqlite batch alters.
pub const BATCH_TABLE_PREFIX: &str = "_sqlbind_tmp_";

/// One schema change inside a revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable {
        table: TableSpec,
    },
    DropTable {
        table: String,
    },
    AddColumn {
        table: String,
        column: Column,
    },
    DropColumn {
        table: String,
        column: String,
    },
    /// Column type change. `table_spec` is the full table after the change,
    /// needed when the dialect can only alter by recreating the table.
    AlterColumn {
        table: String,
        column: String,
        sql_type: SqlType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing_type: Option<SqlType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table_spec: Option<TableSpec>,
    },
    CreateIndex {
        table: String,
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        unique: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    /// Raw SQL.
    Execute {
        sql: String,
    },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable { table } => write!(f, "add_table '{}'", table.name),
            Operation::DropTable { table } => write!(f, "remove_table '{table}'"),
            Operation::AddColumn { table, column } => {
                write!(f, "add_column '{table}.{}'", column.name)
            }
            Operation::DropColumn { table, column } => {
                write!(f, "remove_column '{table}.{column}'")
            }
            Operation::AlterColumn {
                table,
                column,
                sql_type,
                existing_type,
                ..
            } => match existing_type {
                Some(existing) => {
                    write!(f, "modify_type '{table}.{column}' {existing} -> {sql_type}")
                }
                None => write!(f, "modify_type '{table}.{column}' -> {sql_type}"),
            },
            Operation::CreateIndex { table, column, .. } => {
                write!(f, "add_index '{table}.{column}'")
            }
            Operation::DropIndex { name, .. } => write!(f, "remove_index '{name}'"),
            Operation::Execute { sql } => write!(f, "execute '{sql}'"),
        }
    }
}

fn quote(backend: DatabaseBackend, ident: &str) -> String {
    match backend {
        DatabaseBackend::MySql => format!("`{ident}`"),
        DatabaseBackend::Postgres | DatabaseBackend::Sqlite => format!(r#""{ident}""#),
    }
}

impl Operation {
    /// Render the statements that apply this operation.
    ///
    /// # Errors
    /// Returns `MigrationError::UnsupportedOperation` when the dialect cannot
    /// express the change with the given settings.
    pub fn statements(
        &self,
        backend: DatabaseBackend,
        conv: &NamingConvention,
        render_as_batch: bool,
    ) -> Result<Vec<Statement>> {
        let stmts = match self {
            Operation::CreateTable { table } => ddl::create_table_statements(backend, table, conv),
            Operation::DropTable { table } => vec![ddl::drop_table_statement(backend, table)],
            Operation::AddColumn { table, column } => {
                let mut alter = SeaTable::alter();
                alter
                    .table(Alias::new(table))
                    .add_column(column.to_column_def(false));
                let mut out = vec![backend.build(&alter)];
                if column.index && !column.unique {
                    out.push(ddl::create_index_statement(backend, table, column, conv));
                }
                out
            }
            Operation::DropColumn { table, column } => {
                let mut alter = SeaTable::alter();
                alter.table(Alias::new(table)).drop_column(Alias::new(column));
                vec![backend.build(&alter)]
            }
            Operation::AlterColumn {
                table,
                column,
                sql_type,
                table_spec,
                ..
            } => {
                if backend == DatabaseBackend::Sqlite {
                    if !render_as_batch {
                        return Err(self.unsupported(
                            "sqlite can only change column types with render_as_batch enabled",
                        ));
                    }
                    let Some(spec) = table_spec else {
                        return Err(self.unsupported("batch alter needs the table definition"));
                    };
                    return Ok(batch_recreate(backend, spec, conv));
                }
                let mut col = table_spec
                    .as_ref()
                    .and_then(|spec| spec.column(column))
                    .cloned()
                    .unwrap_or_else(|| Column::new(column.clone(), sql_type.clone()));
                col.sql_type = sql_type.clone();
                let mut alter = SeaTable::alter();
                alter
                    .table(Alias::new(table))
                    .modify_column(col.to_column_def(false));
                vec![backend.build(&alter)]
            }
            Operation::CreateIndex {
                table,
                column,
                name,
                unique,
            } => {
                let mut idx = Index::create();
                idx.name(
                    name.clone()
                        .unwrap_or_else(|| ddl::index_name(table, column, conv)),
                )
                .table(Alias::new(table))
                .col(Alias::new(column));
                if *unique {
                    idx.unique();
                }
                vec![backend.build(&idx)]
            }
            Operation::DropIndex { table, name } => {
                vec![ddl::drop_index_statement(backend, table, name)]
            }
            Operation::Execute { sql } => vec![Statement::from_string(backend, sql.clone())],
        };
        Ok(stmts)
    }

    fn unsupported(&self, reason: &str) -> crate::DbError {
        MigrationError::UnsupportedOperation {
            op: self.to_string(),
            reason: reason.to_owned(),
        }
        .into()
    }
}

/// Recreate a table with a new definition, keeping its rows.
///
/// Creates a scratch table, copies every column over, drops the original,
/// renames the scratch table into place and recreates column indexes.
#[must_use]
pub fn batch_recreate(
    backend: DatabaseBackend,
    spec: &TableSpec,
    conv: &NamingConvention,
) -> Vec<Statement> {
    let scratch = TableSpec {
        name: format!("{BATCH_TABLE_PREFIX}{}", spec.name),
        columns: spec.columns.clone(),
    };
    let mut out = Vec::new();
    out.extend(
        ddl::create_table_statements(backend, &scratch, conv)
            .into_iter()
            .take(1),
    );

    let columns = spec
        .columns
        .iter()
        .map(|c| quote(backend, &c.name))
        .collect::<Vec<_>>()
        .join(", ");
    out.push(Statement::from_string(
        backend,
        format!(
            "INSERT INTO {scratch_name} ({columns}) SELECT {columns} FROM {name}",
            scratch_name = quote(backend, &scratch.name),
            name = quote(backend, &spec.name),
        ),
    ));
    out.push(ddl::drop_table_statement(backend, &spec.name));
    out.push(backend.build(
        SeaTable::rename().table(Alias::new(&scratch.name), Alias::new(&spec.name)),
    ));
    for col in spec.columns.iter().filter(|c| c.index && !c.unique) {
        out.push(ddl::create_index_statement(backend, &spec.name, col, conv));
    }
    out
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn spec() -> TableSpec {
        TableSpec {
            name: "account".to_owned(),
            columns: vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("name", SqlType::Text).index(),
            ],
        }
    }

    fn alter() -> Operation {
        Operation::AlterColumn {
            table: "account".to_owned(),
            column: "name".to_owned(),
            sql_type: SqlType::Text,
            existing_type: Some(SqlType::String(Some(32))),
            table_spec: Some(spec()),
        }
    }

    #[test]
    fn test_display_reads_like_a_diff() {
        assert_eq!(alter().to_string(), "modify_type 'account.name' VARCHAR(32) -> TEXT");
        assert_eq!(
            Operation::CreateTable { table: spec() }.to_string(),
            "add_table 'account'"
        );
    }

    #[test]
    fn test_sqlite_alter_is_a_batch_recreate() {
        let stmts = alter()
            .statements(DatabaseBackend::Sqlite, &NamingConvention::default(), true)
            .unwrap();
        let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql.len(), 5, "{sql:?}");
        assert!(sql[0].starts_with(r#"CREATE TABLE "_sqlbind_tmp_account""#));
        assert!(sql[1].starts_with(r#"INSERT INTO "_sqlbind_tmp_account" ("id", "name")"#));
        assert_eq!(sql[2], r#"DROP TABLE "account""#);
        assert!(sql[3].contains("RENAME TO"));
        assert!(sql[4].contains("ix_account_name"));
    }

    #[test]
    fn test_sqlite_alter_without_batch_is_rejected() {
        let err = alter()
            .statements(DatabaseBackend::Sqlite, &NamingConvention::default(), false)
            .unwrap_err();
        assert!(err.to_string().contains("render_as_batch"), "{err}");
    }

    #[test]
    fn test_postgres_alter_modifies_in_place() {
        let stmts = alter()
            .statements(DatabaseBackend::Postgres, &NamingConvention::default(), true)
            .unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].sql.contains(r#"ALTER COLUMN "name" TYPE text"#), "{}", stmts[0].sql);
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let op = Operation::DropColumn {
            table: "account".to_owned(),
            column: "name".to_owned(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "drop_column");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
