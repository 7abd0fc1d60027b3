//! Diff a schema container against the live database.

use sea_orm::ConnectionTrait;
use std::collections::BTreeMap;

use super::context::ContextConfig;
use super::ops::Operation;
use crate::Result;
use crate::metadata::{SchemaContainer, TableSpec, ddl};

/// Upgrade operations turning the database into `metadata`, plus their inverse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub upgrade: Vec<Operation>,
    pub downgrade: Vec<Operation>,
}

impl SchemaDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upgrade.is_empty()
    }

    fn push(&mut self, upgrade: Operation, downgrade: Operation) {
        self.upgrade.push(upgrade);
        self.downgrade.insert(0, downgrade);
    }
}

/// Compare declared tables with reflected ones.
///
/// Tables rejected by `include_object` are ignored on both sides. Column types
/// are compared by family when `compare_type` is set.
#[must_use]
pub fn compare_specs(
    declared: &[(TableSpec, bool)],
    reflected: &[TableSpec],
    config: &ContextConfig,
) -> SchemaDiff {
    let mut diff = SchemaDiff::default();
    let live: BTreeMap<&str, &TableSpec> = reflected.iter().map(|t| (t.name.as_str(), t)).collect();

    for (spec, included) in declared {
        if !included {
            continue;
        }
        let Some(existing) = live.get(spec.name.as_str()) else {
            diff.push(
                Operation::CreateTable { table: spec.clone() },
                Operation::DropTable {
                    table: spec.name.clone(),
                },
            );
            continue;
        };
        compare_columns(&mut diff, spec, existing, config);
    }

    for existing in reflected {
        if declared.iter().any(|(spec, _)| spec.name == existing.name) {
            continue;
        }
        diff.push(
            Operation::DropTable {
                table: existing.name.clone(),
            },
            Operation::CreateTable {
                table: existing.clone(),
            },
        );
    }
    diff
}

fn compare_columns(
    diff: &mut SchemaDiff,
    declared: &TableSpec,
    existing: &TableSpec,
    config: &ContextConfig,
) {
    for column in &declared.columns {
        match existing.column(&column.name) {
            None => diff.push(
                Operation::AddColumn {
                    table: declared.name.clone(),
                    column: column.clone(),
                },
                Operation::DropColumn {
                    table: declared.name.clone(),
                    column: column.name.clone(),
                },
            ),
            Some(live) if config.compare_type && column.sql_type.differs_from(&live.sql_type) => {
                diff.push(
                    Operation::AlterColumn {
                        table: declared.name.clone(),
                        column: column.name.clone(),
                        sql_type: column.sql_type.clone(),
                        existing_type: Some(live.sql_type.clone()),
                        table_spec: Some(merged_spec(declared, existing)),
                    },
                    Operation::AlterColumn {
                        table: declared.name.clone(),
                        column: column.name.clone(),
                        sql_type: live.sql_type.clone(),
                        existing_type: Some(column.sql_type.clone()),
                        table_spec: Some(existing.clone()),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for live in &existing.columns {
        if declared.column(&live.name).is_none() {
            diff.push(
                Operation::DropColumn {
                    table: declared.name.clone(),
                    column: live.name.clone(),
                },
                Operation::AddColumn {
                    table: declared.name.clone(),
                    column: live.clone(),
                },
            );
        }
    }
}

/// The live table with declared column types applied, as seen right after
/// a type change (columns still to be added or dropped are left as they are).
fn merged_spec(declared: &TableSpec, existing: &TableSpec) -> TableSpec {
    TableSpec {
        name: existing.name.clone(),
        columns: existing
            .columns
            .iter()
            .map(|live| declared.column(&live.name).cloned().unwrap_or_else(|| live.clone()))
            .collect(),
    }
}

/// Reflect the database behind `conn` and diff `metadata` against it.
///
/// # Errors
/// Returns the driver error from reflection.
pub async fn compare<C: ConnectionTrait>(
    conn: &C,
    metadata: &SchemaContainer,
    config: &ContextConfig,
) -> Result<SchemaDiff> {
    let reflected = ddl::reflect_tables(conn).await?;
    let declared: Vec<(TableSpec, bool)> = metadata
        .tables()
        .iter()
        .map(|t| (t.spec(), (config.include_object)(t)))
        .collect();
    Ok(compare_specs(&declared, &reflected, config))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::migration::ContextConfigure;
    use crate::metadata::{Column, SqlType};

    fn account(name_type: SqlType) -> TableSpec {
        TableSpec {
            name: "account".to_owned(),
            columns: vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("name", name_type),
            ],
        }
    }

    #[test]
    fn test_identical_schema_has_no_diff() {
        let config = ContextConfig::from_options(&ContextConfigure::default());
        let spec = account(SqlType::String(Some(32)));
        let diff = compare_specs(&[(spec.clone(), true)], &[spec], &config);
        assert!(diff.is_empty());
        assert!(diff.downgrade.is_empty());
    }

    #[test]
    fn test_new_and_removed_tables() {
        let config = ContextConfig::from_options(&ContextConfigure::default());
        let stale = TableSpec {
            name: "legacy".to_owned(),
            columns: vec![Column::new("id", SqlType::Integer).primary_key()],
        };
        let diff = compare_specs(&[(account(SqlType::Text), true)], &[stale.clone()], &config);
        assert_eq!(
            diff.upgrade.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["add_table 'account'", "remove_table 'legacy'"]
        );
        assert_eq!(diff.downgrade[0], Operation::CreateTable { table: stale });
    }

    #[test]
    fn test_type_change_respects_compare_type() {
        let declared = [(account(SqlType::Text), true)];
        let live = [account(SqlType::Integer)];

        let config = ContextConfig::from_options(&ContextConfigure::default());
        let diff = compare_specs(&declared, &live, &config);
        assert_eq!(diff.upgrade.len(), 1);
        assert!(matches!(diff.upgrade[0], Operation::AlterColumn { .. }));

        let config = ContextConfig::from_options(&ContextConfigure {
            compare_type: false,
            ..ContextConfigure::default()
        });
        assert!(compare_specs(&declared, &live, &config).is_empty());
    }

    #[test]
    fn test_excluded_tables_are_ignored_but_not_dropped() {
        let config = ContextConfig::from_options(&ContextConfigure::default());
        let diff = compare_specs(&[(account(SqlType::Text), false)], &[], &config);
        assert!(diff.is_empty());

        let diff = compare_specs(
            &[(account(SqlType::Text), false)],
            &[account(SqlType::Integer)],
            &config,
        );
        assert!(diff.is_empty());
    }
}
