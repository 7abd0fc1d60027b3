//! Plain and two-phase migration transactions issued as SQL on a dedicated connection.

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::debug;

use super::MigrationError;
use crate::database_url::Dialect;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionPhase {
    Active,
    Prepared,
    Finished,
}

/// A transaction spanning one migration context's whole run.
#[derive(Debug)]
pub struct MigrationTransaction {
    backend: DatabaseBackend,
    xid: Option<String>,
    phase: TransactionPhase,
}

impl MigrationTransaction {
    /// Statements that open the transaction.
    ///
    /// # Errors
    /// Returns `MigrationError::TwoPhaseUnsupported` for two-phase on sqlite.
    pub fn begin_statements(
        backend: DatabaseBackend,
        two_phase: bool,
    ) -> Result<(Self, Vec<String>)> {
        let xid = if two_phase {
            if backend == DatabaseBackend::Sqlite {
                return Err(MigrationError::TwoPhaseUnsupported(Dialect::Sqlite).into());
            }
            Some(format!("sqlbind_{}", uuid::Uuid::new_v4().simple()))
        } else {
            None
        };
        let sql = match (backend, &xid) {
            (DatabaseBackend::MySql, Some(xid)) => vec![format!("XA START '{xid}'")],
            (DatabaseBackend::MySql, None) => vec!["START TRANSACTION".to_owned()],
            (DatabaseBackend::Postgres | DatabaseBackend::Sqlite, _) => vec!["BEGIN".to_owned()],
        };
        Ok((
            Self {
                backend,
                xid,
                phase: TransactionPhase::Active,
            },
            sql,
        ))
    }

    /// Open a transaction on `conn`.
    ///
    /// # Errors
    /// See [`MigrationTransaction::begin_statements`]; driver errors otherwise.
    pub async fn begin(conn: &DatabaseConnection, two_phase: bool) -> Result<Self> {
        let backend = conn.get_database_backend();
        let (txn, sql) = Self::begin_statements(backend, two_phase)?;
        txn.run(conn, &sql).await?;
        debug!(two_phase, xid = txn.xid.as_deref(), "migration transaction begun");
        Ok(txn)
    }

    #[must_use]
    pub fn is_two_phase(&self) -> bool {
        self.xid.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    async fn run(&self, conn: &DatabaseConnection, sql: &[String]) -> Result<()> {
        for s in sql {
            conn.execute(Statement::from_string(self.backend, s.clone()))
                .await?;
        }
        Ok(())
    }

    /// First phase of two-phase commit; a no-op for plain transactions.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn prepare(&mut self, conn: &DatabaseConnection) -> Result<()> {
        let Some(xid) = &self.xid else {
            return Ok(());
        };
        let sql = match self.backend {
            DatabaseBackend::MySql => vec![format!("XA END '{xid}'"), format!("XA PREPARE '{xid}'")],
            DatabaseBackend::Postgres | DatabaseBackend::Sqlite => {
                vec![format!("PREPARE TRANSACTION '{xid}'")]
            }
        };
        self.run(conn, &sql).await?;
        self.phase = TransactionPhase::Prepared;
        Ok(())
    }

    /// # Errors
    /// Returns the driver error.
    pub async fn commit(&mut self, conn: &DatabaseConnection) -> Result<()> {
        let sql = match (&self.xid, self.backend, self.phase) {
            (Some(xid), DatabaseBackend::MySql, TransactionPhase::Prepared) => {
                vec![format!("XA COMMIT '{xid}'")]
            }
            (Some(xid), DatabaseBackend::MySql, _) => {
                vec![format!("XA END '{xid}'"), format!("XA COMMIT '{xid}' ONE PHASE")]
            }
            (Some(xid), _, TransactionPhase::Prepared) => vec![format!("COMMIT PREPARED '{xid}'")],
            _ => vec!["COMMIT".to_owned()],
        };
        self.run(conn, &sql).await?;
        self.phase = TransactionPhase::Finished;
        Ok(())
    }

    /// # Errors
    /// Returns the driver error.
    pub async fn rollback(&mut self, conn: &DatabaseConnection) -> Result<()> {
        let sql = match (&self.xid, self.backend, self.phase) {
            (_, _, TransactionPhase::Finished) => return Ok(()),
            (Some(xid), DatabaseBackend::MySql, TransactionPhase::Prepared) => {
                vec![format!("XA ROLLBACK '{xid}'")]
            }
            (Some(xid), DatabaseBackend::MySql, TransactionPhase::Active) => {
                vec![format!("XA END '{xid}'"), format!("XA ROLLBACK '{xid}'")]
            }
            (Some(xid), _, TransactionPhase::Prepared) => {
                vec![format!("ROLLBACK PREPARED '{xid}'")]
            }
            _ => vec!["ROLLBACK".to_owned()],
        };
        self.phase = TransactionPhase::Finished;
        self.run(conn, &sql).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_two_phase_is_rejected_on_sqlite() {
        let err = MigrationTransaction::begin_statements(DatabaseBackend::Sqlite, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Two-phase transactions are not supported by sqlite"
        );
    }

    #[test]
    fn test_begin_statements_per_dialect() {
        let (txn, sql) = MigrationTransaction::begin_statements(DatabaseBackend::Postgres, true).unwrap();
        assert!(txn.is_two_phase());
        assert_eq!(sql, ["BEGIN"]);

        let (_, sql) = MigrationTransaction::begin_statements(DatabaseBackend::MySql, true).unwrap();
        assert!(sql[0].starts_with("XA START 'sqlbind_"), "{sql:?}");

        let (txn, sql) = MigrationTransaction::begin_statements(DatabaseBackend::Sqlite, false).unwrap();
        assert!(!txn.is_two_phase());
        assert_eq!(sql, ["BEGIN"]);
    }
}
