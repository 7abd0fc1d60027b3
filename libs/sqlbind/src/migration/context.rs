//! Per-engine migration execution context.

use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ContextConfigure, MigrationError};
use super::autogen::{self, SchemaDiff};
use super::history;
use super::ops::Operation;
use super::script::{Revision, RevisionScript, ScriptDirectory};
use super::transaction::MigrationTransaction;
use crate::Result;
use crate::engine::{DbPool, Engine};
use crate::metadata::{SchemaContainer, Table};

/// Filter deciding which tables autogeneration looks at.
pub type IncludeObject = Arc<dyn Fn(&Table) -> bool + Send + Sync>;

/// Hook that may rewrite or drop revisions produced by autogeneration.
pub type RevisionDirectives = Arc<dyn Fn(&mut Vec<RevisionScript>) + Send + Sync>;

/// Settings for every migration context of a run.
#[derive(Clone)]
pub struct ContextConfig {
    pub compare_type: bool,
    pub render_as_batch: bool,
    pub include_object: IncludeObject,
    /// Replaces the environment's own directive processing when set.
    pub process_revision_directives: Option<RevisionDirectives>,
}

impl ContextConfig {
    /// Configuration from `context_configure`, with tables marked
    /// `skip_autogen` excluded.
    #[must_use]
    pub fn from_options(options: &ContextConfigure) -> Self {
        Self {
            compare_type: options.compare_type,
            render_as_batch: options.render_as_batch,
            include_object: Arc::new(|table: &Table| !table.skip_autogen()),
            process_revision_directives: None,
        }
    }

    #[must_use]
    pub fn with_include_object(
        mut self,
        include: impl Fn(&Table) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.include_object = Arc::new(include);
        self
    }

    #[must_use]
    pub fn with_revision_directives(
        mut self,
        hook: impl Fn(&mut Vec<RevisionScript>) + Send + Sync + 'static,
    ) -> Self {
        self.process_revision_directives = Some(Arc::new(hook));
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from_options(&ContextConfigure::default())
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("compare_type", &self.compare_type)
            .field("render_as_batch", &self.render_as_batch)
            .field(
                "process_revision_directives",
                &self.process_revision_directives.is_some(),
            )
            .finish_non_exhaustive()
    }
}

/// What a context does once configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationAction {
    Upgrade { target: String },
    Downgrade { target: String },
    /// Rewrite the history table without running any operation.
    Stamp { target: String },
    /// Diff the target metadata against the database.
    Autogenerate,
    /// Only read the current heads.
    Current,
}

/// Outcome of running one context.
#[derive(Clone, Debug, Default)]
pub struct ContextReport {
    pub bind_key: String,
    pub upgrade_token: String,
    pub downgrade_token: String,
    /// Revisions applied, reverted or stamped, in execution order.
    pub revisions: Vec<String>,
    /// Heads recorded in the history table after the run.
    pub current_heads: Vec<String>,
    pub diff: Option<SchemaDiff>,
}

struct Connection {
    conn: DatabaseConnection,
    pool: DbPool,
    owns_pool: bool,
}

/// Binds one engine, its schema container and its token pair to a run.
pub struct MigrationContext {
    engine: Arc<Engine>,
    metadata: Arc<SchemaContainer>,
    upgrade_token: String,
    downgrade_token: String,
    config: ContextConfig,
    version_table: String,
    connection: Option<Connection>,
    txn: Option<MigrationTransaction>,
}

impl fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("bind_key", &self.engine.bind_key())
            .field("upgrade_token", &self.upgrade_token)
            .field("downgrade_token", &self.downgrade_token)
            .field("version_table", &self.version_table)
            .field("connected", &self.connection.is_some())
            .field("transaction", &self.txn)
            .finish_non_exhaustive()
    }
}

impl MigrationContext {
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        metadata: Arc<SchemaContainer>,
        upgrade_token: impl Into<String>,
        downgrade_token: impl Into<String>,
        config: ContextConfig,
    ) -> Self {
        let version_table = history::version_table_name(engine.bind_key());
        Self {
            engine,
            metadata,
            upgrade_token: upgrade_token.into(),
            downgrade_token: downgrade_token.into(),
            config,
            version_table,
            connection: None,
            txn: None,
        }
    }

    #[must_use]
    pub fn bind_key(&self) -> &str {
        self.engine.bind_key()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub fn upgrade_token(&self) -> &str {
        &self.upgrade_token
    }

    #[must_use]
    pub fn downgrade_token(&self) -> &str {
        &self.downgrade_token
    }

    #[must_use]
    pub fn version_table(&self) -> &str {
        &self.version_table
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn conn(&self) -> Result<&DatabaseConnection> {
        self.connection
            .as_ref()
            .map(|c| &c.conn)
            .ok_or_else(|| {
                MigrationError::Usage(format!(
                    "Migration context for '{}' is not connected",
                    self.bind_key()
                ))
                .into()
            })
    }

    /// Open the context's single connection.
    ///
    /// Static-pool engines lend their own pool, every other engine gets a
    /// fresh single-connection pool.
    ///
    /// # Errors
    /// Returns the driver error if the connection cannot be established.
    pub async fn connect(&mut self) -> Result<()> {
        let pool = self.engine.dedicated_pool();
        let conn = pool.sea_connection();
        conn.ping().await?;
        self.connection = Some(Connection {
            conn,
            pool,
            owns_pool: !self.engine.is_static_pool(),
        });
        Ok(())
    }

    /// Make sure the history table exists.
    ///
    /// Runs before [`MigrationContext::begin`] since XA transactions cannot hold DDL.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn configure(&mut self) -> Result<()> {
        let conn = self.conn()?;
        history::ensure_version_table(conn, &self.version_table).await
    }

    /// # Errors
    /// Returns `TwoPhaseUnsupported` on sqlite with `two_phase`, or the driver error.
    pub async fn begin(&mut self, two_phase: bool) -> Result<()> {
        let txn = MigrationTransaction::begin(self.conn()?, two_phase).await?;
        self.txn = Some(txn);
        Ok(())
    }

    /// # Errors
    /// Returns the driver error.
    pub async fn prepare(&mut self) -> Result<()> {
        let Some(conn) = self.connection.as_ref().map(|c| &c.conn) else {
            return Ok(());
        };
        match self.txn.as_mut() {
            Some(txn) => txn.prepare(conn).await,
            None => Ok(()),
        }
    }

    /// # Errors
    /// Returns the driver error.
    pub async fn commit(&mut self) -> Result<()> {
        let Some(conn) = self.connection.as_ref().map(|c| &c.conn) else {
            return Ok(());
        };
        match self.txn.take() {
            Some(mut txn) => txn.commit(conn).await,
            None => Ok(()),
        }
    }

    /// Roll back the open transaction, if any.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(conn) = self.connection.as_ref().map(|c| &c.conn) else {
            return Ok(());
        };
        match self.txn.take() {
            Some(mut txn) => txn.rollback(conn).await,
            None => Ok(()),
        }
    }

    /// Release the connection; pools owned by the context are closed.
    pub async fn close(&mut self) {
        self.txn = None;
        if let Some(connection) = self.connection.take()
            && connection.owns_pool
        {
            connection.pool.close().await;
        }
        debug!(bind_key = self.bind_key(), "migration context closed");
    }

    async fn execute(&self, stmt: Statement) -> Result<()> {
        self.engine.log_statement(&stmt);
        self.conn()?.execute(stmt).await?;
        Ok(())
    }

    async fn apply_ops(&self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            for stmt in op.statements(
                self.engine.backend(),
                self.metadata.naming_convention(),
                self.config.render_as_batch,
            )? {
                self.execute(stmt).await?;
            }
        }
        Ok(())
    }

    /// Revisions recorded in the history table.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn applied(&self) -> Result<BTreeSet<String>> {
        history::applied_revisions(self.conn()?, &self.version_table).await
    }

    /// Current heads of this database.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn current_heads(&self, scripts: &ScriptDirectory) -> Result<Vec<String>> {
        Ok(scripts.current_heads(&self.applied().await?))
    }

    /// Diff the target metadata against the connected database.
    ///
    /// # Errors
    /// Returns the driver error from reflection.
    pub async fn autogenerate(&self) -> Result<SchemaDiff> {
        autogen::compare(self.conn()?, &self.metadata, &self.config).await
    }

    /// Run `action` inside the open transaction.
    ///
    /// # Errors
    /// Returns revision lookup errors or the first failing statement.
    pub async fn run_migrations(
        &mut self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<ContextReport> {
        let backend = self.engine.backend();
        let applied = self.applied().await?;
        let mut report = ContextReport {
            bind_key: self.bind_key().to_owned(),
            upgrade_token: self.upgrade_token.clone(),
            downgrade_token: self.downgrade_token.clone(),
            ..ContextReport::default()
        };

        match action {
            MigrationAction::Upgrade { target } => {
                for revision in scripts.upgrade_plan(&applied, target)? {
                    info!(bind_key = self.bind_key(), "Running upgrade {}", upgrade_label(revision));
                    self.apply_ops(revision.ops(&self.upgrade_token)).await?;
                    self.execute(history::insert_statement(
                        backend,
                        &self.version_table,
                        &revision.revision,
                    ))
                    .await?;
                    report.revisions.push(revision.revision.clone());
                }
            }
            MigrationAction::Downgrade { target } => {
                for revision in scripts.downgrade_plan(&applied, target)? {
                    info!(bind_key = self.bind_key(), "Running downgrade {}", downgrade_label(revision));
                    self.apply_ops(revision.ops(&self.downgrade_token)).await?;
                    self.execute(history::delete_statement(
                        backend,
                        &self.version_table,
                        &revision.revision,
                    ))
                    .await?;
                    report.revisions.push(revision.revision.clone());
                }
            }
            MigrationAction::Stamp { target } => {
                let wanted = stamp_set(scripts, target)?;
                for stale in applied.difference(&wanted) {
                    self.execute(history::delete_statement(backend, &self.version_table, stale))
                        .await?;
                }
                for missing in wanted.difference(&applied) {
                    self.execute(history::insert_statement(backend, &self.version_table, missing))
                        .await?;
                    report.revisions.push(missing.clone());
                }
            }
            MigrationAction::Autogenerate => {
                report.diff = Some(self.autogenerate().await?);
            }
            MigrationAction::Current => {}
        }

        report.current_heads = self.current_heads(scripts).await?;
        Ok(report)
    }

    /// Render `action` as SQL without connecting.
    ///
    /// `applied` stands in for the history table, typically the ancestors of
    /// the `from` half of a `from:to` range.
    ///
    /// # Errors
    /// Returns revision lookup errors, or `Usage` for actions that need a database.
    pub fn render_migrations(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
        applied: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let backend = self.engine.backend();
        let mut out = vec![terminated(&history::create_statement(backend, &self.version_table))];

        let plan_ops = |revision: &Revision, token: &str| -> Result<Vec<String>> {
            let mut sql = Vec::new();
            for op in revision.ops(token) {
                for stmt in op.statements(
                    backend,
                    self.metadata.naming_convention(),
                    self.config.render_as_batch,
                )? {
                    sql.push(terminated(&stmt));
                }
            }
            Ok(sql)
        };

        match action {
            MigrationAction::Upgrade { target } => {
                for revision in scripts.upgrade_plan(applied, target)? {
                    out.push(format!("-- Running upgrade {}", upgrade_label(revision)));
                    out.extend(plan_ops(revision, &self.upgrade_token)?);
                    out.push(terminated(&history::insert_statement(
                        backend,
                        &self.version_table,
                        &revision.revision,
                    )));
                }
            }
            MigrationAction::Downgrade { target } => {
                for revision in scripts.downgrade_plan(applied, target)? {
                    out.push(format!("-- Running downgrade {}", downgrade_label(revision)));
                    out.extend(plan_ops(revision, &self.downgrade_token)?);
                    out.push(terminated(&history::delete_statement(
                        backend,
                        &self.version_table,
                        &revision.revision,
                    )));
                }
            }
            MigrationAction::Stamp { target } => {
                let wanted = stamp_set(scripts, target)?;
                for stale in applied.difference(&wanted) {
                    out.push(terminated(&history::delete_statement(backend, &self.version_table, stale)));
                }
                for missing in wanted.difference(applied) {
                    out.push(terminated(&history::insert_statement(
                        backend,
                        &self.version_table,
                        missing,
                    )));
                }
            }
            MigrationAction::Autogenerate | MigrationAction::Current => {
                return Err(MigrationError::Usage(
                    "This command needs a database connection and can't run in --sql mode".to_owned(),
                )
                .into());
            }
        }
        Ok(out)
    }
}

fn stamp_set(scripts: &ScriptDirectory, target: &str) -> Result<BTreeSet<String>> {
    let targets = scripts.resolve_targets(target)?;
    Ok(scripts.ancestors(targets.iter().map(String::as_str)))
}

fn upgrade_label(revision: &Revision) -> String {
    let down = if revision.down_revisions.is_empty() {
        String::new()
    } else {
        revision.down_revisions.join(", ")
    };
    format!(
        "{down} -> {}, {}",
        revision.revision,
        revision.message.as_deref().unwrap_or_default()
    )
}

fn downgrade_label(revision: &Revision) -> String {
    format!(
        "{} -> {}, {}",
        revision.revision,
        revision.down_revisions.join(", "),
        revision.message.as_deref().unwrap_or_default()
    )
}

/// Statement text with inlined values and a trailing semicolon.
fn terminated(stmt: &Statement) -> String {
    format!("{stmt};")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::metadata::{Column, SqlType};
    use crate::migration::ScriptDirectory;
    use std::collections::BTreeMap;

    fn memory_engine(key: &str) -> Arc<Engine> {
        Arc::new(Engine::from_options(key, EngineOptions::with_url("sqlite://"), false, None).unwrap())
    }

    fn scripts_with_account(dir: &std::path::Path) -> (ScriptDirectory, String) {
        ScriptDirectory::init(dir, false).unwrap();
        let mut scripts = ScriptDirectory::load(dir).unwrap();
        let table = crate::metadata::TableSpec {
            name: "account".to_owned(),
            columns: vec![Column::new("id", SqlType::Integer).primary_key()],
        };
        let mut upgrade_ops = BTreeMap::new();
        upgrade_ops.insert("upgrades".to_owned(), vec![Operation::CreateTable { table }]);
        let mut downgrade_ops = BTreeMap::new();
        downgrade_ops.insert(
            "downgrades".to_owned(),
            vec![Operation::DropTable {
                table: "account".to_owned(),
            }],
        );
        let revision = RevisionScript {
            rev_id: "a1".to_owned(),
            message: Some("account".to_owned()),
            upgrade_ops,
            downgrade_ops,
            ..RevisionScript::default()
        };
        let written = scripts.write(revision.into_revision()).unwrap();
        (scripts, written.revision)
    }

    #[test]
    fn test_default_config_skips_marked_tables() {
        let metadata = SchemaContainer::new();
        let table = metadata
            .define_table("hidden", vec![Column::new("id", SqlType::Integer).primary_key()])
            .unwrap();
        let config = ContextConfig::default();
        assert!((config.include_object)(&table));
        table.set_info(crate::metadata::SKIP_AUTOGEN, serde_json::Value::Bool(true));
        assert!(!(config.include_object)(&table));
    }

    #[tokio::test]
    async fn test_upgrade_then_downgrade_on_memory_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (scripts, rev) = scripts_with_account(&dir.path().join("migrations"));
        let engine = memory_engine("context_memory");
        let mut ctx = MigrationContext::new(
            Arc::clone(&engine),
            SchemaContainer::new(),
            "upgrades",
            "downgrades",
            ContextConfig::default(),
        );

        ctx.connect().await.unwrap();
        ctx.configure().await.unwrap();
        ctx.begin(false).await.unwrap();
        let report = ctx
            .run_migrations(&MigrationAction::Upgrade { target: "head".to_owned() }, &scripts)
            .await
            .unwrap();
        ctx.commit().await.unwrap();
        assert_eq!(report.revisions, [rev.clone()]);
        assert_eq!(report.current_heads, [rev.clone()]);
        assert!(engine.has_table("account").await.unwrap());

        ctx.begin(false).await.unwrap();
        let report = ctx
            .run_migrations(&MigrationAction::Downgrade { target: "base".to_owned() }, &scripts)
            .await
            .unwrap();
        ctx.commit().await.unwrap();
        ctx.close().await;
        assert_eq!(report.revisions, [rev]);
        assert!(report.current_heads.is_empty());
        assert!(!engine.has_table("account").await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_discards_applied_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (scripts, _) = scripts_with_account(&dir.path().join("migrations"));
        let engine = memory_engine("context_rollback");
        let mut ctx = MigrationContext::new(
            Arc::clone(&engine),
            SchemaContainer::new(),
            "upgrades",
            "downgrades",
            ContextConfig::default(),
        );
        ctx.connect().await.unwrap();
        ctx.configure().await.unwrap();
        ctx.begin(false).await.unwrap();
        ctx.run_migrations(&MigrationAction::Upgrade { target: "heads".to_owned() }, &scripts)
            .await
            .unwrap();
        ctx.rollback().await.unwrap();
        assert!(ctx.applied().await.unwrap().is_empty());
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_offline_render_includes_history_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let (scripts, rev) = scripts_with_account(&dir.path().join("migrations"));
        let ctx = MigrationContext::new(
            memory_engine("context_offline"),
            SchemaContainer::new(),
            "upgrades",
            "downgrades",
            ContextConfig::default(),
        );
        let sql = ctx
            .render_migrations(
                &MigrationAction::Upgrade { target: "head".to_owned() },
                &scripts,
                &BTreeSet::new(),
            )
            .unwrap();
        assert!(sql[0].starts_with("CREATE TABLE IF NOT EXISTS"), "{sql:?}");
        assert!(sql.iter().any(|s| s.starts_with(r#"CREATE TABLE "account""#)), "{sql:?}");
        let last = sql.last().unwrap();
        assert!(last.starts_with("INSERT INTO") && last.contains(&rev), "{last}");

        let err = ctx
            .render_migrations(&MigrationAction::Autogenerate, &scripts, &BTreeSet::new())
            .unwrap_err();
        assert!(err.to_string().contains("--sql"), "{err}");
    }
}
