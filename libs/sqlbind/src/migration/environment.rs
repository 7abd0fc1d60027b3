//! Single- and multi-database migration environments.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::context::{ContextConfig, ContextReport, MigrationAction, MigrationContext};
use super::script::{RevisionScript, ScriptDirectory};
use super::MigrationError;
use crate::engine::Engine;
use crate::manager::EngineManager;
use crate::metadata::MetadataRegistry;
use crate::{DEFAULT_KEY, DbError, Result};

const NO_CHANGES: &str = "No changes in schema detected.";

/// Lifecycle of one migration run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationState {
    NotStarted,
    Connected,
    Configured,
    MigrationsApplied,
    Prepared,
    Committed,
    RolledBack,
    Closed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationState::NotStarted => "NOT_STARTED",
            MigrationState::Connected => "CONNECTED",
            MigrationState::Configured => "CONFIGURED",
            MigrationState::MigrationsApplied => "MIGRATIONS_APPLIED",
            MigrationState::Prepared => "PREPARED",
            MigrationState::Committed => "COMMITTED",
            MigrationState::RolledBack => "ROLLED_BACK",
            MigrationState::Closed => "CLOSED",
        })
    }
}

/// States visited and per-database reports of a finished run.
#[derive(Clone, Debug)]
pub struct MigrationRun {
    pub states: Vec<MigrationState>,
    pub reports: Vec<ContextReport>,
}

impl Default for MigrationRun {
    fn default() -> Self {
        Self {
            states: vec![MigrationState::NotStarted],
            reports: Vec::new(),
        }
    }
}

impl MigrationRun {
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.states
            .last()
            .copied()
            .unwrap_or(MigrationState::NotStarted)
    }

    fn transition(&mut self, state: MigrationState) {
        debug!(from = %self.state(), state = %state, "migration state changed");
        self.states.push(state);
    }

    /// Report of one bind key.
    #[must_use]
    pub fn report(&self, bind_key: &str) -> Option<&ContextReport> {
        self.reports.iter().find(|r| r.bind_key == bind_key)
    }

    /// Assemble an autogenerated revision from every context's diff.
    #[must_use]
    pub fn revision_script(&self, rev_id: String, message: Option<String>) -> RevisionScript {
        let mut script = RevisionScript {
            rev_id,
            message,
            ..RevisionScript::default()
        };
        for report in &self.reports {
            let diff = report.diff.clone().unwrap_or_default();
            script
                .upgrade_ops
                .insert(report.upgrade_token.clone(), diff.upgrade);
            script
                .downgrade_ops
                .insert(report.downgrade_token.clone(), diff.downgrade);
        }
        script
    }
}

/// How migration commands reach the configured databases.
#[async_trait]
pub trait MigrationEnvironment: Send + Sync {
    /// Fresh, unconnected contexts, one per engine.
    fn contexts(&self) -> Vec<MigrationContext>;

    /// Apply `action` against live connections.
    async fn run_online(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<MigrationRun>;

    /// Render `action` as SQL, treating `applied` as the recorded history.
    ///
    /// Single-database environments write to `out`; multi-database ones write
    /// one `<bind_key>.sql` file each and list the files on `out`.
    fn run_offline(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
        applied: &BTreeSet<String>,
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Default filtering of autogenerated revisions before they are written.
    fn suppress_empty(&self, directives: &mut Vec<RevisionScript>);

    fn config(&self) -> &ContextConfig;

    /// Run the configured directive hook, or [`MigrationEnvironment::suppress_empty`].
    fn process_revision_directives(&self, directives: &mut Vec<RevisionScript>) {
        match &self.config().process_revision_directives {
            Some(hook) => hook(directives),
            None => self.suppress_empty(directives),
        }
    }
}

fn metadata_for(engine: &Engine) -> Arc<crate::metadata::SchemaContainer> {
    MetadataRegistry::make_or_get(engine.bind_key()).metadata
}

/// Rolls back and closes every context, whatever happened before.
async fn finish(contexts: &mut [MigrationContext], run: &mut MigrationRun, failed: bool) {
    if failed && run.state() >= MigrationState::Connected {
        for ctx in contexts.iter_mut() {
            if let Err(e) = ctx.rollback().await {
                error!(bind_key = ctx.bind_key(), error = %e, "rollback failed");
            }
        }
        run.transition(MigrationState::RolledBack);
    }
    for ctx in contexts.iter_mut() {
        ctx.close().await;
    }
    run.transition(MigrationState::Closed);
}

fn engine_error(bind_key: &str, source: DbError) -> DbError {
    MigrationError::Engine {
        bind_key: bind_key.to_owned(),
        source: Box::new(source),
    }
    .into()
}

/// One engine, one transaction.
pub struct SingleDatabase {
    engine: Arc<Engine>,
    config: ContextConfig,
}

impl fmt::Debug for SingleDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleDatabase")
            .field("bind_key", &self.engine.bind_key())
            .field("config", &self.config)
            .finish()
    }
}

impl SingleDatabase {
    #[must_use]
    pub fn new(engine: Arc<Engine>, config: ContextConfig) -> Self {
        Self { engine, config }
    }

    fn context(&self) -> MigrationContext {
        MigrationContext::new(
            Arc::clone(&self.engine),
            metadata_for(&self.engine),
            "upgrades",
            "downgrades",
            self.config.clone(),
        )
    }

    async fn drive(
        ctx: &mut MigrationContext,
        run: &mut MigrationRun,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<ContextReport> {
        ctx.connect().await?;
        run.transition(MigrationState::Connected);
        ctx.configure().await?;
        ctx.begin(false).await?;
        run.transition(MigrationState::Configured);
        let report = ctx.run_migrations(action, scripts).await?;
        run.transition(MigrationState::MigrationsApplied);
        ctx.commit().await?;
        run.transition(MigrationState::Committed);
        Ok(report)
    }
}

#[async_trait]
impl MigrationEnvironment for SingleDatabase {
    fn contexts(&self) -> Vec<MigrationContext> {
        vec![self.context()]
    }

    async fn run_online(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<MigrationRun> {
        let mut run = MigrationRun::default();
        let mut contexts = self.contexts();
        let result = match contexts.first_mut() {
            Some(ctx) => Self::drive(ctx, &mut run, action, scripts).await,
            None => Err(MigrationError::Usage("no engine configured".to_owned()).into()),
        };
        finish(&mut contexts, &mut run, result.is_err()).await;
        run.reports.push(result?);
        Ok(run)
    }

    fn run_offline(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
        applied: &BTreeSet<String>,
        out: &mut dyn Write,
    ) -> Result<()> {
        for sql in self.context().render_migrations(action, scripts, applied)? {
            writeln!(out, "{sql}")?;
        }
        Ok(())
    }

    fn suppress_empty(&self, directives: &mut Vec<RevisionScript>) {
        if directives.first().is_some_and(RevisionScript::upgrades_empty) {
            directives.clear();
            info!("{NO_CHANGES}");
        }
    }

    fn config(&self) -> &ContextConfig {
        &self.config
    }
}

/// Several engines migrated together, committed only after all succeeded.
pub struct MultipleDatabase {
    engines: Vec<Arc<Engine>>,
    config: ContextConfig,
    use_two_phase: bool,
    sql_dir: PathBuf,
}

impl fmt::Debug for MultipleDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipleDatabase")
            .field(
                "bind_keys",
                &self.engines.iter().map(|e| e.bind_key()).collect::<Vec<_>>(),
            )
            .field("use_two_phase", &self.use_two_phase)
            .field("sql_dir", &self.sql_dir)
            .finish_non_exhaustive()
    }
}

impl MultipleDatabase {
    /// Offline SQL files are written into `sql_dir`.
    #[must_use]
    pub fn new(
        engines: Vec<Arc<Engine>>,
        config: ContextConfig,
        use_two_phase: bool,
        sql_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engines,
            config,
            use_two_phase,
            sql_dir: sql_dir.into(),
        }
    }

    #[must_use]
    pub fn sql_dir(&self) -> &Path {
        &self.sql_dir
    }

    async fn drive(
        &self,
        contexts: &mut [MigrationContext],
        run: &mut MigrationRun,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<Vec<ContextReport>> {
        for ctx in contexts.iter_mut() {
            ctx.connect()
                .await
                .map_err(|e| engine_error(ctx.bind_key(), e))?;
        }
        run.transition(MigrationState::Connected);

        for ctx in contexts.iter_mut() {
            ctx.configure()
                .await
                .map_err(|e| engine_error(ctx.bind_key(), e))?;
            ctx.begin(self.use_two_phase)
                .await
                .map_err(|e| engine_error(ctx.bind_key(), e))?;
        }
        run.transition(MigrationState::Configured);

        let mut reports = Vec::with_capacity(contexts.len());
        for ctx in contexts.iter_mut() {
            info!(bind_key = ctx.bind_key(), "Migrating database {}", ctx.bind_key());
            let report = ctx
                .run_migrations(action, scripts)
                .await
                .map_err(|e| engine_error(ctx.bind_key(), e))?;
            reports.push(report);
        }
        run.transition(MigrationState::MigrationsApplied);

        if self.use_two_phase {
            for ctx in contexts.iter_mut() {
                ctx.prepare()
                    .await
                    .map_err(|e| engine_error(ctx.bind_key(), e))?;
            }
            run.transition(MigrationState::Prepared);
        }
        for ctx in contexts.iter_mut() {
            ctx.commit()
                .await
                .map_err(|e| engine_error(ctx.bind_key(), e))?;
        }
        run.transition(MigrationState::Committed);
        Ok(reports)
    }
}

#[async_trait]
impl MigrationEnvironment for MultipleDatabase {
    fn contexts(&self) -> Vec<MigrationContext> {
        self.engines
            .iter()
            .map(|engine| {
                let key = engine.bind_key();
                MigrationContext::new(
                    Arc::clone(engine),
                    metadata_for(engine),
                    format!("{key}_upgrades"),
                    format!("{key}_downgrades"),
                    self.config.clone(),
                )
            })
            .collect()
    }

    async fn run_online(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
    ) -> Result<MigrationRun> {
        let mut run = MigrationRun::default();
        let mut contexts = self.contexts();
        let result = self.drive(&mut contexts, &mut run, action, scripts).await;
        finish(&mut contexts, &mut run, result.is_err()).await;
        run.reports = result?;
        Ok(run)
    }

    fn run_offline(
        &self,
        action: &MigrationAction,
        scripts: &ScriptDirectory,
        applied: &BTreeSet<String>,
        out: &mut dyn Write,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.sql_dir)?;
        for ctx in self.contexts() {
            let path = self.sql_dir.join(format!("{}.sql", ctx.bind_key()));
            info!(bind_key = ctx.bind_key(), path = %path.display(), "Writing output");
            let sql = ctx.render_migrations(action, scripts, applied)?;
            let mut body = sql.join("\n");
            body.push('\n');
            std::fs::write(&path, body)?;
            writeln!(out, "{}", path.display())?;
        }
        Ok(())
    }

    /// Strips empty per-database groups, but only once every engine has a
    /// group; a revision left with no group at all is dropped.
    fn suppress_empty(&self, directives: &mut Vec<RevisionScript>) {
        let Some(script) = directives.first_mut() else {
            return;
        };
        if script.upgrade_ops.len() != self.engines.len() {
            return;
        }
        let empty: Vec<String> = script
            .upgrade_ops
            .iter()
            .filter(|(_, ops)| ops.is_empty())
            .map(|(token, _)| token.clone())
            .collect();
        for token in empty {
            script.upgrade_ops.remove(&token);
            if let Some(key) = token.strip_suffix("_upgrades") {
                script.downgrade_ops.remove(&format!("{key}_downgrades"));
            }
        }
        if script.upgrade_ops.is_empty() {
            directives.clear();
            info!("{NO_CHANGES}");
        }
    }

    fn config(&self) -> &ContextConfig {
        &self.config
    }
}

/// Pick the environment matching the manager's engine count.
#[must_use]
pub fn environment_for(
    manager: &EngineManager,
    config: ContextConfig,
    sql_dir: &Path,
) -> Box<dyn MigrationEnvironment> {
    if manager.engines().len() == 1 {
        return Box::new(SingleDatabase::new(Arc::clone(manager.engine()), config));
    }
    let mut engines: Vec<Arc<Engine>> = Vec::with_capacity(manager.engines().len());
    // `default` first so its output leads.
    if let Some(default) = manager.engines().get(DEFAULT_KEY) {
        engines.push(Arc::clone(default));
    }
    engines.extend(
        manager
            .engines()
            .iter()
            .filter(|(key, _)| key.as_str() != DEFAULT_KEY)
            .map(|(_, engine)| Arc::clone(engine)),
    );
    Box::new(MultipleDatabase::new(
        engines,
        config,
        manager.migration_options().use_two_phase,
        sql_dir,
    ))
}
