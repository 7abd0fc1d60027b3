//! Engine set built from a [`DatabaseConfig`].

use figment::Figment;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, SessionOptions};
use crate::engine::{Engine, Executor, prepare_engine_options};
use crate::metadata::{MetadataRegistry, SchemaContainer, ddl};
use crate::migration::MigrationOptions;
use crate::model::ModelIndex;
use crate::session::{RoutingSession, ScopedSession};
use crate::{DEFAULT_KEY, DbError, Result};

/// Which bind keys a lifecycle operation covers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Binds {
    /// Every configured engine.
    #[default]
    All,
    Keys(Vec<String>),
}

impl Binds {
    #[must_use]
    pub fn keys<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> Self {
        Binds::Keys(keys.into_iter().map(Into::into).collect())
    }
}

/// One engine per configured bind key plus the session factory over them.
pub struct EngineManager {
    default_engine: Arc<Engine>,
    engines: Arc<BTreeMap<String, Arc<Engine>>>,
    session_factory: ScopedSession,
    config: DatabaseConfig,
    migration_options: MigrationOptions,
    has_async_engine_driver: bool,
    // Dropped last: pools spawn their maintenance tasks on this runtime.
    executor: Executor,
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("async", &self.has_async_engine_driver)
            .finish_non_exhaustive()
    }
}

impl EngineManager {
    /// Validate the configuration and build every engine.
    ///
    /// No connection is opened here. Asynchronous engine sets must be built
    /// inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` if `"default"` is missing, session
    /// options conflict, or sync and async drivers are mixed.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        config.session_options.validate()?;
        let resolved = config.databases.resolve(&config.engine_options)?;
        let root_path = config.root_path.as_deref();

        for path in &config.models {
            if !ModelIndex::contains(path) {
                warn!(model = %path, "model listed in configuration is not registered");
            }
        }

        let mut prepared = Vec::with_capacity(resolved.len());
        for (key, options) in resolved {
            let _bind = MetadataRegistry::make_or_get(&key);
            let (url, options) = prepare_engine_options(&key, options, config.echo, root_path)?;
            prepared.push((key, url, options));
        }

        let async_count = prepared.iter().filter(|(_, url, _)| url.is_async()).count();
        if async_count != 0 && async_count != prepared.len() {
            return Err(DbError::Configuration(
                "Databases Configuration must either be all async or all synchronous type"
                    .to_owned(),
            ));
        }
        let has_async_engine_driver = async_count != 0;
        let executor = if has_async_engine_driver {
            Executor::native()?
        } else {
            Executor::blocking()?
        };

        let engines = {
            let _runtime = executor.handle().enter();
            let mut engines = BTreeMap::new();
            for (key, url, options) in prepared {
                let engine = Engine::build(&key, url, options)?;
                engines.insert(key, Arc::new(engine));
            }
            Arc::new(engines)
        };
        let default_engine = engines
            .get(DEFAULT_KEY)
            .cloned()
            .ok_or_else(|| DbError::Configuration("`default` database must be present".to_owned()))?;

        let session_factory =
            ScopedSession::new(Arc::clone(&engines), config.session_options.clone())?;
        let migration_options = config.migration_options.resolved(root_path);

        info!(
            engines = engines.len(),
            asynchronous = has_async_engine_driver,
            "database engines configured"
        );
        Ok(Self {
            default_engine,
            engines,
            session_factory,
            migration_options,
            has_async_engine_driver,
            config,
            executor,
        })
    }

    /// Build from the `database` section of a figment.
    ///
    /// # Errors
    /// Returns `DbError::Config` for malformed input, otherwise see [`EngineManager::new`].
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        Self::new(DatabaseConfig::from_figment(figment)?)
    }

    /// The `"default"` engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.default_engine
    }

    #[must_use]
    pub fn engines(&self) -> &Arc<BTreeMap<String, Arc<Engine>>> {
        &self.engines
    }

    /// # Errors
    /// Returns `DbError::UnboundExecution` for an unknown key.
    pub fn engine_for(&self, key: &str) -> Result<&Arc<Engine>> {
        self.engines.get(key).ok_or_else(|| {
            DbError::UnboundExecution(format!("Bind key '{key}' is not in 'Database' config."))
        })
    }

    #[must_use]
    pub fn has_async_engine_driver(&self) -> bool {
        self.has_async_engine_driver
    }

    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    #[must_use]
    pub fn root_path(&self) -> Option<&Path> {
        self.config.root_path.as_deref()
    }

    /// Migration options with the directory resolved against `root_path`.
    #[must_use]
    pub fn migration_options(&self) -> &MigrationOptions {
        &self.migration_options
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Drive a fallible async operation from synchronous code.
    ///
    /// # Errors
    /// The operation's own error, or `DbError::Configuration` when the
    /// calling runtime cannot be blocked.
    pub fn block_on<T, E, F>(&self, future: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<DbError>,
    {
        self.executor.block_on(future)?
    }

    /// The manager's scoped session factory.
    #[must_use]
    pub fn session_factory(&self) -> &ScopedSession {
        &self.session_factory
    }

    /// A new scoped factory with its own options.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` for conflicting options.
    pub fn scoped_session(&self, options: SessionOptions) -> Result<ScopedSession> {
        ScopedSession::new(Arc::clone(&self.engines), options)
    }

    /// A fresh unscoped session with the configured options.
    #[must_use]
    pub fn session(&self) -> RoutingSession {
        RoutingSession::with_options(
            Arc::clone(&self.engines),
            self.config.session_options.clone(),
        )
    }

    fn targets(&self, binds: &Binds) -> Result<Vec<(Arc<Engine>, Arc<SchemaContainer>)>> {
        let keys: Vec<&str> = match binds {
            Binds::All => self.engines.keys().map(String::as_str).collect(),
            Binds::Keys(keys) => keys.iter().map(String::as_str).collect(),
        };
        keys.into_iter()
            .map(|key| {
                let engine = Arc::clone(self.engine_for(key)?);
                let metadata = MetadataRegistry::make_or_get(key).metadata;
                Ok((engine, metadata))
            })
            .collect()
    }

    /// Create every declared table missing from its database.
    ///
    /// # Errors
    /// Returns `DbError::UnboundExecution` for unknown keys, or the driver error.
    pub async fn create_all(&self, binds: &Binds) -> Result<()> {
        for (engine, metadata) in self.targets(binds)? {
            let mut created = 0usize;
            for table in metadata.tables() {
                if engine.has_table(table.name()).await? {
                    continue;
                }
                let stmts = ddl::create_table_statements(
                    engine.backend(),
                    &table.spec(),
                    metadata.naming_convention(),
                );
                for stmt in stmts {
                    engine.execute(stmt).await?;
                }
                created += 1;
            }
            debug!(bind_key = engine.bind_key(), created, "create_all finished");
        }
        Ok(())
    }

    /// Drop every declared table, in reverse declaration order.
    ///
    /// # Errors
    /// Returns `DbError::UnboundExecution` for unknown keys, or the driver error.
    pub async fn drop_all(&self, binds: &Binds) -> Result<()> {
        for (engine, metadata) in self.targets(binds)? {
            for table in metadata.tables().iter().rev() {
                if engine.has_table(table.name()).await? {
                    engine
                        .execute(ddl::drop_table_statement(engine.backend(), table.name()))
                        .await?;
                }
            }
            debug!(bind_key = engine.bind_key(), "drop_all finished");
        }
        Ok(())
    }

    /// Load tables that exist in the database into their containers.
    ///
    /// Declared tables are never overwritten.
    ///
    /// # Errors
    /// Returns `DbError::UnboundExecution` for unknown keys, or the driver error.
    pub async fn reflect(&self, binds: &Binds) -> Result<()> {
        for (engine, metadata) in self.targets(binds)? {
            let mut reflected = 0usize;
            for spec in ddl::reflect_tables(engine.connection()).await? {
                if metadata.reflect_table(spec) {
                    reflected += 1;
                }
            }
            debug!(bind_key = engine.bind_key(), reflected, "reflect finished");
        }
        Ok(())
    }

    /// # Errors
    /// See [`EngineManager::create_all`].
    pub fn create_all_blocking(&self, binds: &Binds) -> Result<()> {
        self.block_on(self.create_all(binds))
    }

    /// # Errors
    /// See [`EngineManager::drop_all`].
    pub fn drop_all_blocking(&self, binds: &Binds) -> Result<()> {
        self.block_on(self.drop_all(binds))
    }

    /// # Errors
    /// See [`EngineManager::reflect`].
    pub fn reflect_blocking(&self, binds: &Binds) -> Result<()> {
        self.block_on(self.reflect(binds))
    }

    /// Close every engine's pool.
    pub async fn dispose(&self) {
        for engine in self.engines.values() {
            engine.dispose().await;
        }
    }

    pub fn dispose_blocking(&self) {
        if let Err(err) = self.executor.block_on(self.dispose()) {
            warn!(error = %err, "engines not disposed");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{DatabasesConfig, EngineOptions, PoolClass};
    use crate::metadata::{Column, SqlType};

    #[test]
    fn test_missing_default_key_fails_before_connecting() {
        let config = DatabaseConfig::multi([("reports", "postgresql://nobody@unreachable/db")]);
        let err = EngineManager::new(config).unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_mixed_async_and_sync_drivers_fail() {
        let config = DatabaseConfig::multi([
            ("default", "sqlite+aiosqlite://"),
            ("mixed_sync", "sqlite://"),
        ]);
        let err = EngineManager::new(config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Improperly configured: Databases Configuration must either be all async or all synchronous type"
        );
    }

    #[test]
    fn test_conflicting_session_options_fail() {
        let mut options = SessionOptions {
            bind: Some("default".to_owned()),
            ..SessionOptions::default()
        };
        options.binds.insert("t".to_owned(), "default".to_owned());
        let config = DatabaseConfig::new("sqlite://").with_session_options(options);
        assert!(matches!(
            EngineManager::new(config),
            Err(DbError::Configuration(_))
        ));
    }

    #[test]
    fn test_string_shorthand_builds_default_memory_engine() {
        let db = EngineManager::new(DatabaseConfig::new("sqlite://")).unwrap();
        assert!(!db.has_async_engine_driver());
        assert_eq!(db.engine().bind_key(), DEFAULT_KEY);
        assert_eq!(db.engine().options().poolclass, Some(PoolClass::Static));
        assert_eq!(
            db.engine().options().connect_args.check_same_thread,
            Some(false)
        );
        assert!(MetadataRegistry::exists(DEFAULT_KEY));
    }

    #[test]
    fn test_per_key_options_override_common_ones() {
        let mut map = BTreeMap::new();
        map.insert(
            "default".to_owned(),
            crate::config::DatabaseEntry::Url("sqlite://".to_owned()),
        );
        map.insert(
            "manager_override".to_owned(),
            crate::config::DatabaseEntry::Options(EngineOptions {
                echo: Some(true),
                ..EngineOptions::with_url("sqlite://")
            }),
        );
        let config = DatabaseConfig::new(DatabasesConfig::Map(map)).with_echo(false);
        let db = EngineManager::new(config).unwrap();
        assert!(!db.engine().echo());
        assert!(db.engine_for("manager_override").unwrap().echo());
        assert!(MetadataRegistry::exists("manager_override"));
        assert!(matches!(
            db.engine_for("nope"),
            Err(DbError::UnboundExecution(_))
        ));
    }

    #[test]
    fn test_create_drop_and_reflect_blocking() {
        let key = "manager_lifecycle";
        let bind = MetadataRegistry::make_or_get(key);
        bind.metadata
            .define_table(
                "lifecycle_items",
                vec![
                    Column::new("id", SqlType::Integer).primary_key(),
                    Column::new("label", SqlType::String(Some(64))).index(),
                ],
            )
            .unwrap();
        let db = EngineManager::new(DatabaseConfig::multi([
            ("default", "sqlite://"),
            (key, "sqlite://"),
        ]))
        .unwrap();

        db.create_all_blocking(&Binds::keys([key])).unwrap();
        let engine = db.engine_for(key).unwrap();
        assert!(db.block_on(engine.has_table("lifecycle_items")).unwrap());
        // idempotent
        db.create_all_blocking(&Binds::keys([key])).unwrap();

        bind.metadata.clear();
        db.reflect_blocking(&Binds::keys([key])).unwrap();
        let reflected = bind.metadata.table("lifecycle_items").unwrap();
        assert_eq!(reflected.primary_key().len(), 1);

        db.drop_all_blocking(&Binds::keys([key])).unwrap();
        assert!(!db.block_on(engine.has_table("lifecycle_items")).unwrap());

        assert!(matches!(
            db.create_all_blocking(&Binds::keys(["missing_key"])),
            Err(DbError::UnboundExecution(_))
        ));
        db.dispose_blocking();
    }

    #[tokio::test]
    async fn test_blocking_lifecycle_inside_current_thread_runtime() {
        let key = "manager_current_thread";
        MetadataRegistry::make_or_get(key)
            .metadata
            .define_table(
                "current_thread_items",
                vec![Column::new("id", SqlType::Integer).primary_key()],
            )
            .unwrap();
        let db = EngineManager::new(DatabaseConfig::multi([
            ("default", "sqlite://"),
            (key, "sqlite://"),
        ]))
        .unwrap();

        db.create_all_blocking(&Binds::keys([key])).unwrap();
        let engine = db.engine_for(key).unwrap();
        assert!(db.block_on(engine.has_table("current_thread_items")).unwrap());
        db.drop_all_blocking(&Binds::keys([key])).unwrap();
        db.dispose_blocking();

        let native = EngineManager::new(DatabaseConfig::new("sqlite+aiosqlite://")).unwrap();
        assert!(matches!(
            native.create_all_blocking(&Binds::All),
            Err(DbError::Configuration(_))
        ));
    }

    #[test]
    fn test_relative_migration_directory_resolves_against_root() {
        let root = tempfile::tempdir().unwrap();
        let db = EngineManager::new(DatabaseConfig::new("sqlite://").with_root_path(root.path()))
            .unwrap();
        assert_eq!(
            db.migration_options().directory,
            root.path().join("migrations")
        );
    }
}
