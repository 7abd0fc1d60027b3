//! One lazily connected engine per bind key.

pub mod executor;
pub mod options;
mod pool_opts;

pub use executor::Executor;
pub use options::{DbConnectOptions, prepare_engine_options};

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use sea_orm_migration::SchemaManager;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{EngineOptions, PoolClass};
use crate::database_url::{DatabaseUrl, Dialect};
use crate::Result;
use pool_opts::ApplyPoolOpts;

/// Typed `sqlx` pool behind an engine.
#[derive(Clone, Debug)]
pub enum DbPool {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "pg")]
    Postgres(sqlx::PgPool),
    #[cfg(feature = "mysql")]
    MySql(sqlx::MySqlPool),
}

impl DbPool {
    /// Create a pool without opening any connection.
    fn connect_lazy(bind_key: &str, connect: &DbConnectOptions, options: &EngineOptions) -> Self {
        match connect {
            #[cfg(feature = "sqlite")]
            DbConnectOptions::Sqlite(opts) => DbPool::Sqlite(
                sqlx::sqlite::SqlitePoolOptions::new()
                    .apply(bind_key, options)
                    .connect_lazy_with(opts.clone()),
            ),
            #[cfg(feature = "pg")]
            DbConnectOptions::Postgres(opts) => DbPool::Postgres(
                sqlx::postgres::PgPoolOptions::new()
                    .apply(bind_key, options)
                    .connect_lazy_with(opts.clone()),
            ),
            #[cfg(feature = "mysql")]
            DbConnectOptions::MySql(opts) => DbPool::MySql(
                sqlx::mysql::MySqlPoolOptions::new()
                    .apply(bind_key, options)
                    .connect_lazy_with(opts.clone()),
            ),
            #[cfg(not(any(feature = "sqlite", feature = "pg", feature = "mysql")))]
            _ => {
                unreachable!("No database features enabled")
            }
        }
    }

    pub(crate) fn sea_connection(&self) -> DatabaseConnection {
        match self {
            #[cfg(feature = "sqlite")]
            DbPool::Sqlite(pool) => {
                sea_orm::SqlxSqliteConnector::from_sqlx_sqlite_pool(pool.clone())
            }
            #[cfg(feature = "pg")]
            DbPool::Postgres(pool) => {
                sea_orm::SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone())
            }
            #[cfg(feature = "mysql")]
            DbPool::MySql(pool) => sea_orm::SqlxMySqlConnector::from_sqlx_mysql_pool(pool.clone()),
            #[cfg(not(any(feature = "sqlite", feature = "pg", feature = "mysql")))]
            _ => {
                unreachable!("No database features enabled")
            }
        }
    }

    /// Connections currently held by the pool.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            #[cfg(feature = "sqlite")]
            DbPool::Sqlite(pool) => pool.size(),
            #[cfg(feature = "pg")]
            DbPool::Postgres(pool) => pool.size(),
            #[cfg(feature = "mysql")]
            DbPool::MySql(pool) => pool.size(),
            #[cfg(not(any(feature = "sqlite", feature = "pg", feature = "mysql")))]
            _ => 0,
        }
    }

    pub async fn close(&self) {
        match self {
            #[cfg(feature = "sqlite")]
            DbPool::Sqlite(pool) => pool.close().await,
            #[cfg(feature = "pg")]
            DbPool::Postgres(pool) => pool.close().await,
            #[cfg(feature = "mysql")]
            DbPool::MySql(pool) => pool.close().await,
            #[cfg(not(any(feature = "sqlite", feature = "pg", feature = "mysql")))]
            _ => {}
        }
    }
}

/// A connection pool bound to one URL and dialect.
///
/// Building an engine never opens a connection; the first statement does.
/// Must be built inside a tokio runtime context.
#[derive(Debug)]
pub struct Engine {
    bind_key: String,
    url: DatabaseUrl,
    dialect: Dialect,
    options: EngineOptions,
    connect: DbConnectOptions,
    pool: DbPool,
    conn: DatabaseConnection,
}

impl Engine {
    /// Build an engine from options already passed through [`prepare_engine_options`].
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or its backend feature is disabled.
    pub fn build(bind_key: &str, url: DatabaseUrl, options: EngineOptions) -> Result<Self> {
        let dialect = url.dialect()?;
        let connect = DbConnectOptions::from_url(&url, &options)?;
        let pool = DbPool::connect_lazy(bind_key, &connect, &options);
        let conn = pool.sea_connection();
        debug!(bind_key, url = %url, dialect = %dialect, "engine created");
        Ok(Self {
            bind_key: bind_key.to_owned(),
            url,
            dialect,
            options,
            connect,
            pool,
            conn,
        })
    }

    /// Convenience: prepare options (dialect defaults) and build.
    ///
    /// # Errors
    /// See [`prepare_engine_options`] and [`Engine::build`].
    pub fn from_options(
        bind_key: &str,
        options: EngineOptions,
        echo: bool,
        root_path: Option<&Path>,
    ) -> Result<Self> {
        let (url, options) = prepare_engine_options(bind_key, options, echo, root_path)?;
        Self::build(bind_key, url, options)
    }

    #[must_use]
    pub fn bind_key(&self) -> &str {
        &self.bind_key
    }

    #[must_use]
    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn backend(&self) -> DatabaseBackend {
        match self.dialect {
            Dialect::Sqlite => DatabaseBackend::Sqlite,
            Dialect::Postgres => DatabaseBackend::Postgres,
            Dialect::MySql => DatabaseBackend::MySql,
        }
    }

    /// Effective options, dialect defaults included.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[must_use]
    pub fn connect_options(&self) -> &DbConnectOptions {
        &self.connect
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.url.is_async()
    }

    #[must_use]
    pub fn echo(&self) -> bool {
        self.options.echo == Some(true)
    }

    #[must_use]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// `SeaORM` connection over the engine's pool.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Whether every checkout shares one connection.
    #[must_use]
    pub fn is_static_pool(&self) -> bool {
        self.options.poolclass == Some(PoolClass::Static)
    }

    /// Log a statement when `echo` is on.
    pub fn log_statement(&self, stmt: &Statement) {
        if self.echo() {
            info!(target: "sqlbind::engine", bind_key = %self.bind_key, "{stmt}");
        }
    }

    /// Execute one statement outside any session transaction.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn execute(&self, stmt: Statement) -> Result<u64> {
        self.log_statement(&stmt);
        Ok(self.conn.execute(stmt).await?.rows_affected())
    }

    /// # Errors
    /// Returns the driver error.
    pub async fn has_table(&self, table: &str) -> Result<bool> {
        Ok(SchemaManager::new(&self.conn).has_table(table).await?)
    }

    /// Open a single-connection pool for migrations.
    ///
    /// Static-pool engines hand out their own pool so in-memory data stays visible.
    #[must_use]
    pub fn dedicated_pool(&self) -> DbPool {
        if self.is_static_pool() {
            return self.pool.clone();
        }
        let options = EngineOptions {
            poolclass: Some(PoolClass::Static),
            pool_recycle: None,
            ..self.options.clone()
        };
        DbPool::connect_lazy(&self.bind_key, &self.connect, &options)
    }

    /// Close every pooled connection.
    pub async fn dispose(&self) {
        self.pool.close().await;
        debug!(bind_key = %self.bind_key, "engine disposed");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_engine_is_static_and_lazy() {
        let engine =
            Engine::from_options("default", EngineOptions::with_url("sqlite://"), false, None)
                .unwrap();
        assert!(engine.is_static_pool());
        assert!(!engine.is_async());
        assert_eq!(engine.backend(), DatabaseBackend::Sqlite);
        assert!(!engine.has_table("scratch").await.unwrap());

        engine
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                "CREATE TABLE scratch (id INTEGER PRIMARY KEY)",
            ))
            .await
            .unwrap();
        assert!(engine.has_table("scratch").await.unwrap());
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_async_driver_is_detected() {
        let engine = Engine::from_options(
            "default",
            EngineOptions::with_url("sqlite+aiosqlite://"),
            false,
            None,
        )
        .unwrap();
        assert!(engine.is_async());
    }
}
