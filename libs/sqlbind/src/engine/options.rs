//! Dialect defaults and typed `sqlx` connect options.

use std::path::Path;

use crate::config::{EngineOptions, PoolClass};
use crate::database_url::{DatabaseUrl, Dialect};
use crate::{DbError, Result};

/// Seconds after which MySQL connections are recycled unless configured otherwise.
pub const MYSQL_POOL_RECYCLE: u64 = 7200;

/// Charset added to MySQL URLs that do not name one.
pub const MYSQL_CHARSET: &str = "utf8mb4";

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Whether a sqlite URL points at an in-memory database.
#[must_use]
pub fn is_sqlite_memory(url: &DatabaseUrl) -> bool {
    matches!(url.database(), None | Some("" | ":memory:"))
}

/// Resolve the URL and inject dialect-specific defaults.
///
/// - echo flags default to the manager-wide `echo`
/// - sqlite in-memory: static single-connection pool, `check_same_thread` disabled
/// - sqlite relative path: resolved under `<root_path>/sqlite/` (created)
/// - mysql: 7200s recycle for queue pools, `utf8mb4` charset
///
/// # Errors
/// Returns an error if the URL is missing or invalid, or the sqlite directory cannot be created.
pub fn prepare_engine_options(
    bind_key: &str,
    mut options: EngineOptions,
    echo: bool,
    root_path: Option<&Path>,
) -> Result<(DatabaseUrl, EngineOptions)> {
    let raw = options.url.clone().ok_or_else(|| {
        DbError::Configuration(format!("Database '{bind_key}' has no 'url' configured"))
    })?;
    let mut url = DatabaseUrl::parse(&raw)?;

    options.echo = options.echo.or(Some(echo));
    options.echo_pool = options.echo_pool.or(Some(echo));

    match url.dialect()? {
        Dialect::Sqlite => {
            if is_sqlite_memory(&url) {
                options.poolclass = Some(PoolClass::Static);
                options.connect_args.check_same_thread = Some(false);
            } else if let (Some(root), Some(database)) = (root_path, url.database()) {
                let is_uri = url.query_value("uri").is_some_and(is_truthy);
                let db_str = if is_uri {
                    database.strip_prefix("file:").unwrap_or(database)
                } else {
                    database
                };
                if !Path::new(db_str).is_absolute() {
                    let dir = root.join("sqlite");
                    std::fs::create_dir_all(&dir)?;
                    let resolved = dir.join(db_str).to_string_lossy().into_owned();
                    let resolved = if is_uri {
                        format!("file:{resolved}")
                    } else {
                        resolved
                    };
                    url = url.with_database(resolved);
                }
            }
        }
        Dialect::MySql => {
            if matches!(options.poolclass, None | Some(PoolClass::Queue)) {
                options.pool_recycle = options.pool_recycle.or(Some(MYSQL_POOL_RECYCLE));
            }
            if url.query_value("charset").is_none() {
                url = url.with_query("charset", MYSQL_CHARSET);
            }
        }
        Dialect::Postgres => {}
    }

    options.url = Some(url.render(false));
    Ok((url, options))
}

/// Typed connect options per backend.
#[derive(Clone, Debug)]
pub enum DbConnectOptions {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::sqlite::SqliteConnectOptions),
    #[cfg(feature = "pg")]
    Postgres(sqlx::postgres::PgConnectOptions),
    #[cfg(feature = "mysql")]
    MySql(sqlx::mysql::MySqlConnectOptions),
}

impl DbConnectOptions {
    /// Build connect options from a prepared URL.
    ///
    /// # Errors
    /// Returns `DbError::FeatureDisabled` when the backend feature is off,
    /// or an error for invalid URL parameters.
    pub fn from_url(url: &DatabaseUrl, options: &EngineOptions) -> Result<Self> {
        #[cfg(not(any(feature = "sqlite", feature = "pg", feature = "mysql")))]
        let _ = options;

        match url.dialect()? {
            Dialect::Sqlite => {
                #[cfg(feature = "sqlite")]
                {
                    Ok(DbConnectOptions::Sqlite(sqlite_options(url, options)))
                }
                #[cfg(not(feature = "sqlite"))]
                {
                    Err(DbError::FeatureDisabled("SQLite feature not enabled"))
                }
            }
            Dialect::Postgres => {
                #[cfg(feature = "pg")]
                {
                    pg_options(url).map(DbConnectOptions::Postgres)
                }
                #[cfg(not(feature = "pg"))]
                {
                    Err(DbError::FeatureDisabled("PostgreSQL feature not enabled"))
                }
            }
            Dialect::MySql => {
                #[cfg(feature = "mysql")]
                {
                    Ok(DbConnectOptions::MySql(mysql_options(url)))
                }
                #[cfg(not(feature = "mysql"))]
                {
                    Err(DbError::FeatureDisabled("MySQL feature not enabled"))
                }
            }
        }
    }
}

#[cfg(feature = "sqlite")]
fn sqlite_options(
    url: &DatabaseUrl,
    options: &EngineOptions,
) -> sqlx::sqlite::SqliteConnectOptions {
    use sqlx::sqlite::SqliteConnectOptions;

    let mut opts = if is_sqlite_memory(url) {
        SqliteConnectOptions::new().in_memory(true)
    } else {
        let database = url.database().unwrap_or_default();
        let path = database.strip_prefix("file:").unwrap_or(database);
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
    };

    if options.connect_args.check_same_thread == Some(false) {
        opts = opts.serialized(true);
    }
    if let Some(timeout) = options
        .connect_args
        .extra
        .get("timeout")
        .and_then(serde_json::Value::as_f64)
        .filter(|t| t.is_finite() && *t >= 0.0)
    {
        opts = opts.busy_timeout(std::time::Duration::from_secs_f64(timeout));
    }
    if url.query_value("mode").is_some_and(|m| m == "ro") {
        opts = opts.read_only(true);
    }
    opts
}

#[cfg(feature = "pg")]
fn pg_options(url: &DatabaseUrl) -> Result<sqlx::postgres::PgConnectOptions> {
    use sqlx::postgres::{PgConnectOptions, PgSslMode};
    use std::str::FromStr;

    let mut opts = PgConnectOptions::new();
    if let Some(host) = url.host() {
        opts = opts.host(host);
    }
    if let Some(port) = url.port() {
        opts = opts.port(port);
    }
    if let Some(user) = url.username() {
        opts = opts.username(user);
    }
    if let Some(password) = url.password() {
        opts = opts.password(password);
    }
    if let Some(database) = url.database() {
        opts = opts.database(database);
    }
    for (key, value) in url.query() {
        match key.as_str() {
            "sslmode" => {
                let mode = PgSslMode::from_str(value)
                    .map_err(|e| DbError::Configuration(format!("sslmode: {e}")))?;
                opts = opts.ssl_mode(mode);
            }
            "application_name" => opts = opts.application_name(value),
            other => opts = opts.options([(other, value.as_str())]),
        }
    }
    Ok(opts)
}

#[cfg(feature = "mysql")]
fn mysql_options(url: &DatabaseUrl) -> sqlx::mysql::MySqlConnectOptions {
    let mut opts = sqlx::mysql::MySqlConnectOptions::new();
    if let Some(host) = url.host() {
        opts = opts.host(host);
    }
    if let Some(port) = url.port() {
        opts = opts.port(port);
    }
    if let Some(user) = url.username() {
        opts = opts.username(user);
    }
    if let Some(password) = url.password() {
        opts = opts.password(password);
    }
    if let Some(database) = url.database() {
        opts = opts.database(database);
    }
    if let Some(charset) = url.query_value("charset") {
        opts = opts.charset(charset);
    }
    opts
}
