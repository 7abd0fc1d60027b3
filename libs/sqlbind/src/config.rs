//! Configuration types for the engine manager.
//!
//! `DatabaseConfig` is usually extracted from a `figment::Figment` under the
//! `database` key; it can also be built in code.

use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::migration::MigrationOptions;
use crate::{DEFAULT_KEY, DbError, Result};

/// Figment key under which the database configuration lives.
pub const CONFIG_KEY: &str = "database";

/// Connection pool implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolClass {
    /// Bounded pool of reusable connections.
    Queue,
    /// One connection shared by every checkout.
    Static,
    /// No pooling: connections are closed on return.
    Null,
}

/// Driver connect arguments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_same_thread: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Engine options, either common to every database or for one bind key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    pub url: Option<String>,
    pub poolclass: Option<PoolClass>,
    pub pool_size: Option<u32>,
    pub max_overflow: Option<u32>,
    /// Seconds to wait for a connection checkout.
    pub pool_timeout: Option<u64>,
    /// Seconds after which a connection is recycled.
    pub pool_recycle: Option<u64>,
    pub pool_pre_ping: Option<bool>,
    pub echo: Option<bool>,
    pub echo_pool: Option<bool>,
    pub connect_args: ConnectArgs,
}

impl EngineOptions {
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Field-wise merge where values set on `over` win.
    #[must_use]
    pub fn merged_with(&self, over: &EngineOptions) -> EngineOptions {
        let mut extra = self.connect_args.extra.clone();
        extra.extend(over.connect_args.extra.clone());
        EngineOptions {
            url: over.url.clone().or_else(|| self.url.clone()),
            poolclass: over.poolclass.or(self.poolclass),
            pool_size: over.pool_size.or(self.pool_size),
            max_overflow: over.max_overflow.or(self.max_overflow),
            pool_timeout: over.pool_timeout.or(self.pool_timeout),
            pool_recycle: over.pool_recycle.or(self.pool_recycle),
            pool_pre_ping: over.pool_pre_ping.or(self.pool_pre_ping),
            echo: over.echo.or(self.echo),
            echo_pool: over.echo_pool.or(self.echo_pool),
            connect_args: ConnectArgs {
                check_same_thread: over
                    .connect_args
                    .check_same_thread
                    .or(self.connect_args.check_same_thread),
                extra,
            },
        }
    }

    #[must_use]
    pub fn pool_timeout(&self) -> Option<Duration> {
        self.pool_timeout.map(Duration::from_secs)
    }

    #[must_use]
    pub fn pool_recycle(&self) -> Option<Duration> {
        self.pool_recycle.map(Duration::from_secs)
    }
}

/// One entry of the `databases` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatabaseEntry {
    Url(String),
    Options(EngineOptions),
}

/// A bare URL (the `default` database) or a map of bind keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatabasesConfig {
    Url(String),
    Map(BTreeMap<String, DatabaseEntry>),
}

impl From<&str> for DatabasesConfig {
    fn from(url: &str) -> Self {
        DatabasesConfig::Url(url.to_owned())
    }
}

impl From<String> for DatabasesConfig {
    fn from(url: String) -> Self {
        DatabasesConfig::Url(url)
    }
}

impl DatabasesConfig {
    /// Per-key engine options with `common` merged underneath.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` if `default` is missing.
    pub fn resolve(&self, common: &EngineOptions) -> Result<BTreeMap<String, EngineOptions>> {
        let mut resolved = BTreeMap::new();
        match self {
            DatabasesConfig::Url(url) => {
                resolved.insert(
                    DEFAULT_KEY.to_owned(),
                    common.merged_with(&EngineOptions::with_url(url.clone())),
                );
            }
            DatabasesConfig::Map(map) => {
                for (key, entry) in map {
                    let own = match entry {
                        DatabaseEntry::Url(url) => EngineOptions::with_url(url.clone()),
                        DatabaseEntry::Options(options) => options.clone(),
                    };
                    resolved.insert(key.clone(), common.merged_with(&own));
                }
            }
        }

        if !resolved.contains_key(DEFAULT_KEY) {
            return Err(DbError::Configuration(format!(
                "`{DEFAULT_KEY}` database must be present in databases parameter: {:?}",
                resolved.keys().collect::<Vec<_>>()
            )));
        }
        Ok(resolved)
    }
}

/// Options applied to every session built by the manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Begin a transaction on first use of each engine.
    pub autobegin: bool,
    /// Bind key for anything the routing rules leave unresolved.
    pub bind: Option<String>,
    /// Table name to bind key overrides for the fallback routing step.
    pub binds: BTreeMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autobegin: true,
            bind: None,
            binds: BTreeMap::new(),
        }
    }
}

impl SessionOptions {
    /// # Errors
    /// Returns `DbError::Configuration` when both `bind` and `binds` are set.
    pub fn validate(&self) -> Result<()> {
        if self.bind.is_some() && !self.binds.is_empty() {
            return Err(DbError::Configuration(
                "Session options 'bind' and 'binds' are mutually exclusive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration of an [`crate::EngineManager`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub databases: DatabasesConfig,
    #[serde(default)]
    pub engine_options: EngineOptions,
    #[serde(default)]
    pub session_options: SessionOptions,
    #[serde(default)]
    pub echo: bool,
    /// Directory relative sqlite paths and the migration directory resolve against.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
    #[serde(default)]
    pub migration_options: MigrationOptions,
    /// Model paths expected to be registered before the manager is built.
    #[serde(default)]
    pub models: Vec<String>,
}

impl DatabaseConfig {
    #[must_use]
    pub fn new(databases: impl Into<DatabasesConfig>) -> Self {
        Self {
            databases: databases.into(),
            engine_options: EngineOptions::default(),
            session_options: SessionOptions::default(),
            echo: false,
            root_path: None,
            migration_options: MigrationOptions::default(),
            models: Vec::new(),
        }
    }

    /// Several databases given as `(bind_key, url)` pairs.
    #[must_use]
    pub fn multi<K, U>(entries: impl IntoIterator<Item = (K, U)>) -> Self
    where
        K: Into<String>,
        U: Into<String>,
    {
        Self::new(DatabasesConfig::Map(
            entries
                .into_iter()
                .map(|(k, u)| (k.into(), DatabaseEntry::Url(u.into())))
                .collect(),
        ))
    }

    /// Extract the `database` section of a figment.
    ///
    /// # Errors
    /// Returns `DbError::Config` if the section is missing or malformed.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        Ok(figment.extract_inner(CONFIG_KEY)?)
    }

    #[must_use]
    pub fn with_root_path(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    #[must_use]
    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    #[must_use]
    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    #[must_use]
    pub fn with_migration_options(mut self, options: MigrationOptions) -> Self {
        self.migration_options = options;
        self
    }

    #[must_use]
    pub fn with_models<S: Into<String>>(mut self, models: impl IntoIterator<Item = S>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::providers::{Env, Format, Yaml};

    #[test]
    fn test_bare_url_means_default() {
        let resolved = DatabasesConfig::from("sqlite://")
            .resolve(&EngineOptions::default())
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[DEFAULT_KEY].url.as_deref(), Some("sqlite://"));
    }

    #[test]
    fn test_missing_default_key_is_configuration_error() {
        let err = DatabaseConfig::multi([("other", "sqlite://")])
            .databases
            .resolve(&EngineOptions::default())
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[test]
    fn test_per_key_options_win_over_common() {
        let common = EngineOptions {
            pool_size: Some(5),
            echo: Some(true),
            ..EngineOptions::default()
        };
        let config = DatabasesConfig::Map(BTreeMap::from([
            (
                "default".to_owned(),
                DatabaseEntry::Url("sqlite:///a.db".to_owned()),
            ),
            (
                "reports".to_owned(),
                DatabaseEntry::Options(EngineOptions {
                    url: Some("sqlite:///b.db".to_owned()),
                    pool_size: Some(2),
                    ..EngineOptions::default()
                }),
            ),
        ]));
        let resolved = config.resolve(&common).unwrap();
        assert_eq!(resolved["default"].pool_size, Some(5));
        assert_eq!(resolved["reports"].pool_size, Some(2));
        assert_eq!(resolved["reports"].echo, Some(true));
    }

    #[test]
    fn test_session_bind_and_binds_are_exclusive() {
        let options = SessionOptions {
            bind: Some("default".to_owned()),
            binds: BTreeMap::from([("user".to_owned(), "db1".to_owned())]),
            ..SessionOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(DbError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_figment_yaml_and_env() {
        let yaml = r"
database:
  databases:
    default: sqlite:///app.db
    db1:
      url: sqlite:///db1.db
      pool_size: 3
      connect_args:
        check_same_thread: false
        timeout: 15
  echo: true
  migration_options:
    directory: migrations
    use_two_phase: false
";
        temp_env::with_var("SQLBIND_DATABASE__ROOT_PATH", Some("/srv/app"), || {
            let figment = Figment::new()
                .merge(Yaml::string(yaml))
                .merge(Env::prefixed("SQLBIND_").split("__"));
            let config = DatabaseConfig::from_figment(&figment).unwrap();

            assert!(config.echo);
            assert_eq!(config.root_path, Some(PathBuf::from("/srv/app")));
            let resolved = config.databases.resolve(&config.engine_options).unwrap();
            assert_eq!(resolved.len(), 2);
            let db1 = &resolved["db1"];
            assert_eq!(db1.pool_size, Some(3));
            assert_eq!(db1.connect_args.check_same_thread, Some(false));
            assert_eq!(db1.connect_args.extra["timeout"], serde_json::json!(15));
        });
    }
}
