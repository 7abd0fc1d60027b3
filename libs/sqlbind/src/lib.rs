#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Multi-database binding layer on top of `SeaORM`.
//!
//! A single process can talk to several independently configured databases.
//! Every declared model belongs to exactly one of them through its *bind key*;
//! the bind key is stamped on the model's schema container, and a
//! [`RoutingSession`] reads it back on every operation to pick the engine that
//! must execute it.
//!
//! # Features
//! - `sqlite` (default), `pg`, `mysql`: enable `SQLx`/`SeaORM` backends
//!
//! # Building blocks
//! - [`metadata::MetadataRegistry`]: process-wide `bind key -> (schema container, mapper registry)` table
//! - [`model::ModelDecl`]: explicit model registration (table naming, inheritance, model index)
//! - [`EngineManager`]: one engine per bind key, dialect defaults, session factory, `create_all`/`drop_all`/`reflect`
//! - [`RoutingSession`]: per unit-of-work session that resolves the engine for each statement
//! - [`migration`]: single and multi-database migration environments with optional two-phase commit
//! - [`pagination`] and [`query`]: helpers layered on top of a routing session
//!
//! # Example
//! ```rust,no_run
//! use sqlbind::model::{Column, ModelDecl, SqlType};
//! use sqlbind::{Binds, DatabaseConfig, EngineManager};
//!
//! # fn main() -> sqlbind::Result<()> {
//! ModelDecl::new("app::models::User")
//!     .column(Column::new("id", SqlType::Integer).primary_key())
//!     .column(Column::new("name", SqlType::String(Some(128))))
//!     .register()?;
//!
//! ModelDecl::new("app::models::AuditEntry")
//!     .database("audit")
//!     .column(Column::new("id", SqlType::Integer).primary_key())
//!     .register()?;
//!
//! let config = DatabaseConfig::multi([
//!     ("default", "sqlite:///app.db"),
//!     ("audit", "sqlite:///audit.db"),
//! ])
//! .with_root_path("/var/lib/app");
//!
//! let db = EngineManager::new(config)?;
//! db.create_all_blocking(&Binds::All)?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(any(feature = "pg", feature = "mysql", feature = "sqlite")),
    allow(unused_imports, unused_variables, dead_code, unreachable_code)
)]

pub mod cli;
pub mod config;
pub mod database_url;
pub mod engine;
pub mod manager;
pub mod metadata;
pub mod migration;
pub mod model;
pub mod pagination;
pub mod query;
pub mod session;

pub use config::{DatabaseConfig, DatabasesConfig, EngineOptions, PoolClass, SessionOptions};
pub use database_url::{DatabaseUrl, Dialect};
pub use engine::{Engine, Executor};
pub use manager::{Binds, EngineManager};
pub use metadata::{DatabaseBind, MetadataRegistry};
pub use migration::{MigrationError, MigrationOptions};
pub use pagination::Paginator;
pub use session::{Clause, RoutingSession, ScopedSession};

use thiserror::Error;

/// The bind key every configuration must define.
pub const DEFAULT_KEY: &str = "default";

/// Info-map key under which a schema container stores its own bind key.
pub const DATABASE_BIND_KEY: &str = "database_bind_key";

/// Library-local result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Typed error for engines, sessions, registries and helpers.
#[derive(Debug, Error)]
pub enum DbError {
    /// Fatal configuration problem detected while building the engine set.
    #[error("Improperly configured: {0}")]
    Configuration(String),

    /// A statement resolved to a bind key that has no configured engine.
    #[error("{0}")]
    UnboundExecution(String),

    /// Registry lookup for a bind key that was never registered.
    #[error("No schema container registered for bind key '{0}'")]
    KeyNotFound(String),

    /// A model type was used for routing but never registered.
    #[error("Class '{0}' is not mapped")]
    UnmappedClass(String),

    /// Invalid model or table declaration.
    #[error("{0}")]
    InvalidModel(String),

    /// Lookup helpers found nothing (or more than one row where one was expected).
    #[error("{}", .0.as_deref().unwrap_or("Not Found"))]
    NotFound(Option<String>),

    #[error("Feature not enabled: {0}")]
    FeatureDisabled(&'static str),

    #[error("Unknown database URL: {0}")]
    UnknownUrl(String),

    #[error(transparent)]
    Migration(#[from] migration::MigrationError),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Sea(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(Box<figment::Error>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<figment::Error> for DbError {
    fn from(e: figment::Error) -> Self {
        DbError::Config(Box::new(e))
    }
}

impl DbError {
    /// Error raised when a routed statement names a bind key with no engine.
    #[must_use]
    pub fn unbound_bind_key(key: &str) -> Self {
        DbError::UnboundExecution(format!(
            "Database Bind key '{key}' is not in 'Database' config."
        ))
    }
}
