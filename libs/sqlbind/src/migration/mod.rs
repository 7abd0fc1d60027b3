//! Schema migrations over one or several bind keys.
//!
//! Revisions are JSON scripts in `<directory>/versions/`. One script can hold
//! an independent operation list per database, keyed by the context's upgrade
//! and downgrade tokens. Each bind key records its applied revisions in its
//! own history table.
//!
//! With one engine a [`SingleDatabase`] environment runs everything in one
//! transaction. With several a [`MultipleDatabase`] environment begins a
//! transaction on every engine, applies all of them, optionally prepares them
//! (two-phase), and only then commits.

pub mod autogen;
pub mod command;
pub mod context;
pub mod environment;
pub mod history;
pub mod ops;
pub mod script;
pub mod transaction;

pub use command::{Commands, RevisionArgs};
pub use context::{ContextConfig, ContextReport, MigrationAction, MigrationContext};
pub use environment::{
    MigrationEnvironment, MigrationRun, MigrationState, MultipleDatabase, SingleDatabase,
    environment_for,
};
pub use ops::Operation;
pub use script::{Revision, RevisionScript, ScriptDirectory};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::Dialect;

/// Migration command failures.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(
        "Path doesn't exist: '{}'. Please use the 'init' command to create a new scripts folder.",
        .0.display()
    )]
    NotInitialized(PathBuf),

    #[error("Directory '{}' already exists and is not empty", .0.display())]
    DirectoryExists(PathBuf),

    #[error("Can't locate revision identified by '{0}'")]
    UnknownRevision(String),

    #[error("Multiple revisions start with '{prefix}': {candidates}")]
    AmbiguousRevision { prefix: String, candidates: String },

    #[error(
        "Multiple head revisions are present for given argument '{0}'; please specify a specific target revision or 'heads' for all heads"
    )]
    MultipleHeads(String),

    #[error("Revision {0} is not a head revision; please specify --splice to create a new branch from this revision")]
    NotAHead(String),

    #[error("Relative revision '{0}' didn't produce enough revisions")]
    RelativeOutOfRange(String),

    #[error("Target database is not up to date.")]
    NotUpToDate,

    #[error("New upgrade operations detected: {0}")]
    NewOperations(String),

    #[error("Two-phase transactions are not supported by {0}")]
    TwoPhaseUnsupported(Dialect),

    #[error("Invalid revision script '{}': {reason}", .path.display())]
    InvalidScript { path: PathBuf, reason: String },

    #[error("Can't apply '{op}': {reason}")]
    UnsupportedOperation { op: String, reason: String },

    #[error("{0}")]
    Usage(String),

    #[error("Migration failed for database '{bind_key}': {source}")]
    Engine {
        bind_key: String,
        source: Box<crate::DbError>,
    },
}

/// Settings passed to every migration context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfigure {
    /// Compare column types during autogeneration.
    pub compare_type: bool,
    /// Alter columns on sqlite by recreating the table.
    pub render_as_batch: bool,
}

impl Default for ContextConfigure {
    fn default() -> Self {
        Self {
            compare_type: true,
            render_as_batch: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    pub directory: PathBuf,
    pub use_two_phase: bool,
    pub context_configure: ContextConfigure,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            use_two_phase: false,
            context_configure: ContextConfigure::default(),
        }
    }
}

impl MigrationOptions {
    /// Copy with a relative `directory` joined onto `root_path`.
    #[must_use]
    pub fn resolved(&self, root_path: Option<&Path>) -> Self {
        let mut out = self.clone();
        if let Some(root) = root_path
            && out.directory.is_relative()
        {
            out.directory = root.join(&out.directory);
        }
        out
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.directory, PathBuf::from("migrations"));
        assert!(!options.use_two_phase);
        assert!(options.context_configure.compare_type);
        assert!(options.context_configure.render_as_batch);
    }

    #[test]
    fn test_resolved_keeps_absolute_directory() {
        let options = MigrationOptions {
            directory: PathBuf::from("/srv/migrations"),
            ..MigrationOptions::default()
        };
        assert_eq!(
            options.resolved(Some(Path::new("/app"))).directory,
            PathBuf::from("/srv/migrations")
        );
        assert_eq!(
            MigrationOptions::default()
                .resolved(Some(Path::new("/app")))
                .directory,
            PathBuf::from("/app/migrations")
        );
    }

    #[test]
    fn test_partial_deserialization() {
        let options: MigrationOptions =
            serde_json::from_str(r#"{"use_two_phase": true, "context_configure": {"compare_type": false}}"#)
                .unwrap();
        assert!(options.use_two_phase);
        assert!(!options.context_configure.compare_type);
        assert!(options.context_configure.render_as_batch);
    }
}
