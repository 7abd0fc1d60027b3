//! `clap` front end for the migration commands.
//!
//! Embed [`DbArgs`] in an application's CLI (usually as a `db` subcommand)
//! and hand it to [`run`] together with the application's [`EngineManager`].

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::manager::EngineManager;
use crate::migration::{Commands, RevisionArgs};

#[derive(Debug, Args)]
pub struct DbArgs {
    /// Migration script directory (defaults to the configured one)
    #[arg(short, long, global = true)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Debug, Args)]
pub struct RevisionCli {
    /// Revision message
    #[arg(short, long)]
    pub message: Option<String>,
    /// Don't emit SQL to the database - dump it instead
    #[arg(long)]
    pub sql: bool,
    /// Revision the new one is based on
    #[arg(long, default_value = "head")]
    pub head: String,
    /// Allow a non-head revision as the base
    #[arg(long)]
    pub splice: bool,
    /// Branch label for the new revision
    #[arg(long)]
    pub branch_label: Option<String>,
    /// Explicit revision id instead of a generated one
    #[arg(long)]
    pub rev_id: Option<String>,
}

impl RevisionCli {
    fn into_args(self, autogenerate: bool) -> RevisionArgs {
        RevisionArgs {
            message: self.message,
            autogenerate,
            sql: self.sql,
            head: Some(self.head),
            splice: self.splice,
            branch_label: self.branch_label,
            rev_id: self.rev_id,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Create a new migration directory
    Init {
        /// Multi-database layout; implied when more than one engine is configured
        #[arg(long)]
        multiple: bool,
    },
    /// Create a new revision file
    Revision {
        #[command(flatten)]
        args: RevisionCli,
        /// Populate the revision from model changes
        #[arg(long)]
        autogenerate: bool,
    },
    /// Autogenerate a new revision file (revision --autogenerate)
    Migrate {
        #[command(flatten)]
        args: RevisionCli,
    },
    /// Edit a revision file
    Edit {
        #[arg(default_value = "head")]
        revision: String,
    },
    /// Merge two or more revisions into one
    Merge {
        #[arg(required = true)]
        revisions: Vec<String>,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        branch_label: Option<String>,
        #[arg(long)]
        rev_id: Option<String>,
    },
    /// Upgrade to a later version
    Upgrade {
        #[arg(default_value = "head")]
        revision: String,
        #[arg(long)]
        sql: bool,
        /// Arbitrary tag recorded in the migration log
        #[arg(long)]
        tag: Option<String>,
    },
    /// Revert to a previous version
    Downgrade {
        #[arg(default_value = "-1", allow_hyphen_values = true)]
        revision: String,
        #[arg(long)]
        sql: bool,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show the revision denoted by the given symbol
    Show {
        #[arg(default_value = "head")]
        revision: String,
    },
    /// List changeset scripts in chronological order
    History {
        /// Range of revisions, `[start]:[end]`
        #[arg(short, long)]
        rev_range: Option<String>,
        #[arg(short, long)]
        verbose: bool,
        /// Mark the revisions applied to the database
        #[arg(short, long)]
        indicate_current: bool,
    },
    /// Show current available heads
    Heads {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show current branch points
    Branches {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Display the current revision of each database
    Current {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Mark the revision table with the given revision without running migrations
    Stamp {
        #[arg(default_value = "head")]
        revision: String,
        #[arg(long)]
        sql: bool,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Fail if the models hold changes not covered by a revision
    Check,
}

/// Run one command and return what it prints.
///
/// # Errors
/// Any migration or database failure, flattened into a user-facing message.
pub fn run(manager: &EngineManager, args: DbArgs) -> anyhow::Result<String> {
    let mut commands = Commands::new(manager);
    if let Some(directory) = args.directory {
        commands = commands.with_directory(directory);
    }
    let output = match args.command {
        DbCommand::Init { multiple } => {
            commands.init(multiple || manager.engines().len() > 1)
        }
        DbCommand::Revision { args, autogenerate } => manager
            .block_on(commands.revision(&args.into_args(autogenerate)))
            .map(|rev| describe_written(rev.as_ref())),
        DbCommand::Migrate { args } => manager
            .block_on(commands.migrate(args.into_args(true)))
            .map(|rev| describe_written(rev.as_ref())),
        DbCommand::Edit { revision } => commands
            .edit(&revision)
            .map(|path| path.display().to_string()),
        DbCommand::Merge {
            revisions,
            message,
            branch_label,
            rev_id,
        } => commands
            .merge(&revisions, message, branch_label, rev_id)
            .map(|rev| describe_written(Some(&rev))),
        DbCommand::Upgrade { revision, sql, tag } => {
            manager.block_on(commands.upgrade(&revision, sql, tag.as_deref()))
        }
        DbCommand::Downgrade { revision, sql, tag } => {
            manager.block_on(commands.downgrade(&revision, sql, tag.as_deref()))
        }
        DbCommand::Show { revision } => commands.show(&revision),
        DbCommand::History {
            rev_range,
            verbose,
            indicate_current,
        } => manager.block_on(commands.history(rev_range.as_deref(), verbose, indicate_current)),
        DbCommand::Heads { verbose } => commands.heads(verbose),
        DbCommand::Branches { verbose } => commands.branches(verbose),
        DbCommand::Current { verbose } => manager.block_on(commands.current(verbose)),
        DbCommand::Stamp { revision, sql, tag } => {
            manager.block_on(commands.stamp(&revision, sql, tag.as_deref()))
        }
        DbCommand::Check => manager.block_on(commands.check()),
    };
    output.map_err(anyhow::Error::new)
}

fn describe_written(revision: Option<&crate::migration::Revision>) -> String {
    match revision {
        Some(rev) => format!("Generating {} ... done", rev.path.display()),
        None => String::new(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        db: DbArgs,
    }

    #[test]
    fn test_downgrade_accepts_relative_target() {
        let cli = TestCli::try_parse_from(["app", "downgrade", "-2", "--sql"]).unwrap();
        let DbCommand::Downgrade { revision, sql, .. } = cli.db.command else {
            panic!("expected downgrade");
        };
        assert_eq!(revision, "-2");
        assert!(sql);
    }

    #[test]
    fn test_revision_flags() {
        let cli = TestCli::try_parse_from([
            "app",
            "-d",
            "/tmp/migrations",
            "revision",
            "-m",
            "add users",
            "--autogenerate",
        ])
        .unwrap();
        assert_eq!(cli.db.directory, Some(PathBuf::from("/tmp/migrations")));
        let DbCommand::Revision { args, autogenerate } = cli.db.command else {
            panic!("expected revision");
        };
        assert!(autogenerate);
        assert_eq!(args.message.as_deref(), Some("add users"));
        assert_eq!(args.head, "head");
    }
}
