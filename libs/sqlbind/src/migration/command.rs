//! Programmatic migration commands behind the `db` CLI.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use super::context::{ContextConfig, MigrationAction};
use super::environment::{MigrationEnvironment, MigrationRun, environment_for};
use super::script::{Revision, RevisionScript, ScriptDirectory, new_rev_id};
use super::MigrationError;
use crate::Result;
use crate::manager::EngineManager;

/// Arguments of `revision` and `migrate`.
#[derive(Clone, Debug, Default)]
pub struct RevisionArgs {
    pub message: Option<String>,
    pub autogenerate: bool,
    /// Don't touch the database. Incompatible with `autogenerate`.
    pub sql: bool,
    /// Revision the new one is based on; `head` when unset.
    pub head: Option<String>,
    /// Allow basing the revision on a non-head, creating a branch.
    pub splice: bool,
    pub branch_label: Option<String>,
    pub rev_id: Option<String>,
}

/// Migration commands over an engine manager's databases.
pub struct Commands<'a> {
    manager: &'a EngineManager,
    config: ContextConfig,
    directory: PathBuf,
}

impl std::fmt::Debug for Commands<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commands")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn split_range(range: &str) -> (Option<&str>, &str) {
    match range.split_once(':') {
        Some((from, to)) => ((!from.is_empty()).then_some(from), to),
        None => (None, range),
    }
}

impl<'a> Commands<'a> {
    /// Commands using the manager's migration options.
    #[must_use]
    pub fn new(manager: &'a EngineManager) -> Self {
        let options = manager.migration_options();
        Self {
            manager,
            config: ContextConfig::from_options(&options.context_configure),
            directory: options.directory.clone(),
        }
    }

    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn environment(&self) -> Box<dyn MigrationEnvironment> {
        environment_for(self.manager, self.config.clone(), &self.directory)
    }

    fn scripts(&self) -> Result<ScriptDirectory> {
        ScriptDirectory::load(&self.directory)
    }

    /// Applied set implied by the `from` half of an offline range.
    fn offline_applied(scripts: &ScriptDirectory, from: Option<&str>) -> Result<BTreeSet<String>> {
        match from {
            Some(from) => {
                let targets = scripts.resolve_targets(from)?;
                Ok(scripts.ancestors(targets.iter().map(String::as_str)))
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Create a new migration directory.
    ///
    /// # Errors
    /// Returns `DirectoryExists` for a non-empty directory.
    pub fn init(&self, multiple: bool) -> Result<String> {
        ScriptDirectory::init(&self.directory, multiple)?;
        info!(directory = %self.directory.display(), multiple, "migration directory created");
        Ok(format!(
            "Creating directory '{}' ... done\nPlease edit configuration settings before proceeding.",
            self.directory.display()
        ))
    }

    fn base_revisions(scripts: &ScriptDirectory, args: &RevisionArgs) -> Result<Vec<String>> {
        let head = args.head.as_deref().unwrap_or("head");
        let targets = scripts.resolve_targets(head)?;
        if !args.splice {
            let heads = scripts.head_ids();
            if let Some(not_head) = targets.iter().find(|t| !heads.contains(*t)) {
                return Err(MigrationError::NotAHead(not_head.clone()).into());
            }
        }
        Ok(targets)
    }

    fn ensure_up_to_date(scripts: &ScriptDirectory, run: &MigrationRun) -> Result<()> {
        let heads: Vec<String> = scripts.head_ids().into_iter().collect();
        for report in &run.reports {
            let mut current = report.current_heads.clone();
            current.sort();
            if current != heads {
                return Err(MigrationError::NotUpToDate.into());
            }
        }
        Ok(())
    }

    /// Create a new revision, optionally autogenerated from the models.
    ///
    /// Returns `None` when autogeneration found nothing to do and the
    /// revision was discarded.
    ///
    /// # Errors
    /// Returns `NotUpToDate` when autogenerating against a database that is
    /// behind the scripts, `MultipleHeads`/`NotAHead` for bad bases, or
    /// the underlying database error.
    pub async fn revision(&self, args: &RevisionArgs) -> Result<Option<Revision>> {
        if args.autogenerate && args.sql {
            return Err(MigrationError::Usage(
                "Using --sql with --autogenerate does not make any sense".to_owned(),
            )
            .into());
        }
        let mut scripts = self.scripts()?;
        let down_revisions = Self::base_revisions(&scripts, args)?;
        let rev_id = args.rev_id.clone().unwrap_or_else(new_rev_id);
        let env = self.environment();

        let directives = if args.autogenerate {
            let run = env.run_online(&MigrationAction::Autogenerate, &scripts).await?;
            Self::ensure_up_to_date(&scripts, &run)?;
            let script = run.revision_script(rev_id, args.message.clone());
            let mut directives = vec![script];
            env.process_revision_directives(&mut directives);
            directives
        } else {
            let mut script = RevisionScript {
                rev_id,
                message: args.message.clone(),
                ..RevisionScript::default()
            };
            for ctx in env.contexts() {
                script
                    .upgrade_ops
                    .insert(ctx.upgrade_token().to_owned(), Vec::new());
                script
                    .downgrade_ops
                    .insert(ctx.downgrade_token().to_owned(), Vec::new());
            }
            vec![script]
        };

        let mut written = None;
        for mut script in directives {
            if script.down_revisions.is_empty() {
                script.down_revisions.clone_from(&down_revisions);
            }
            if let Some(label) = &args.branch_label {
                script.branch_labels = vec![label.clone()];
            }
            let revision = scripts.write(script.into_revision())?;
            info!(
                revision = %revision.revision,
                path = %revision.path.display(),
                "Generating revision ... done"
            );
            if written.is_none() {
                written = Some(revision);
            }
        }
        Ok(written)
    }

    /// Autogenerate a revision.
    ///
    /// # Errors
    /// See [`Commands::revision`].
    pub async fn migrate(&self, mut args: RevisionArgs) -> Result<Option<Revision>> {
        args.autogenerate = true;
        self.revision(&args).await
    }

    /// Open a revision file in `$EDITOR` (`vi` when unset).
    ///
    /// # Errors
    /// Returns lookup errors, or `Usage` when the editor fails.
    pub fn edit(&self, revision: &str) -> Result<PathBuf> {
        let scripts = self.scripts()?;
        let targets = scripts.resolve_targets(revision)?;
        let [id] = targets.as_slice() else {
            return Err(MigrationError::MultipleHeads(revision.to_owned()).into());
        };
        let path = scripts.resolve(id)?.path.clone();
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_owned());
        let status = Command::new(&editor).arg(&path).status()?;
        if !status.success() {
            return Err(MigrationError::Usage(format!("Editor '{editor}' exited with {status}")).into());
        }
        Ok(path)
    }

    /// Join two or more revisions into one.
    ///
    /// # Errors
    /// Returns `Usage` when fewer than two revisions are given, or lookup errors.
    pub fn merge(
        &self,
        revisions: &[String],
        message: Option<String>,
        branch_label: Option<String>,
        rev_id: Option<String>,
    ) -> Result<Revision> {
        let mut scripts = self.scripts()?;
        let mut parents = Vec::new();
        for rev in revisions {
            for id in scripts.resolve_targets(rev)? {
                if !parents.contains(&id) {
                    parents.push(id);
                }
            }
        }
        if parents.len() < 2 {
            return Err(MigrationError::Usage("Merge needs at least two revisions".to_owned()).into());
        }
        let mut script = RevisionScript {
            rev_id: rev_id.unwrap_or_else(new_rev_id),
            message,
            down_revisions: parents,
            branch_labels: branch_label.into_iter().collect(),
            ..RevisionScript::default()
        };
        for ctx in self.environment().contexts() {
            script
                .upgrade_ops
                .insert(ctx.upgrade_token().to_owned(), Vec::new());
            script
                .downgrade_ops
                .insert(ctx.downgrade_token().to_owned(), Vec::new());
        }
        scripts.write(script.into_revision())
    }

    async fn apply(
        &self,
        action: &MigrationAction,
        sql: bool,
        from: Option<&str>,
        tag: Option<&str>,
    ) -> Result<String> {
        let scripts = self.scripts()?;
        let env = self.environment();
        if let Some(tag) = tag {
            info!(tag, "migration tag");
        }
        if sql {
            let applied = Self::offline_applied(&scripts, from)?;
            let mut out = Vec::new();
            env.run_offline(action, &scripts, &applied, &mut out)?;
            return String::from_utf8(out).map_err(|e| MigrationError::Usage(e.to_string()).into());
        }
        let run = env.run_online(action, &scripts).await?;
        let lines: Vec<String> = run
            .reports
            .iter()
            .map(|report| {
                let heads = if report.current_heads.is_empty() {
                    "<base>".to_owned()
                } else {
                    report.current_heads.join(", ")
                };
                format!(
                    "{}: {} revision(s), now at {heads}",
                    report.bind_key,
                    report.revisions.len()
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    /// Upgrade to a later revision (`head`, `heads`, an id or `+N`).
    ///
    /// With `sql` the statements are rendered instead, from an optional
    /// `from:` revision.
    ///
    /// # Errors
    /// Returns lookup errors or the failing database's error.
    pub async fn upgrade(&self, revision: &str, sql: bool, tag: Option<&str>) -> Result<String> {
        let (from, to) = split_range(revision);
        if from.is_some() && !sql {
            return Err(MigrationError::Usage("Range revision not allowed".to_owned()).into());
        }
        self.apply(&MigrationAction::Upgrade { target: to.to_owned() }, sql, from, tag)
            .await
    }

    /// Revert to a previous revision (`base`, an id or `-N`).
    ///
    /// # Errors
    /// Returns `Usage` for `sql` without a `from:to` range, lookup errors, or
    /// the failing database's error.
    pub async fn downgrade(&self, revision: &str, sql: bool, tag: Option<&str>) -> Result<String> {
        let (from, to) = split_range(revision);
        if sql && from.is_none() {
            return Err(MigrationError::Usage(
                "downgrade with --sql requires <fromrev>:<torev>".to_owned(),
            )
            .into());
        }
        if from.is_some() && !sql {
            return Err(MigrationError::Usage("Range revision not allowed".to_owned()).into());
        }
        self.apply(&MigrationAction::Downgrade { target: to.to_owned() }, sql, from, tag)
            .await
    }

    /// Record `revision` as current without running migrations.
    ///
    /// # Errors
    /// Returns lookup errors or the failing database's error.
    pub async fn stamp(&self, revision: &str, sql: bool, tag: Option<&str>) -> Result<String> {
        let (from, to) = split_range(revision);
        self.apply(&MigrationAction::Stamp { target: to.to_owned() }, sql, from, tag)
            .await
    }

    /// Describe the given revision(s).
    ///
    /// # Errors
    /// Returns lookup errors.
    pub fn show(&self, revision: &str) -> Result<String> {
        let scripts = self.scripts()?;
        let entries = scripts
            .resolve_targets(revision)?
            .iter()
            .map(|id| Ok(scripts.log_entry(scripts.resolve(id)?, true)))
            .collect::<Result<Vec<_>>>()?;
        Ok(entries.join("\n\n"))
    }

    /// List revisions newest first, optionally limited to `start:end`.
    ///
    /// # Errors
    /// Returns lookup errors, or the database error with `indicate_current`.
    pub async fn history(
        &self,
        rev_range: Option<&str>,
        verbose: bool,
        indicate_current: bool,
    ) -> Result<String> {
        let scripts = self.scripts()?;
        let (lower, upper) = match rev_range {
            Some(range) => {
                let (start, end) = split_range(range);
                (start, (!end.is_empty()).then_some(end))
            }
            None => (None, None),
        };
        let included = match upper {
            Some(end) => {
                let targets = scripts.resolve_targets(end)?;
                Some(scripts.ancestors(targets.iter().map(String::as_str)))
            }
            None => None,
        };
        let excluded = match lower {
            Some(start) => {
                let targets = scripts.resolve_targets(start)?;
                let mut below = scripts.ancestors(targets.iter().map(String::as_str));
                for t in &targets {
                    below.remove(t);
                }
                below
            }
            None => BTreeSet::new(),
        };
        let current: BTreeSet<String> = if indicate_current {
            let run = self
                .environment()
                .run_online(&MigrationAction::Current, &scripts)
                .await?;
            run.reports
                .into_iter()
                .flat_map(|r| r.current_heads)
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut revisions = scripts.topological();
        revisions.reverse();
        let entries: Vec<String> = revisions
            .into_iter()
            .filter(|r| included.as_ref().is_none_or(|set| set.contains(&r.revision)))
            .filter(|r| !excluded.contains(&r.revision))
            .map(|r| scripts.history_entry(r, verbose, current.contains(&r.revision)))
            .collect();
        Ok(entries.join(if verbose { "\n\n" } else { "\n" }))
    }

    /// # Errors
    /// Returns `NotInitialized` or script errors.
    pub fn heads(&self, verbose: bool) -> Result<String> {
        let scripts = self.scripts()?;
        Ok(scripts
            .heads()
            .into_iter()
            .map(|r| scripts.log_entry(r, verbose))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// # Errors
    /// Returns `NotInitialized` or script errors.
    pub fn branches(&self, verbose: bool) -> Result<String> {
        let scripts = self.scripts()?;
        Ok(scripts
            .branch_points()
            .into_iter()
            .map(|r| scripts.log_entry(r, verbose))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Current revision of every database.
    ///
    /// # Errors
    /// Returns the failing database's error.
    pub async fn current(&self, verbose: bool) -> Result<String> {
        let scripts = self.scripts()?;
        let run = self
            .environment()
            .run_online(&MigrationAction::Current, &scripts)
            .await?;
        let multiple = run.reports.len() > 1;
        let mut lines = Vec::new();
        for report in &run.reports {
            for head in &report.current_heads {
                let entry = match scripts.get(head) {
                    Some(revision) if verbose => scripts.log_entry(revision, true),
                    Some(revision) if scripts.head_ids().contains(&revision.revision) => {
                        format!("{head} (head)")
                    }
                    _ => head.clone(),
                };
                if multiple {
                    lines.push(format!("{}: {entry}", report.bind_key));
                } else {
                    lines.push(entry);
                }
            }
        }
        Ok(lines.join("\n"))
    }

    /// Fail when the models have changes no revision covers.
    ///
    /// # Errors
    /// Returns `NotUpToDate` when the database is behind the scripts and
    /// `NewOperations` listing pending changes.
    pub async fn check(&self) -> Result<String> {
        let scripts = self.scripts()?;
        let run = self
            .environment()
            .run_online(&MigrationAction::Autogenerate, &scripts)
            .await?;
        Self::ensure_up_to_date(&scripts, &run)?;
        let pending: Vec<String> = run
            .reports
            .iter()
            .filter_map(|r| r.diff.as_ref())
            .flat_map(|d| d.upgrade.iter().map(ToString::to_string))
            .collect();
        if pending.is_empty() {
            Ok("No new upgrade operations detected.".to_owned())
        } else {
            Err(MigrationError::NewOperations(format!("[{}]", pending.join(", "))).into())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_split_range() {
        assert_eq!(split_range("abc:head"), (Some("abc"), "head"));
        assert_eq!(split_range(":head"), (None, "head"));
        assert_eq!(split_range("head"), (None, "head"));
    }
}
