//! Revision scripts on disk and the graph they form.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::MigrationError;
use super::ops::Operation;
use crate::Result;

const VERSIONS_DIR: &str = "versions";
const SLUG_MAX_LEN: usize = 40;

/// One revision file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision: String,
    #[serde(default)]
    pub down_revisions: Vec<String>,
    #[serde(default)]
    pub branch_labels: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub create_date: String,
    /// Operation lists keyed by upgrade/downgrade token.
    #[serde(flatten)]
    pub operations: BTreeMap<String, Vec<Operation>>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Revision {
    /// Operations stored under `token`; empty when the token is absent.
    #[must_use]
    pub fn ops(&self, token: &str) -> &[Operation] {
        self.operations.get(token).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_merge_point(&self) -> bool {
        self.down_revisions.len() > 1
    }

    #[must_use]
    pub fn is_base(&self) -> bool {
        self.down_revisions.is_empty()
    }

    fn down_display(&self) -> String {
        if self.down_revisions.is_empty() {
            "<base>".to_owned()
        } else {
            self.down_revisions.join(", ")
        }
    }
}

/// A revision about to be written, after autogeneration and before directive processing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevisionScript {
    pub rev_id: String,
    pub message: Option<String>,
    pub down_revisions: Vec<String>,
    pub branch_labels: Vec<String>,
    /// Upgrade operation groups keyed by upgrade token.
    pub upgrade_ops: BTreeMap<String, Vec<Operation>>,
    /// Downgrade operation groups keyed by downgrade token.
    pub downgrade_ops: BTreeMap<String, Vec<Operation>>,
}

impl RevisionScript {
    /// Whether no group holds any upgrade operation.
    #[must_use]
    pub fn upgrades_empty(&self) -> bool {
        self.upgrade_ops.values().all(Vec::is_empty)
    }

    #[must_use]
    pub fn into_revision(self) -> Revision {
        let mut operations = self.upgrade_ops;
        operations.extend(self.downgrade_ops);
        Revision {
            revision: self.rev_id,
            down_revisions: self.down_revisions,
            branch_labels: self.branch_labels,
            message: self.message,
            create_date: Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            operations,
            path: PathBuf::new(),
        }
    }
}

/// New random revision id.
#[must_use]
pub fn new_rev_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_owned()
}

fn slug(message: Option<&str>) -> String {
    let raw = message.unwrap_or_default().to_ascii_lowercase();
    let mut out = String::new();
    for word in raw
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            if out.len() + 1 + word.len() > SLUG_MAX_LEN {
                break;
            }
            out.push('_');
        }
        out.push_str(word);
    }
    out.truncate(SLUG_MAX_LEN);
    out
}

/// The migration directory and every revision in it.
#[derive(Clone, Debug)]
pub struct ScriptDirectory {
    dir: PathBuf,
    revisions: BTreeMap<String, Revision>,
}

impl ScriptDirectory {
    /// Create an empty migration directory.
    ///
    /// # Errors
    /// Returns `MigrationError::DirectoryExists` for a non-empty directory.
    pub fn init(dir: &Path, multiple: bool) -> Result<()> {
        if dir.exists() && fs::read_dir(dir)?.next().is_some() {
            return Err(MigrationError::DirectoryExists(dir.to_path_buf()).into());
        }
        fs::create_dir_all(dir.join(VERSIONS_DIR))?;
        let readme = if multiple {
            "Multi-database migration scripts.\n\n\
             Each revision holds `<bind_key>_upgrades` and `<bind_key>_downgrades` \
             operation lists, one pair per configured database.\n"
        } else {
            "Single-database migration scripts.\n\n\
             Each revision holds `upgrades` and `downgrades` operation lists.\n"
        };
        fs::write(dir.join("README"), readme)?;
        Ok(())
    }

    /// Load every revision under `<dir>/versions`.
    ///
    /// # Errors
    /// Returns `MigrationError::NotInitialized` if the directory is missing and
    /// `MigrationError::InvalidScript` for unreadable or inconsistent scripts.
    pub fn load(dir: &Path) -> Result<Self> {
        let versions = dir.join(VERSIONS_DIR);
        if !versions.is_dir() {
            return Err(MigrationError::NotInitialized(dir.to_path_buf()).into());
        }
        let mut revisions = BTreeMap::new();
        for entry in fs::read_dir(&versions)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let mut revision: Revision = serde_json::from_str(&fs::read_to_string(&path)?)
                .map_err(|e| MigrationError::InvalidScript {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            revision.path = path.clone();
            if let Some(previous) = revisions.insert(revision.revision.clone(), revision) {
                return Err(MigrationError::InvalidScript {
                    path,
                    reason: format!("duplicate revision id '{}'", previous.revision),
                }
                .into());
            }
        }
        for revision in revisions.values() {
            if let Some(missing) = revision
                .down_revisions
                .iter()
                .find(|down| !revisions.contains_key(*down))
            {
                return Err(MigrationError::InvalidScript {
                    path: revision.path.clone(),
                    reason: format!("down revision '{missing}' does not exist"),
                }
                .into());
            }
        }
        debug!(dir = %dir.display(), revisions = revisions.len(), "script directory loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            revisions,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn versions_dir(&self) -> PathBuf {
        self.dir.join(VERSIONS_DIR)
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Revision> {
        self.revisions.get(id)
    }

    /// Look up a revision by id, branch label or unique id prefix.
    ///
    /// # Errors
    /// Returns `UnknownRevision` or `AmbiguousRevision`.
    pub fn resolve(&self, id: &str) -> Result<&Revision> {
        if let Some(revision) = self.revisions.get(id) {
            return Ok(revision);
        }
        if let Some(revision) = self
            .revisions
            .values()
            .find(|r| r.branch_labels.iter().any(|l| l == id))
        {
            return Ok(revision);
        }
        let candidates: Vec<&Revision> = self
            .revisions
            .values()
            .filter(|r| r.revision.starts_with(id))
            .collect();
        match candidates.as_slice() {
            [one] => Ok(one),
            [] => Err(MigrationError::UnknownRevision(id.to_owned()).into()),
            many => Err(MigrationError::AmbiguousRevision {
                prefix: id.to_owned(),
                candidates: many
                    .iter()
                    .map(|r| r.revision.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
            .into()),
        }
    }

    fn children(&self, id: &str) -> Vec<&Revision> {
        self.revisions
            .values()
            .filter(|r| r.down_revisions.iter().any(|d| d == id))
            .collect()
    }

    /// Revisions nothing revises.
    #[must_use]
    pub fn heads(&self) -> Vec<&Revision> {
        self.revisions
            .values()
            .filter(|r| self.children(&r.revision).is_empty())
            .collect()
    }

    #[must_use]
    pub fn head_ids(&self) -> BTreeSet<String> {
        self.heads().iter().map(|r| r.revision.clone()).collect()
    }

    #[must_use]
    pub fn bases(&self) -> Vec<&Revision> {
        self.revisions.values().filter(|r| r.is_base()).collect()
    }

    /// Revisions revised by more than one child.
    #[must_use]
    pub fn branch_points(&self) -> Vec<&Revision> {
        self.revisions
            .values()
            .filter(|r| self.children(&r.revision).len() > 1)
            .collect()
    }

    /// `ids` plus everything they (transitively) revise.
    #[must_use]
    pub fn ancestors<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = ids.into_iter().map(ToOwned::to_owned).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(revision) = self.revisions.get(&id) {
                stack.extend(revision.down_revisions.iter().cloned());
            }
        }
        seen
    }

    /// Every revision with its parents first; ties break by id.
    #[must_use]
    pub fn topological(&self) -> Vec<&Revision> {
        let mut pending: BTreeMap<&str, usize> = self
            .revisions
            .values()
            .map(|r| (r.revision.as_str(), r.down_revisions.len()))
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(self.revisions.len());
        while let Some(id) = ready.pop_first() {
            pending.remove(id);
            let Some(revision) = self.revisions.get(id) else {
                continue;
            };
            out.push(revision);
            for child in self.children(id) {
                if let Some(n) = pending.get_mut(child.revision.as_str()) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        ready.insert(child.revision.as_str());
                    }
                }
            }
        }
        out
    }

    /// Heads among the applied revisions.
    #[must_use]
    pub fn current_heads(&self, applied: &BTreeSet<String>) -> Vec<String> {
        applied
            .iter()
            .filter(|id| {
                !applied.iter().any(|other| {
                    self.revisions
                        .get(other)
                        .is_some_and(|r| r.down_revisions.contains(id))
                })
            })
            .cloned()
            .collect()
    }

    /// Resolve `head`, `heads`, `base` or a revision id into revision ids.
    ///
    /// # Errors
    /// Returns `MultipleHeads` when `head` is ambiguous or lookup errors.
    pub fn resolve_targets(&self, target: &str) -> Result<Vec<String>> {
        match target {
            "heads" => Ok(self.head_ids().into_iter().collect()),
            "head" => {
                let heads = self.head_ids();
                if heads.len() > 1 {
                    return Err(MigrationError::MultipleHeads(target.to_owned()).into());
                }
                Ok(heads.into_iter().collect())
            }
            "base" => Ok(Vec::new()),
            id => Ok(vec![self.resolve(id)?.revision.clone()]),
        }
    }

    /// Revisions to apply, in order, to go from `applied` to `target`.
    ///
    /// # Errors
    /// Returns lookup errors or `RelativeOutOfRange` for `+N` past the heads.
    pub fn upgrade_plan(&self, applied: &BTreeSet<String>, target: &str) -> Result<Vec<&Revision>> {
        if let Some(steps) = relative(target, '+') {
            let wanted = self.ancestors(self.head_ids().iter().map(String::as_str));
            let plan: Vec<&Revision> = self
                .topological()
                .into_iter()
                .filter(|r| wanted.contains(&r.revision) && !applied.contains(&r.revision))
                .take(steps)
                .collect();
            if plan.len() < steps {
                return Err(MigrationError::RelativeOutOfRange(target.to_owned()).into());
            }
            return Ok(plan);
        }
        let targets = self.resolve_targets(target)?;
        let wanted = self.ancestors(targets.iter().map(String::as_str));
        Ok(self
            .topological()
            .into_iter()
            .filter(|r| wanted.contains(&r.revision) && !applied.contains(&r.revision))
            .collect())
    }

    /// Revisions to revert, in order, to go from `applied` down to `target`.
    ///
    /// # Errors
    /// Returns lookup errors or `RelativeOutOfRange` for `-N` past the base.
    pub fn downgrade_plan(
        &self,
        applied: &BTreeSet<String>,
        target: &str,
    ) -> Result<Vec<&Revision>> {
        let mut applied_desc: Vec<&Revision> = self
            .topological()
            .into_iter()
            .filter(|r| applied.contains(&r.revision))
            .collect();
        applied_desc.reverse();

        if let Some(steps) = relative(target, '-') {
            if applied_desc.len() < steps {
                return Err(MigrationError::RelativeOutOfRange(target.to_owned()).into());
            }
            applied_desc.truncate(steps);
            return Ok(applied_desc);
        }
        let keep = self.ancestors(self.resolve_targets(target)?.iter().map(String::as_str));
        Ok(applied_desc
            .into_iter()
            .filter(|r| !keep.contains(&r.revision))
            .collect())
    }

    /// Write a revision file and register it.
    ///
    /// # Errors
    /// Returns I/O or serialization errors.
    pub fn write(&mut self, mut revision: Revision) -> Result<Revision> {
        let slug = slug(revision.message.as_deref());
        let file = if slug.is_empty() {
            format!("{}.json", revision.revision)
        } else {
            format!("{}_{slug}.json", revision.revision)
        };
        let path = self.versions_dir().join(file);
        fs::write(&path, serde_json::to_string_pretty(&revision)?)?;
        revision.path = path;
        self.revisions
            .insert(revision.revision.clone(), revision.clone());
        Ok(revision)
    }

    fn flags(&self, revision: &Revision, current: bool) -> String {
        let mut flags = Vec::new();
        if self.children(&revision.revision).is_empty() {
            flags.push("head");
        }
        if self.children(&revision.revision).len() > 1 {
            flags.push("branchpoint");
        }
        if revision.is_merge_point() {
            flags.push("mergepoint");
        }
        if current {
            flags.push("current");
        }
        if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        }
    }

    /// One-line (or verbose multi-line) description of a revision.
    #[must_use]
    pub fn log_entry(&self, revision: &Revision, verbose: bool) -> String {
        self.history_entry(revision, verbose, false)
    }

    /// [`ScriptDirectory::log_entry`], flagging revisions applied to the database.
    #[must_use]
    pub fn history_entry(&self, revision: &Revision, verbose: bool, current: bool) -> String {
        let message = revision.message.as_deref().unwrap_or_default();
        if !verbose {
            return format!(
                "{} -> {}{}, {message}",
                revision.down_display(),
                revision.revision,
                self.flags(revision, current)
            );
        }
        let mut lines = vec![
            format!("Rev: {}{}", revision.revision, self.flags(revision, current)),
            format!("Parent: {}", revision.down_display()),
        ];
        let children = self.children(&revision.revision);
        if children.len() > 1 {
            let ids: Vec<&str> = children.iter().map(|c| c.revision.as_str()).collect();
            lines.push(format!("Branches into: {}", ids.join(", ")));
        }
        if !revision.branch_labels.is_empty() {
            lines.push(format!("Branch names: {}", revision.branch_labels.join(", ")));
        }
        lines.push(format!("Path: {}", revision.path.display()));
        lines.push(String::new());
        lines.push(format!("    {message}"));
        lines.push(String::new());
        lines.push(format!("    Revision ID: {}", revision.revision));
        lines.push(format!("    Revises: {}", revision.down_revisions.join(", ")));
        lines.push(format!("    Create Date: {}", revision.create_date));
        lines.join("\n")
    }
}

fn relative(target: &str, sign: char) -> Option<usize> {
    target.strip_prefix(sign)?.parse().ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn script(id: &str, down: &[&str]) -> Revision {
        RevisionScript {
            rev_id: id.to_owned(),
            message: Some(format!("rev {id}")),
            down_revisions: down.iter().map(|d| (*d).to_owned()).collect(),
            ..RevisionScript::default()
        }
        .into_revision()
    }

    fn directory(revisions: &[Revision]) -> (tempfile::TempDir, ScriptDirectory) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("migrations");
        ScriptDirectory::init(&dir, false).unwrap();
        let mut scripts = ScriptDirectory::load(&dir).unwrap();
        for revision in revisions {
            scripts.write(revision.clone()).unwrap();
        }
        (tmp, ScriptDirectory::load(&dir).unwrap())
    }

    fn ids(revisions: &[&Revision]) -> Vec<String> {
        revisions.iter().map(|r| r.revision.clone()).collect()
    }

    #[test]
    fn test_init_refuses_non_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep"), "x").unwrap();
        let err = ScriptDirectory::init(tmp.path(), false).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");
    }

    #[test]
    fn test_missing_directory_asks_for_init() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ScriptDirectory::load(&tmp.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("'init' command"), "{err}");
    }

    #[test]
    fn test_linear_plans() {
        let (_tmp, dir) = directory(&[script("aaa", &[]), script("bbb", &["aaa"]), script("ccc", &["bbb"])]);
        assert_eq!(dir.head_ids(), BTreeSet::from(["ccc".to_owned()]));

        let none = BTreeSet::new();
        assert_eq!(ids(&dir.upgrade_plan(&none, "head").unwrap()), ["aaa", "bbb", "ccc"]);
        assert_eq!(ids(&dir.upgrade_plan(&none, "+2").unwrap()), ["aaa", "bbb"]);
        assert_eq!(ids(&dir.upgrade_plan(&none, "bb").unwrap()), ["aaa", "bbb"]);

        let all = dir.ancestors(["ccc"]);
        assert_eq!(dir.current_heads(&all), ["ccc"]);
        assert_eq!(ids(&dir.downgrade_plan(&all, "-1").unwrap()), ["ccc"]);
        assert_eq!(ids(&dir.downgrade_plan(&all, "aaa").unwrap()), ["ccc", "bbb"]);
        assert_eq!(ids(&dir.downgrade_plan(&all, "base").unwrap()), ["ccc", "bbb", "aaa"]);
        assert!(dir.downgrade_plan(&all, "-4").is_err());
    }

    #[test]
    fn test_branches_and_merge() {
        let (_tmp, dir) = directory(&[
            script("aaa", &[]),
            script("bb1", &["aaa"]),
            script("bb2", &["aaa"]),
        ]);
        assert!(matches!(
            dir.resolve_targets("head"),
            Err(crate::DbError::Migration(MigrationError::MultipleHeads(_)))
        ));
        assert_eq!(dir.resolve_targets("heads").unwrap(), ["bb1", "bb2"]);
        assert_eq!(ids(&dir.branch_points()), ["aaa"]);
        assert!(matches!(
            dir.resolve("bb"),
            Err(crate::DbError::Migration(MigrationError::AmbiguousRevision { .. }))
        ));

        let (_tmp2, merged) = directory(&[
            script("aaa", &[]),
            script("bb1", &["aaa"]),
            script("bb2", &["aaa"]),
            script("ccc", &["bb1", "bb2"]),
        ]);
        let entry = merged.log_entry(merged.get("ccc").unwrap(), false);
        assert_eq!(entry, "bb1, bb2 -> ccc (head, mergepoint), rev ccc");
    }

    #[test]
    fn test_written_file_name_uses_slug() {
        let (_tmp, mut dir) = directory(&[]);
        let mut revision = script("abc123", &[]);
        revision.message = Some("Create account table!".to_owned());
        let written = dir.write(revision).unwrap();
        assert_eq!(
            written.path.file_name().unwrap(),
            "abc123_create_account_table.json"
        );
    }

    #[test]
    fn test_new_rev_id_is_short_hex() {
        let id = new_rev_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
