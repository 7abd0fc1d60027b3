#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end runs of the demo binary against sqlite files in a temp dir.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn run_demo(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sqlbind-demo"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute sqlbind-demo")
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_sqlbind-demo"))
        .arg("--help")
        .output()
        .unwrap();
    let stdout = stdout_of(&output);
    for command in ["db", "add-user", "add-group", "list-users"] {
        assert!(stdout.contains(command), "help should mention {command}");
    }
}

#[test]
fn test_migrate_then_write_to_both_databases() {
    let root = TempDir::new().unwrap();
    let root = root.path();

    let init = stdout_of(&run_demo(root, &["db", "init"]));
    assert!(init.contains("Creating directory"));
    assert!(root.join("migrations").join("versions").is_dir());

    let revision = stdout_of(&run_demo(root, &["db", "revision", "--autogenerate", "-m", "init"]));
    assert!(revision.starts_with("Generating "));

    let upgrade = stdout_of(&run_demo(root, &["db", "upgrade"]));
    assert_eq!(upgrade.lines().count(), 2);
    assert!(upgrade.starts_with("default: 1 revision(s)"));
    assert!(root.join("sqlite").join("demo.db").is_file());
    assert!(root.join("sqlite").join("groups.db").is_file());

    let check = stdout_of(&run_demo(root, &["db", "check"]));
    assert_eq!(check.trim(), "No new upgrade operations detected.");

    stdout_of(&run_demo(root, &["add-user", "alice"]));
    stdout_of(&run_demo(root, &["add-user", "bob"]));
    let group = stdout_of(&run_demo(root, &["add-group", "admins"]));
    assert_eq!(group.trim(), "group 1 added to 'groups'");

    let users = stdout_of(&run_demo(root, &["list-users", "--per-page", "1", "--page", "2"]));
    assert!(users.contains("bob"));
    assert!(!users.contains("alice"));
    assert!(users.contains("page 2 of 2 (2 users)"));

    let current = stdout_of(&run_demo(root, &["db", "current"]));
    assert!(current.contains("default: "));
    assert!(current.contains("groups: "));
}

#[test]
fn test_errors_print_one_line_and_fail() {
    let root = TempDir::new().unwrap();
    let output = run_demo(root.path(), &["db", "heads"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Please use the 'init' command"));
    assert_eq!(stderr.trim().lines().count(), 1);
}

#[test]
fn test_missing_config_file_fails() {
    let root = TempDir::new().unwrap();
    let output = run_demo(root.path(), &["--config", "/nonexistent/demo.yaml", "db", "heads"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("config file does not exist"));
}
