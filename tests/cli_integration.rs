//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end against a throwaway state
//! directory.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Binary under test, isolated from any user or project config.
fn stagewright(dir: &Path) -> Command {
    let config = dir.join("config.toml");
    if !config.exists() {
        std::fs::write(&config, "").unwrap();
    }

    let mut cmd = Command::cargo_bin("stagewright").unwrap();
    cmd.current_dir(dir)
        .env_remove("STAGEWRIGHT_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(&config)
        .arg("--state-dir")
        .arg(dir.join("state"));
    cmd
}

/// Start a workflow and return its id (first stdout line).
fn start(dir: &Path, run: bool) -> String {
    let mut cmd = stagewright(dir);
    cmd.args(["start", "acme"]);
    if run {
        cmd.arg("--run");
    }
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap().lines().next().unwrap().trim().to_string()
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    Command::cargo_bin("stagewright")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestration"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("stagewright")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_invalid_subcommand() {
    Command::cargo_bin("stagewright").unwrap().arg("launch").assert().failure();
}

// ============================================================================
// Stages
// ============================================================================

#[test]
fn test_stages_lists_lifecycle() {
    let dir = TempDir::new().unwrap();
    stagewright(dir.path())
        .arg("stages")
        .assert()
        .success()
        .stdout(predicate::str::contains("discovery"))
        .stdout(predicate::str::contains("retrospective"))
        .stdout(predicate::str::contains("Total: 12 stages"));
}

#[test]
fn test_stages_json_output() {
    let dir = TempDir::new().unwrap();
    let output = stagewright(dir.path()).args(["stages", "--format", "json"]).assert().success();

    let stages: serde_json::Value = serde_json::from_slice(&output.get_output().stdout).unwrap();
    let stages = stages.as_array().unwrap();
    assert_eq!(stages.len(), 12);
    assert_eq!(stages[0]["order"], 1);
    assert_eq!(stages[0]["id"], "discovery");
}

#[test]
fn test_stage_override_from_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[stages.discovery.retry]\nmax_attempts = 7\n").unwrap();

    let output = stagewright(dir.path()).args(["stages", "--format", "json"]).assert().success();
    let stages: serde_json::Value = serde_json::from_slice(&output.get_output().stdout).unwrap();
    assert_eq!(stages[0]["max_attempts"], 7);
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[stages.nonexistent]\ncontext_budget = 2000\n").unwrap();

    stagewright(dir.path()).arg("stages").assert().failure().stderr(predicate::str::contains("nonexistent"));
}

// ============================================================================
// Workflow Lifecycle
// ============================================================================

#[test]
fn test_start_and_run_to_completion() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), true);

    stagewright(dir.path())
        .args(["status", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: completed"))
        .stdout(predicate::str::contains("Progress: 12/12"));
}

#[test]
fn test_advance_one_stage() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), false);

    stagewright(dir.path())
        .args(["advance", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("discovery"))
        .stdout(predicate::str::contains("Status: running (1 stages committed)"));

    stagewright(dir.path())
        .args(["status", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("next: requirements"));
}

#[test]
fn test_status_json_has_history() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), true);

    let output = stagewright(dir.path()).args(["status", &id, "--format", "json"]).assert().success();
    let snapshot: serde_json::Value = serde_json::from_slice(&output.get_output().stdout).unwrap();
    assert_eq!(snapshot["instance"]["status"], "completed");
    assert_eq!(snapshot["history"].as_array().unwrap().len(), 12);
}

#[test]
fn test_list_shows_workflows() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), false);

    stagewright(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()))
        .stdout(predicate::str::contains("Total: 1 workflows"));
}

#[test]
fn test_cancel_then_advance_fails() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), false);

    stagewright(dir.path())
        .args(["cancel", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));

    stagewright(dir.path()).args(["advance", &id]).assert().failure();
}

#[test]
fn test_restart_requires_failed_workflow() {
    let dir = TempDir::new().unwrap();
    let id = start(dir.path(), false);

    stagewright(dir.path()).args(["restart", &id]).assert().failure();
}

#[test]
fn test_resume_with_nothing_active() {
    let dir = TempDir::new().unwrap();
    stagewright(dir.path())
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("No active workflows"));
}

#[test]
fn test_unknown_workflow_id() {
    let dir = TempDir::new().unwrap();
    stagewright(dir.path())
        .args(["status", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does-not-exist"));
}
