//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end. Nothing here touches the
//! network: commands run against a temporary data directory.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get the binary to test.
fn plugrun() -> Command {
    Command::cargo_bin("plugrun").unwrap()
}

/// A working directory whose `.plugrun.toml` points storage at a temp dir.
fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let config = format!("[storage]\ndata_dir = \"{}\"\n", data.display().to_string().replace('\\', "/"));
    std::fs::write(dir.path().join(".plugrun.toml"), config).unwrap();
    dir
}

fn in_project(dir: &Path) -> Command {
    let mut cmd = plugrun();
    cmd.current_dir(dir);
    cmd
}

const DEMO_PLUGIN: &str = r#"<docs lang="markdown">Demo plugin.</docs>
<config lang="json">
{
  "name": "Demo",
  "type": "web-worker",
  "version": "0.2.0",
  "description": "Says hello.",
  "tags": ["stable", "dev"],
  "dependencies": []
}
</config>
<script lang="javascript" tag="stable">api.export({setup() {}, run() {}})</script>
<script lang="javascript" tag="dev">api.export({setup() {}, run() { debugger }})</script>
"#;

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    plugrun().arg("--help").assert().success().stdout(predicate::str::contains("Dynamic plugin runtime"));
}

#[test]
fn test_version_flag() {
    plugrun().arg("--version").assert().success().stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand() {
    plugrun().arg("frobnicate").assert().failure();
}

// ============================================================================
// Parse Command Tests
// ============================================================================

#[test]
fn test_parse_valid_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Demo.imjoy.html");
    std::fs::write(&path, DEMO_PLUGIN).unwrap();

    plugrun()
        .arg("parse")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("Demo v0.2.0 @stable"))
        .stdout(predicate::str::contains("tags: stable, dev"));
}

#[test]
fn test_parse_json_with_tag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Demo.imjoy.html");
    std::fs::write(&path, DEMO_PLUGIN).unwrap();

    plugrun()
        .args(["parse", "--format", "json", "--tag", "dev"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""tag": "dev""#))
        .stdout(predicate::str::contains("debugger"));
}

#[test]
fn test_parse_invalid_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Broken.imjoy.html");
    std::fs::write(&path, r#"<config lang="json">{"type": "web-worker"}</config><script>x</script>"#).unwrap();

    plugrun()
        .arg("parse")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse the content of the plugin"));
}

#[test]
fn test_parse_missing_file() {
    plugrun()
        .args(["parse", "does-not-exist.imjoy.html"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

// ============================================================================
// Workspace & List Tests
// ============================================================================

#[test]
fn test_list_empty_workspace() {
    let dir = project();
    in_project(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed in workspace default"));
}

#[test]
fn test_workspace_selection_persists() {
    let dir = project();

    in_project(dir.path())
        .args(["workspace", "select", "lab"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created workspace lab"));

    in_project(dir.path())
        .args(["workspace", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("* lab"))
        .stdout(predicate::str::contains("  default"));

    in_project(dir.path())
        .args(["workspace", "remove", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_repo_list_has_defaults() {
    let dir = project();
    in_project(dir.path())
        .args(["repo", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("oeway/ImJoy-Plugins"));
}

#[test]
fn test_remove_unknown_plugin() {
    let dir = project();
    in_project(dir.path())
        .args(["remove", "Ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not installed"));
}

// ============================================================================
// Config & Completions Tests
// ============================================================================

#[test]
fn test_config_shows_sections() {
    let dir = project();
    in_project(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[runtime]"))
        .stdout(predicate::str::contains("data_dir"));
}

#[test]
fn test_completions_bash() {
    plugrun().args(["completions", "bash"]).assert().success().stdout(predicate::str::contains("plugrun"));
}
