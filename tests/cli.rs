//! End-to-end tests for the `flowsync` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// A scratch directory holding snapshot files.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("write fixture file");
        path
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Three-way fixture: `Y` deleted locally and renamed remotely, `X`
    /// added locally.
    fn conflicted() -> Self {
        let f = Self::new();
        f.write(
            "base.json",
            r#"[{"id":"tabA","type":"tab"},{"id":"Y","type":"function","z":"tabA"}]"#,
        );
        f.write(
            "local.json",
            r#"[{"id":"tabA","type":"tab"},{"id":"X","type":"inject","z":"tabA"}]"#,
        );
        f.write(
            "remote.json",
            r#"[{"id":"tabA","type":"tab"},{"id":"Y","type":"function","z":"tabA","name":"foo"}]"#,
        );
        f
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_flowsync"))
            .args(args)
            .current_dir(self.root())
            .env_remove("FLOWSYNC_CONFIG")
            .env_remove("FLOWSYNC_LOG")
            .output()
            .expect("failed to execute flowsync")
    }

    fn ok(&self, args: &[&str]) -> String {
        let out = self.run(args);
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(
            out.status.success(),
            "flowsync {} failed:\nstdout: {stdout}\nstderr: {stderr}",
            args.join(" "),
        );
        stdout.to_string()
    }

    fn fails(&self, args: &[&str]) -> String {
        let out = self.run(args);
        assert!(
            !out.status.success(),
            "flowsync {} unexpectedly succeeded",
            args.join(" ")
        );
        String::from_utf8_lossy(&out.stderr).to_string()
    }
}

#[test]
fn diff_json_lists_id_sets() {
    let f = Fixture::conflicted();
    let out = f.ok(&["diff", "base.json", "local.json", "--json"]);
    let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
    assert_eq!(parsed["added"], serde_json::json!(["X"]));
    assert_eq!(parsed["deleted"], serde_json::json!(["Y"]));
    assert_eq!(parsed["changed"], serde_json::json!([]));
}

#[test]
fn reconcile_reports_conflict() {
    let f = Fixture::conflicted();
    let out = f.ok(&["reconcile", "base.json", "local.json", "remote.json", "--json"]);
    let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
    assert_eq!(parsed["conflicts"]["Y"], "delete-change");
    assert_eq!(parsed["resolutions"]["X"], "local");
    assert_eq!(parsed["all_resolved"], false);
}

#[test]
fn merge_refuses_unresolved_conflicts() {
    let f = Fixture::conflicted();
    let stderr = f.fails(&["merge", "base.json", "local.json", "remote.json"]);
    assert!(stderr.contains("Y"), "stderr: {stderr}");
    assert!(stderr.contains("unresolved"), "stderr: {stderr}");
}

#[test]
fn merge_with_resolution_writes_output() {
    let f = Fixture::conflicted();
    f.ok(&[
        "merge",
        "base.json",
        "local.json",
        "remote.json",
        "--resolve",
        "Y=remote",
        "--output",
        "merged.json",
    ]);
    let text = std::fs::read_to_string(f.path("merged.json")).expect("merged output");
    let merged: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
    let ids: Vec<&str> = merged
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|r| r["id"].as_str())
        .collect();
    assert_eq!(ids, ["tabA", "X", "Y"]);
}

#[test]
fn view_prints_conflict_rows() {
    let f = Fixture::conflicted();
    let out = f.ok(&["view", "base.json", "local.json", "remote.json"]);
    assert!(out.contains("== tabA =="), "stdout: {out}");
    assert!(out.contains("CONFLICT"), "stdout: {out}");
    assert!(out.contains("unresolved remain"), "stdout: {out}");
}

#[test]
fn invalid_config_fails_loudly() {
    let f = Fixture::conflicted();
    f.write("flowsync.toml", "[bogus]\n");
    let stderr = f.fails(&["diff", "base.json", "local.json"]);
    assert!(stderr.contains("flowsync.toml"), "stderr: {stderr}");
}
