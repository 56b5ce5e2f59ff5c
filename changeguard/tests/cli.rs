//! CLI tests for `changeguard`.
//!
//! Spawns the binary and verifies exit codes for the apply outcomes, invalid input and
//! environment checks.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use changeguard::exit_codes;
use changeguard::io::config::{default_config_path, write_config};
use changeguard::io::git::Git;
use changeguard::io::lock::LOCK_FILE_NAME;
use changeguard::io::tool::SystemToolRunner;
use changeguard::test_support::TestRepo;
use serde_json::json;

const DIFF: &str = "\
diff --git a/app.py b/app.py
--- a/app.py
+++ b/app.py
@@ -1 +1 @@
-VALUE = 1
+VALUE = 2
";

fn changeguard(workdir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_changeguard"))
        .arg("--workdir")
        .arg(workdir)
        .args(args)
        .output()
        .expect("run changeguard")
}

/// Repo with `app.py` and a committed changeguard config suitable for tests.
fn initialized_repo() -> TestRepo {
    let repo = TestRepo::new().expect("repo");
    repo.write("app.py", "VALUE = 1\n").expect("write");
    let output = changeguard(repo.path(), &["init"]);
    assert!(output.status.success(), "{output:?}");
    write_config(&default_config_path(repo.path()), &repo.config()).expect("config");
    repo.commit_all("chore: add app and changeguard config")
        .expect("commit");
    repo
}

fn write_proposal(dir: &Path, test_command: &str) -> PathBuf {
    let path = dir.join("proposal.json");
    let proposal = json!({
        "proposal_id": "CG-201",
        "title": "Bump value",
        "target_component": "app.py",
        "impact_justification": "exercise the cli",
        "estimated_difficulty": "Low",
        "diff_content": DIFF,
        "test_plan": test_command,
    });
    fs::write(&path, proposal.to_string()).expect("write proposal");
    path
}

#[test]
fn apply_success_exits_ok_and_commits() {
    let repo = initialized_repo();
    let temp = tempfile::tempdir().expect("tempdir");
    let proposal = write_proposal(temp.path(), "sh -c 'grep -q 2 app.py'");

    let output = changeguard(repo.path(), &["apply", proposal.to_str().expect("utf-8")]);

    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    assert_eq!(repo.read("app.py").expect("read"), "VALUE = 2\n");
    assert!(repo.head_subject().expect("subject").starts_with("CG-201"));
    assert!(!repo.join(".changeguard").join(LOCK_FILE_NAME).exists());
}

#[test]
fn apply_without_init_keeps_changeguard_state_out_of_history() {
    let repo = TestRepo::new().expect("repo");
    repo.write("app.py", "VALUE = 1\n").expect("write");
    repo.commit_all("feat: add app").expect("commit");
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("config.toml");
    write_config(&config, &repo.config()).expect("config");
    let proposal = write_proposal(temp.path(), "sh -c 'grep -q 2 app.py'");

    let output = changeguard(
        repo.path(),
        &[
            "--config",
            config.to_str().expect("utf-8"),
            "apply",
            proposal.to_str().expect("utf-8"),
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    let tracked = repo.tracked_files().expect("ls-files");
    assert!(
        tracked.iter().all(|path| !path.starts_with(".changeguard")),
        "{tracked:?}"
    );
    let status = Git::new(&SystemToolRunner, repo.path())
        .status_porcelain()
        .expect("status");
    assert!(status.is_empty(), "{status:?}");
}

#[test]
fn apply_rollback_exits_rolled_back_with_json_outcome() {
    let repo = initialized_repo();
    let temp = tempfile::tempdir().expect("tempdir");
    let proposal = write_proposal(temp.path(), "sh -c 'exit 1'");

    let output = changeguard(
        repo.path(),
        &["apply", proposal.to_str().expect("utf-8"), "--json"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::ROLLED_BACK));
    let outcome: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(outcome["status"], "rolled_back");
    assert_eq!(outcome["proposal_id"], "CG-201");
    assert_eq!(repo.read("app.py").expect("read"), "VALUE = 1\n");
}

#[test]
fn invalid_proposal_exits_invalid() {
    let repo = initialized_repo();
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("proposal.json");
    fs::write(&path, r#"{"title": "missing everything"}"#).expect("write");

    let output = changeguard(repo.path(), &["apply", path.to_str().expect("utf-8")]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("proposal schema validation failed"), "{stderr}");
}

#[test]
fn held_lock_refuses_a_second_apply() {
    let repo = initialized_repo();
    fs::write(repo.join(".changeguard").join(LOCK_FILE_NAME), "4242\n").expect("lock");
    let temp = tempfile::tempdir().expect("tempdir");
    let proposal = write_proposal(temp.path(), "sh -c 'exit 0'");

    let output = changeguard(repo.path(), &["apply", proposal.to_str().expect("utf-8")]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert_eq!(repo.read("app.py").expect("read"), "VALUE = 1\n");
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let repo = initialized_repo();

    let refused = changeguard(repo.path(), &["init"]);
    assert_eq!(refused.status.code(), Some(exit_codes::INVALID));

    let forced = changeguard(repo.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn check_env_reports_problems_outside_a_repository() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = TestRepo::new().expect("repo");
    write_config(&default_config_path(temp.path()), &repo.config()).expect("config");

    let output = changeguard(temp.path(), &["check-env", "--json"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let problems = report["problems"].as_array().expect("problems");
    assert!(
        problems
            .iter()
            .any(|p| p.as_str().is_some_and(|p| p.contains("is not a git repository"))),
        "{report}"
    );
}

#[test]
fn snapshot_create_then_restore_round_trips_the_tree() {
    let repo = initialized_repo();
    let created = changeguard(repo.path(), &["snapshot", "create"]);
    assert!(created.status.success(), "{created:?}");
    let id = String::from_utf8_lossy(&created.stdout).trim().to_string();

    repo.write("app.py", "VALUE = 99\n").expect("write");
    let restored = changeguard(repo.path(), &["snapshot", "restore", &id]);

    assert_eq!(restored.status.code(), Some(exit_codes::OK), "{restored:?}");
    assert_eq!(repo.read("app.py").expect("read"), "VALUE = 1\n");
    let listed = changeguard(repo.path(), &["snapshot", "list"]);
    assert!(!String::from_utf8_lossy(&listed.stdout).contains(&id));
}
