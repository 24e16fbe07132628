//! CLI tests for demo-setup.
//!
//! Only the modes that need no workspace are driven end to end here; the step
//! engine itself is covered by `orchestrator_tests.rs`.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn demo_setup(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("demo-setup");
    cmd.current_dir(dir.path())
        .env_remove("DATABRICKS_HOST")
        .env_remove("DATABRICKS_TOKEN")
        .env_remove("SETUP_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

fn seed_failed_session(dir: &TempDir) {
    let progress = r#"{
  "session_id": "20260101_120000",
  "created_at": "2026-01-01T12:00:00Z",
  "last_updated": "2026-01-01T12:03:00Z",
  "current_step": "create_catalog_schema",
  "steps": {
    "validate_prerequisites": { "status": "COMPLETED", "duration_seconds": 1.2, "attempts": 1 },
    "detect_environment": { "status": "COMPLETED", "duration_seconds": 4.0, "attempts": 1 },
    "collect_user_input": { "status": "COMPLETED", "attempts": 1 },
    "validate_config": { "status": "COMPLETED", "attempts": 1 },
    "create_catalog_schema": {
      "status": "FAILED",
      "error": "Permission denied: create_schema on main\nResource:   schema main.demo",
      "attempts": 1
    }
  }
}"#;
    fs::write(dir.path().join(".setup_progress.json"), progress).unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_modes() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--resume"))
            .stdout(predicate::str::contains("--validate-only"))
            .stdout(predicate::str::contains("--cleanup"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_modes_conflict() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .args(["--resume", "--reset"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be used with"));
    }
}

mod status {
    use super::*;

    #[test]
    fn test_status_without_session() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .arg("--status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No setup session found"))
            .stdout(predicate::str::contains("run_integration_tests"))
            .stdout(predicate::str::contains("0/15 completed"));
        assert!(!dir.path().join(".setup_progress.json").exists());
    }

    #[test]
    fn test_status_reports_failed_step() {
        let dir = TempDir::new().unwrap();
        seed_failed_session(&dir);
        demo_setup(&dir)
            .arg("--status")
            .assert()
            .success()
            .stdout(predicate::str::contains("20260101_120000"))
            .stdout(predicate::str::is_match(r"create_catalog_schema\s+FAILED").unwrap())
            .stdout(predicate::str::contains("Permission denied: create_schema on main"))
            .stdout(predicate::str::contains("4/15 completed"))
            .stdout(predicate::str::contains("Next step: create_catalog_schema"));
    }

    #[test]
    fn test_status_json() {
        let dir = TempDir::new().unwrap();
        seed_failed_session(&dir);
        let output = demo_setup(&dir)
            .args(["--status", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["session_id"], "20260101_120000");
        assert_eq!(report["total"], 15);
        assert_eq!(report["completed"], 4);
        assert_eq!(report["steps"][4]["id"], "create_catalog_schema");
        assert_eq!(report["steps"][4]["status"], "FAILED");
        // Steps missing from an older file read as pending.
        assert_eq!(report["steps"][14]["status"], "PENDING");
    }

    #[test]
    fn test_json_requires_status() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir).arg("--json").assert().failure();
    }
}

mod session_control {
    use super::*;

    #[test]
    fn test_reset_then_status() {
        let dir = TempDir::new().unwrap();
        seed_failed_session(&dir);
        demo_setup(&dir)
            .arg("--reset")
            .assert()
            .success()
            .stdout(predicate::str::contains("Setup session 20260101_120000 reset"));
        assert!(!dir.path().join(".setup_progress.json").exists());

        demo_setup(&dir)
            .arg("--status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No setup session found"));
    }

    #[test]
    fn test_reset_without_session() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .arg("--reset")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to reset"));
    }

    #[test]
    fn test_cleanup_without_session() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .args(["--cleanup", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to clean up"));
    }

    #[test]
    fn test_normal_run_refuses_existing_session() {
        let dir = TempDir::new().unwrap();
        seed_failed_session(&dir);
        let before = fs::read_to_string(dir.path().join(".setup_progress.json")).unwrap();
        demo_setup(&dir)
            .arg("--yes")
            .assert()
            .failure()
            .stdout(predicate::str::contains("demo-setup --resume"));
        let after = fs::read_to_string(dir.path().join(".setup_progress.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_resume_without_session_fails() {
        let dir = TempDir::new().unwrap();
        demo_setup(&dir)
            .args(["--resume", "--yes"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("No setup session to resume"));
    }
}
