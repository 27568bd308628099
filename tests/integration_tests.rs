//! Integration tests for Quill
//!
//! These exercise the CLI end to end. Nothing here reaches a model or
//! publishing backend: every command under test fails or finishes before a
//! network call would be made.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a quill Command
fn quill() -> Command {
    let mut cmd = cargo_bin_cmd!("quill");
    cmd.env_remove("QUILL_MAX_REVISIONS")
        .env_remove("QUILL_ENDPOINT")
        .env_remove("QUILL_MODEL");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_quill_project(dir: &TempDir) {
    quill()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

const OUTLINE: &str = r#"
title = "The Lighthouse Keeper"
genre = "mystery"
synopsis = "A keeper finds letters from a drowned town."

[[chapters]]
sequence = 1
outline = "Mara arrives at the lighthouse and finds the first letter."
characters = ["Mara"]

[[chapters]]
sequence = 2
outline = "The second letter names someone still alive."
characters = ["Mara", "Tomas"]
min_chars = 1500
max_chars = 2000
"#;

fn write_outline(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("outline.toml");
    fs::write(&path, OUTLINE).unwrap();
    path
}

fn create_work(dir: &TempDir) {
    let outline = write_outline(dir);
    quill()
        .current_dir(dir.path())
        .args(["create-work", "--outline"])
        .arg(&outline)
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_quill_help() {
        quill()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("write"))
            .stdout(predicate::str::contains("publish"));
    }

    #[test]
    fn test_quill_version() {
        quill().arg("--version").assert().success();
    }

    #[test]
    fn test_quill_init_creates_structure() {
        let dir = create_temp_project();

        quill()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized quill project"));

        assert!(dir.path().join(".quill").exists());
        assert!(dir.path().join(".quill/works").exists());
        assert!(dir.path().join(".quill/memory").exists());
        assert!(dir.path().join(".quill/audit").exists());
        assert!(dir.path().join(".quill/logs").exists());
        assert!(dir.path().join(".quill/quill.toml").exists());
    }

    #[test]
    fn test_quill_init_idempotent() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        quill()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();

        assert!(dir.path().join(".quill/quill.toml").exists());
    }

    #[test]
    fn test_commands_require_init() {
        let dir = create_temp_project();

        quill()
            .current_dir(dir.path())
            .args(["write", "--work", "anything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));

        quill()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));
    }
}

// =============================================================================
// Works
// =============================================================================

mod works {
    use super::*;

    #[test]
    fn test_create_work_from_outline() {
        let dir = create_temp_project();
        init_quill_project(&dir);
        let outline = write_outline(&dir);

        quill()
            .current_dir(dir.path())
            .args(["create-work", "--outline"])
            .arg(&outline)
            .assert()
            .success()
            .stdout(predicate::str::contains("The Lighthouse Keeper"))
            .stdout(predicate::str::contains("2 chapters"));

        let works = dir.path().join(".quill/works");
        let created: Vec<_> = fs::read_dir(&works).unwrap().collect();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn test_create_work_twice_fails() {
        let dir = create_temp_project();
        init_quill_project(&dir);
        create_work(&dir);
        let outline = write_outline(&dir);

        quill()
            .current_dir(dir.path())
            .args(["create-work", "--outline"])
            .arg(&outline)
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_create_work_rejects_missing_outline() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["create-work", "--outline", "nope.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read outline"));
    }

    #[test]
    fn test_status_without_works() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No works yet"));
    }

    #[test]
    fn test_status_lists_chapters() {
        let dir = create_temp_project();
        init_quill_project(&dir);
        create_work(&dir);

        quill()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("The Lighthouse Keeper"))
            .stdout(predicate::str::contains("2 pending"));
    }
}

// =============================================================================
// Writing, auditing and publishing
// =============================================================================

mod production {
    use super::*;

    #[test]
    fn test_write_unknown_work_fails() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["write", "--work", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_write_rejects_inverted_range() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["write", "--work", "any", "--from", "5", "--to", "2"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("must not be greater"));
    }

    #[test]
    fn test_write_range_conflicts_with_chapter_list() {
        quill()
            .args(["write", "--work", "any", "--from", "1", "--chapters", "2,3"])
            .assert()
            .failure();
    }

    #[test]
    fn test_audit_without_reports() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["audit", "--work", "lighthouse"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No audit reports"));
    }

    #[test]
    fn test_publish_requires_book_id() {
        let dir = create_temp_project();
        init_quill_project(&dir);
        create_work(&dir);

        quill()
            .current_dir(dir.path())
            .args(["--yes", "publish", "--work", "the-lighthouse-keeper"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("book_id"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_validate_defaults() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_rejects_inverted_lengths() {
        let dir = create_temp_project();
        init_quill_project(&dir);
        fs::write(
            dir.path().join(".quill/quill.toml"),
            "[chapter]\nmin_chars = 3000\nmax_chars = 2000\n",
        )
        .unwrap();

        quill()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("min_chars"));
    }

    #[test]
    fn test_config_show_applies_cli_overrides() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["--max-revisions", "7", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_revisions = 7"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        init_quill_project(&dir);

        quill()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }
}
