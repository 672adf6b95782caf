//! End-to-end CLI tests: run the binary and check exit codes, output and
//! filesystem effects.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn linkfarm_cmd() -> Command {
    Command::cargo_bin("linkfarm").unwrap()
}

/// `<tmp>/stow/<file>` per entry plus an empty `<tmp>/target`.
fn setup(files: &[&str]) -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("target")).unwrap();
    for file in files {
        let path = temp.path().join("stow").join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, *file).unwrap();
    }
    temp
}

#[test]
fn test_cli_stow_creates_links() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .success();

    assert_eq!(
        fs::read_link(temp.path().join("target/bin")).unwrap(),
        PathBuf::from("../stow/vim/bin")
    );
}

#[test]
fn test_cli_conflict_reports_and_exits_nonzero() {
    let temp = setup(&["vim/bin/vim"]);
    fs::create_dir(temp.path().join("target/bin")).unwrap();
    fs::write(temp.path().join("target/bin/vim"), "preexisting").unwrap();

    linkfarm_cmd()
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("would cause conflicts"))
        .stderr(predicate::str::contains("All operations aborted."));

    assert_eq!(
        fs::read_to_string(temp.path().join("target/bin/vim")).unwrap(),
        "preexisting"
    );
}

#[test]
fn test_cli_simulate_changes_nothing() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .arg("-n")
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulation mode"))
        .stdout(predicate::str::contains("LINK: bin"));

    assert!(temp.path().join("target/bin").symlink_metadata().is_err());
}

#[test]
fn test_cli_delete_unstows() {
    let temp = setup(&["vim/bin/vim"]);
    let stow_dir = temp.path().join("stow");
    let target = temp.path().join("target");

    linkfarm_cmd()
        .args(["-d"])
        .arg(&stow_dir)
        .args(["-t"])
        .arg(&target)
        .arg("vim")
        .assert()
        .success();

    linkfarm_cmd()
        .arg("-D")
        .args(["-d"])
        .arg(&stow_dir)
        .args(["-t"])
        .arg(&target)
        .arg("vim")
        .assert()
        .success();

    assert!(target.join("bin").symlink_metadata().is_err());
}

#[test]
fn test_cli_restow_flag() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .arg("-R")
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .success();

    assert!(temp.path().join("target/bin").is_symlink());
}

#[test]
fn test_cli_bad_pattern_is_an_error() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .args(["--ignore", "(unclosed"])
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("bad pattern"));
}

#[test]
fn test_cli_missing_package_is_an_error() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .args(["-d"])
        .arg(temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("nonexistent")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("does not contain package"));
}

#[test]
fn test_cli_requires_a_package() {
    linkfarm_cmd().assert().failure();
}

#[test]
fn test_cli_stow_dir_from_environment() {
    let temp = setup(&["vim/bin/vim"]);

    linkfarm_cmd()
        .env("STOW_DIR", temp.path().join("stow"))
        .args(["-t"])
        .arg(temp.path().join("target"))
        .arg("vim")
        .assert()
        .success();

    assert!(temp.path().join("target/bin").is_symlink());
}
