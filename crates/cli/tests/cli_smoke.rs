//! CLI smoke tests: flag surface, exit codes, storage isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn sw(storage: &TempDir) -> Command {
  let mut cmd = Command::cargo_bin("sw").unwrap();
  cmd.env("SW_STORAGE", storage.path());
  cmd.env("SW_NO_NETWORK", "1");
  cmd
}

#[test]
fn help_lists_subcommands() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("build"))
    .stdout(predicate::str::contains("install"))
    .stdout(predicate::str::contains("remove"));
}

#[test]
fn list_on_fresh_storage_is_empty() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("no packages installed"));
}

#[test]
fn unresolvable_build_exits_three() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["build", "org.demo.ghost@*"])
    .assert()
    .code(3)
    .stderr(predicate::str::contains("unresolvable"));
}

#[test]
fn remove_of_missing_pin_reports_not_installed() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["remove", "org.demo.ghost@==1.0"])
    .assert()
    .success()
    .stdout(predicate::str::contains("was not installed"));
}

#[test]
fn remove_of_missing_range_fails() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["remove", "org.demo.ghost@>=1.0"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("not installed"));
}

#[test]
fn unknown_uri_verb_is_rejected() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["uri", "sw:explode"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("unknown uri verb"));
}

#[test]
fn uri_sdir_requires_installed_package() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["uri", "sw:sdir", "org.demo.ghost"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("not installed"));
}

#[test]
fn invalid_reference_is_a_fatal_error() {
  let storage = TempDir::new().unwrap();
  sw(&storage)
    .args(["install", "org..broken@*"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("invalid package reference"));
}
