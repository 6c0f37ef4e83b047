use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use usine_core::file::{identities_path, profiles_path, read_snapshot, write_snapshot};
use usine_core::paths;
use usine_core::{Email, IdentityRecord, ProfileRecord, Role, UserId};

fn usine_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("usine"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    for (key, _) in std::env::vars() {
        if key.starts_with("USINE_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

fn data_dir(home: &TempDir) -> PathBuf {
    paths::default_data_dir(home.path())
}

fn identity(id: &str, email: &str) -> IdentityRecord {
    IdentityRecord {
        id: UserId::from(id),
        email: Email::from(email),
        credential_hash: None,
        disabled: false,
        created_at: chrono_now(),
    }
}

fn profile(id: &str, email: &str) -> ProfileRecord {
    ProfileRecord::for_identity(&identity(id, email), Role::Customer, chrono_now())
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    "2025-03-01T09:00:00Z".parse().expect("timestamp")
}

fn seed(home: &TempDir, identities: &[IdentityRecord], profiles: &[ProfileRecord]) {
    let dir = data_dir(home);
    write_snapshot(&identities_path(&dir), identities).expect("write identities");
    write_snapshot(&profiles_path(&dir), profiles).expect("write profiles");
}

fn stored_profiles(home: &TempDir) -> Vec<ProfileRecord> {
    read_snapshot(&profiles_path(&data_dir(home))).expect("read profiles")
}

#[test]
fn init_writes_config_and_empty_stores() {
    let home = TempDir::new().expect("home");

    usine_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("config.yaml"));

    assert!(paths::config_path(home.path()).exists());
    assert!(identities_path(&data_dir(&home)).exists());
    assert!(profiles_path(&data_dir(&home)).exists());

    usine_cmd(home.path()).arg("status").assert().success();
}

#[test]
fn init_honours_custom_data_dir() {
    let home = TempDir::new().expect("home");
    let custom = home.path().join("stores");

    usine_cmd(home.path())
        .args(["init", "--data-dir"])
        .arg(&custom)
        .assert()
        .success();

    assert!(identities_path(&custom).exists());
    let config = fs::read_to_string(paths::config_path(home.path())).expect("config");
    assert!(config.contains("stores"));
}

#[test]
fn status_and_diff_exit_nonzero_on_orphans() {
    let home = TempDir::new().expect("home");
    seed(
        &home,
        &[identity("u1", "a@usine.fr")],
        &[profile("temp-uid", "shop@usine.fr")],
    );

    usine_cmd(home.path())
        .arg("status")
        .assert()
        .failure()
        .stdout(contains("need reconciliation"));

    usine_cmd(home.path())
        .arg("diff")
        .assert()
        .failure()
        .stdout(contains("identity u1 <a@usine.fr> has no profile"))
        .stdout(contains("profile temp-uid <shop@usine.fr> has no identity"));

    let output = usine_cmd(home.path())
        .args(["status", "--json"])
        .output()
        .expect("status --json");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["consistent"], false);
    assert_eq!(json["summary"]["orphan_identities"], 1);
    assert_eq!(json["summary"]["orphan_profiles"], 1);
}

#[test]
fn dry_run_prints_intents_and_changes_nothing() {
    let home = TempDir::new().expect("home");
    seed(&home, &[], &[profile("temp-uid", "shop@usine.fr")]);
    let before = fs::read_to_string(profiles_path(&data_dir(&home))).expect("profiles");

    usine_cmd(home.path())
        .args(["reconcile", "cleanup", "--dry-run"])
        .assert()
        .code(1)
        .stdout(contains("[dry-run]"))
        .stdout(contains("delete profile temp-uid <shop@usine.fr>"));

    let after = fs::read_to_string(profiles_path(&data_dir(&home))).expect("profiles");
    assert_eq!(before, after);
}

#[test]
fn no_input_declines_destructive_plan() {
    let home = TempDir::new().expect("home");
    seed(&home, &[], &[profile("temp-uid", "shop@usine.fr")]);

    usine_cmd(home.path())
        .args(["reconcile", "cleanup", "--no-input"])
        .assert()
        .code(1)
        .stdout(contains("confirmation declined"));

    assert_eq!(stored_profiles(&home).len(), 1);
}

#[test]
fn forced_sync_converges_and_status_turns_clean() {
    let home = TempDir::new().expect("home");
    seed(
        &home,
        &[
            identity("u1", "admin@usine.fr"),
            identity("real-uid", "shop@usine.fr"),
        ],
        &[profile("temp-uid", "shop@usine.fr"), profile("gone", "gone@usine.fr")],
    );

    usine_cmd(home.path())
        .args(["reconcile", "sync", "--force"])
        .assert()
        .success()
        .stdout(contains("DONE"));

    let mut ids: Vec<String> = stored_profiles(&home).into_iter().map(|p| p.id.0).collect();
    ids.sort();
    assert_eq!(ids, vec!["real-uid".to_string(), "u1".to_string()]);
    assert!(!paths::lock_path(home.path()).exists(), "lock released");

    usine_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("consistent"));
}

#[test]
fn create_defaults_reports_json() {
    let home = TempDir::new().expect("home");
    seed(
        &home,
        &[
            identity("u1", "admin@usine.fr"),
            identity("u2", "supplier@usine.fr"),
            identity("u3", "influencer@usine.fr"),
            identity("u4", "client@usine.fr"),
        ],
        &[],
    );

    let output = usine_cmd(home.path())
        .args(["reconcile", "create-defaults", "--json"])
        .output()
        .expect("reconcile");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["outcome"], "done");
    assert_eq!(report["initial"]["orphan_identities"], 4);
    assert_eq!(report["residual"]["orphan_identities"], 0);
    assert_eq!(stored_profiles(&home).len(), 4);
}

#[test]
fn duplicate_email_is_partial_even_with_force() {
    let home = TempDir::new().expect("home");
    seed(
        &home,
        &[identity("u1", "a@b.com"), identity("u2", "a@b.com")],
        &[],
    );

    usine_cmd(home.path())
        .args(["reconcile", "sync", "--force"])
        .assert()
        .code(1)
        .stdout(contains("PARTIAL"))
        .stdout(contains("duplicate email a@b.com in identity store shared by u1, u2"));

    assert!(stored_profiles(&home).is_empty());
}

#[test]
fn timeout_longer_than_the_lock_is_refused() {
    let home = TempDir::new().expect("home");
    seed(&home, &[], &[profile("temp-uid", "shop@usine.fr")]);

    usine_cmd(home.path())
        .args(["reconcile", "cleanup", "--force", "--timeout", "86400"])
        .assert()
        .code(1)
        .stderr(contains("--timeout must be between 1 and lock_ttl_secs"));

    assert_eq!(stored_profiles(&home).len(), 1);
    assert!(!paths::lock_path(home.path()).exists(), "lock released");
}

#[test]
fn held_lock_refuses_a_second_pass() {
    let home = TempDir::new().expect("home");
    seed(&home, &[], &[profile("temp-uid", "shop@usine.fr")]);
    let lock = paths::lock_path(home.path());
    fs::create_dir_all(lock.parent().expect("parent")).expect("mkdir");
    fs::write(
        &lock,
        r#"{"holder":"usine reconcile sync","pid":1,"acquired_at":"2025-01-01T00:00:00Z","expires_at":"2999-01-01T00:00:00Z"}"#,
    )
    .expect("write lock");

    usine_cmd(home.path())
        .args(["reconcile", "cleanup", "--force"])
        .assert()
        .code(1)
        .stderr(contains("cannot start reconciliation"));

    assert_eq!(stored_profiles(&home).len(), 1);
    assert!(lock.exists(), "foreign lock left in place");
}

#[test]
fn provision_is_idempotent() {
    let home = TempDir::new().expect("home");
    let seed_path = home.path().join("seed.yaml");
    fs::write(
        &seed_path,
        "users:\n  - email: admin@usine.fr\n    password: changeme1\n  - email: boutique@usine.fr\n    password: changeme2\n    role: supplier\n",
    )
    .expect("seed");

    usine_cmd(home.path())
        .arg("provision")
        .arg(&seed_path)
        .assert()
        .success()
        .stdout(contains("created"));

    usine_cmd(home.path())
        .arg("provision")
        .arg(&seed_path)
        .assert()
        .success()
        .stdout(contains("existing"));

    assert_eq!(stored_profiles(&home).len(), 2);
    usine_cmd(home.path()).arg("status").assert().success();
}
