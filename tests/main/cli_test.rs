//! CLI contract tests.

use std::time::Duration;

use assert_cmd::Command;

const SECRET: &str = "cli-test-secret-0123456789abcdef0123";

fn tryout_cmd(home: &std::path::Path) -> Command {
    let mut cmd = match Command::cargo_bin("tryout") {
        Ok(cmd) => cmd,
        Err(err) => panic!("binary should build: {err}"),
    };
    cmd.env("HOME", home)
        .env("TRYOUT_TOKEN_SECRET", SECRET)
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let home = tempfile::tempdir().expect("should create temp dir");
    let output = tryout_cmd(home.path())
        .arg("--help")
        .output()
        .expect("should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["migrate", "start", "verify", "status", "run"] {
        assert!(stdout.contains(sub), "help should mention {sub}");
    }
}

#[test]
fn migrate_creates_database() {
    let home = tempfile::tempdir().expect("should create temp dir");
    tryout_cmd(home.path()).arg("migrate").assert().success();
    assert!(home.path().join(".tryout").join("tryout.db").exists());
}

#[test]
fn verify_accepts_token_for_matching_route() {
    let home = tempfile::tempdir().expect("should create temp dir");
    let signer = tryout::token::TokenSigner::new(
        SECRET.as_bytes(),
        Duration::from_secs(300),
        Duration::from_secs(600),
    )
    .expect("secret is long enough");
    let token = signer.generate_access_token(7, 42, 1).expect("mint");

    let output = tryout_cmd(home.path())
        .args(["verify", &token, "--tryout", "7"])
        .output()
        .expect("should run");
    assert!(output.status.success());
    let claims: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("claims are JSON");
    assert_eq!(claims["user_id"], 42);

    tryout_cmd(home.path())
        .args(["verify", &token, "--tryout", "8"])
        .assert()
        .failure();
}

#[test]
fn verify_rejects_garbage() {
    let home = tempfile::tempdir().expect("should create temp dir");
    tryout_cmd(home.path())
        .args(["verify", "not-a-token", "--tryout", "7"])
        .assert()
        .failure();
}

#[test]
fn status_of_unknown_session_fails() {
    let home = tempfile::tempdir().expect("should create temp dir");
    tryout_cmd(home.path())
        .args(["status", "does-not-exist"])
        .assert()
        .failure();
}
