use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

const ENV_VARS: [&str; 4] = [
    "HOMECHAIN_STATE_DIR",
    "HOMECHAIN_EMITTER",
    "HOMECHAIN_LEDGER_URL",
    "HOMECHAIN_BUS_URL",
];

fn homechain(dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("homechain"));
    cmd.current_dir(dir.path())
        .arg("--state-dir")
        .arg(dir.path().join("state"));
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_commands_and_env_backed_flags() {
    let tmp = TempDir::new().expect("tmpdir");
    homechain(&tmp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run").and(predicate::str::contains("cursor")));

    homechain(&tmp)
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("HOMECHAIN_LEDGER_URL")
                .and(predicate::str::contains("--dry-run")),
        );
}

#[test]
fn cursor_set_show_clear() {
    let tmp = TempDir::new().expect("tmpdir");

    homechain(&tmp)
        .args(["cursor", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));

    homechain(&tmp)
        .args(["cursor", "set", "--height", "42", "--log-index", "3"])
        .assert()
        .success();

    let output = homechain(&tmp)
        .args(["cursor", "show"])
        .output()
        .expect("run cursor show");
    assert!(output.status.success());
    let cursor: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(cursor["lastBlockHeight"], 42);
    assert_eq!(cursor["lastLogIndex"], 3);
    assert!(tmp.path().join("state/cursor.json").exists());

    homechain(&tmp).args(["cursor", "clear"]).assert().success();
    homechain(&tmp)
        .args(["cursor", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));
}

#[test]
fn cursor_set_without_log_index_covers_whole_block() {
    let tmp = TempDir::new().expect("tmpdir");
    homechain(&tmp)
        .args(["cursor", "set", "--height", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains(u32::MAX.to_string()));
}

#[test]
fn run_rejects_missing_emitter() {
    let tmp = TempDir::new().expect("tmpdir");
    homechain(&tmp)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("emitter"));
}

#[test]
fn run_fails_fast_when_ledger_is_unreachable() {
    let tmp = TempDir::new().expect("tmpdir");
    homechain(&tmp)
        .args([
            "run",
            "--emitter",
            "0xhome",
            "--ledger-url",
            "http://127.0.0.1:9/",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ledger unreachable"));
}
