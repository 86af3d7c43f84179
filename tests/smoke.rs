//! Smoke tests -- verify the binary runs and the offline subcommands work.

use assert_cmd::Command;
use predicates::str::contains;

fn bandwatch(dir: &tempfile::TempDir) -> Command {
    let config = dir.path().join("bandwatch.toml");
    let db = dir.path().join("bandwatch.db");
    std::fs::write(
        &config,
        format!("[storage]\ndatabase_path = {:?}\n", db.to_string_lossy()),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("bandwatch").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("bandwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Scheduled network speed tests"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("bandwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("bandwatch"));
}

#[test]
fn test_speed_test_subcommand_exists() {
    Command::cargo_bin("bandwatch")
        .unwrap()
        .args(["speed-test", "--help"])
        .assert()
        .success()
        .stdout(contains("--provider"));
}

#[test]
fn test_schedule_describe() {
    let dir = tempfile::tempdir().unwrap();
    bandwatch(&dir)
        .args(["schedule", "describe", "0 * * * *"])
        .assert()
        .success();
}

#[test]
fn test_schedule_describe_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    bandwatch(&dir)
        .args(["schedule", "describe", "every tuesday"])
        .assert()
        .failure();
}

#[test]
fn test_schedule_add_then_list() {
    let dir = tempfile::tempdir().unwrap();
    bandwatch(&dir)
        .args(["schedule", "add", "--name", "nightly", "--cron", "0 3 * * *"])
        .assert()
        .success()
        .stdout(contains("Schedule 'nightly' added"));

    bandwatch(&dir)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(contains("nightly"))
        .stdout(contains("0 3 * * *"));
}

#[test]
fn test_schedule_add_iperf3_needs_host() {
    let dir = tempfile::tempdir().unwrap();
    bandwatch(&dir)
        .args([
            "schedule", "add", "--name", "lan", "--cron", "*/15 * * * *", "--provider", "iperf3",
        ])
        .assert()
        .failure()
        .stderr(contains("host_endpoint"));
}

#[test]
fn test_results_empty() {
    let dir = tempfile::tempdir().unwrap();
    bandwatch(&dir)
        .arg("results")
        .assert()
        .success()
        .stdout(contains("No results recorded."));
}
