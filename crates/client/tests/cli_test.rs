use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn portkeeper(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("portkeeper").unwrap();
    cmd.arg("--registry")
        .arg(dir.path().join("registry.json"))
        .env("PORTKEEPER_RANGE", "47300-47399")
        .env_remove("RUST_LOG");
    cmd
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.arg("--json").output().unwrap();
    assert!(output.status.success(), "{:?}", output);
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn allocate_list_release() {
    let dir = TempDir::new().unwrap();

    let allocated = json_output(portkeeper(&dir).args([
        "allocate",
        "--app",
        "web",
        "--worktree",
        "main",
        "--meta",
        "owner=ci",
    ]));
    let port = allocated["port"].as_u64().unwrap();
    assert!((47300..=47399).contains(&port));

    let listed = json_output(portkeeper(&dir).args(["list", "--app", "web"]));
    let entries = listed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["port"].as_u64(), Some(port));
    assert_eq!(entries[0]["metadata"]["owner"], "ci");

    portkeeper(&dir)
        .args(["release", &port.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Released port"));

    portkeeper(&dir)
        .args(["release", &port.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("was not allocated"));
}

#[test]
fn list_filters_by_worktree() {
    let dir = TempDir::new().unwrap();
    for worktree in ["main", "feature"] {
        portkeeper(&dir)
            .args(["allocate", "--app", "web", "--worktree", worktree])
            .assert()
            .success();
    }

    let listed = json_output(portkeeper(&dir).args(["list", "--worktree", "feature"]));

    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["metadata"]["worktree"], "feature");
}

#[test]
fn group_release_is_idempotent() {
    let dir = TempDir::new().unwrap();

    let group = json_output(portkeeper(&dir).args([
        "allocate-group",
        "--count",
        "2",
        "--role",
        "frontend",
        "--role",
        "backend",
        "--app",
        "stack",
    ]));
    let group_id = group["groupId"].as_str().unwrap().to_string();
    assert_eq!(group["ports"].as_object().unwrap().len(), 2);

    let first = json_output(portkeeper(&dir).args(["release-group", &group_id]));
    assert_eq!(first["released"], 2);

    let second = json_output(portkeeper(&dir).args(["release-group", &group_id]));
    assert_eq!(second["released"], 0);
}

#[test]
fn invalid_range_is_rejected() {
    let dir = TempDir::new().unwrap();

    portkeeper(&dir)
        .args(["allocate", "--range", "5000-4000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("5000-4000"));

    assert!(!dir.path().join("registry.json").exists());
}

#[test]
fn malformed_metadata_is_a_usage_error() {
    let dir = TempDir::new().unwrap();

    portkeeper(&dir)
        .args(["allocate", "--meta", "no-equals-sign"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

#[cfg(unix)]
#[test]
fn run_exports_port_and_releases_afterwards() {
    let dir = TempDir::new().unwrap();

    portkeeper(&dir)
        .args(["run", "--app", "job", "--", "sh", "-c", "echo port=$PORT"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"port=473\d\d").unwrap());

    let listed = json_output(portkeeper(&dir).arg("list"));
    assert!(listed.as_array().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn run_propagates_exit_code() {
    let dir = TempDir::new().unwrap();

    portkeeper(&dir)
        .args(["run", "--", "sh", "-c", "exit 3"])
        .assert()
        .code(3);
}
