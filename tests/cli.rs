use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Binary under test with HOME and cwd pointed at a scratch directory
fn toolhost(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("toolhost").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("TOOLHOST_PLUGIN_DIR")
        .env_remove("TOOLHOST_TIMEOUT_MS")
        .env_remove("TOOLHOST_FS_ROOT")
        .env_remove("TOOLHOST_WORKDIR")
        .current_dir(home.path());
    cmd
}

#[test]
fn test_list_shows_builtin_tools() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("time"))
        .stdout(predicate::str::contains("  now"))
        .stdout(predicate::str::contains("  read_file"));
}

#[test]
fn test_list_json() {
    let home = TempDir::new().unwrap();
    let output = toolhost(&home).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());

    let tools: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["now", "add_duration", "read_file", "list_dir"]);
}

#[test]
fn test_list_without_builtins_is_empty() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["--no-builtins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_invoke_now() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["invoke", "now", "--timeout-ms", "2000", "--correlation-id", "cli-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "success""#))
        .stdout(predicate::str::contains("timestamp"));

    let audit = home.path().join(".toolhost/logs/invocations.log");
    let log = std::fs::read_to_string(audit).unwrap();
    assert!(log.contains(r#""correlation_id":"cli-1""#));
}

#[test]
fn test_invoke_unknown_tool_fails() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["invoke", "now2"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("tool_not_found"));
}

#[test]
fn test_invoke_invalid_arguments_fails() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["invoke", "add_duration", "--args", r#"{"seconds": 5}"#])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_arguments"));
}

#[test]
fn test_invoke_rejects_traversal() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["invoke", "read_file", "--args", r#"{"path": "../../etc/passwd"}"#])
        .assert()
        .failure()
        .stdout(predicate::str::contains("policy_denied"));
}

#[test]
fn test_invoke_reads_file_under_root() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("notes.txt"), "hello toolhost").unwrap();
    toolhost(&home)
        .args(["invoke", "read_file", "--args", r#"{"path": "notes.txt"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello toolhost"));
}

#[test]
fn test_invoke_malformed_json_arguments() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["invoke", "now", "--args", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_missing_plugin_library_fails() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["--plugin", "/nonexistent/libtools.so", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load plugin"));
}

#[test]
fn test_inspect_missing_library() {
    let home = TempDir::new().unwrap();
    toolhost(&home)
        .args(["inspect", "/nonexistent/libtools.so"])
        .assert()
        .failure();
}
