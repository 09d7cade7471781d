//! CLI integration tests

use std::process::Command;

fn alertctl(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_alertctl"))
        .args(args)
        .env_remove("ALERTCTL_API_URL")
        .output()
        .expect("Failed to execute alertctl")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = alertctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("root-cause analysis"), "Should show about text");
    assert!(stdout.contains("alerts"), "Should show alerts command");
    assert!(stdout.contains("analysis"), "Should show analysis command");
    assert!(stdout.contains("rules"), "Should show rules command");
    assert!(stdout.contains("push"), "Should show push command");
    assert!(stdout.contains("health"), "Should show health command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = alertctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("alertctl"), "Should show binary name");
}

#[test]
fn test_alerts_list_help() {
    let output = alertctl(&["alerts", "list", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--status"), "Should show status filter");
}

#[test]
fn test_push_requires_numeric_value() {
    let output = alertctl(&["push", "cpu_usage_percent", "not-a-number"]);
    assert!(!output.status.success());
}

#[test]
fn test_unreachable_daemon_fails_cleanly() {
    let output = alertctl(&["--api-url", "http://127.0.0.1:9", "health"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Failed to send request"));
}
