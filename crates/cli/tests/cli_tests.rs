//! CLI integration tests

use std::process::{Command, Output};

fn oce(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new("cargo");
    command.args(["run", "-q", "-p", "oce-cli", "--"]).args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = oce(&["--help"], &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("OpenCost"), "Should show app description");
    assert!(stdout.contains("run"), "Should show run command");
    assert!(stdout.contains("preview"), "Should show preview command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = oce(&["--version"], &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("oce"), "Should show binary name");
}

/// Test run subcommand help
#[test]
fn test_run_help() {
    let output = oce(&["run", "--help"], &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Run help should succeed");
    for option in [
        "--window",
        "--aggregate",
        "--format",
        "--storage-account",
        "--storage-container",
        "--skip-upload",
    ] {
        assert!(stdout.contains(option), "Should show {} option", option);
    }
}

/// Test preview subcommand help
#[test]
fn test_preview_help() {
    let output = oce(&["preview", "--help"], &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Preview help should succeed");
    assert!(stdout.contains("--limit"), "Should show limit option");
    assert!(stdout.contains("--include-idle"), "Should show include-idle option");
}

/// A skip-upload run writes the artifact locally and exits zero
#[test]
fn test_run_skip_upload_writes_artifact() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/allocation")
        .match_query(mockito::Matcher::Any)
        .with_body(
            r#"{"code":200,"data":[{"ns1/podA":{"name":"podA","properties":{"namespace":"ns1"},"cpuCost":1.234567,"totalCost":1.5}}]}"#,
        )
        .create();
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().to_string_lossy().to_string();

    let output = oce(
        &[
            "run",
            "--skip-upload",
            "--output-dir",
            &out_dir,
            "--filename",
            "preview.csv",
            "--max-attempts",
            "1",
        ],
        &[("OCE_API_URL", &server.url())],
    );

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let written = std::fs::read_to_string(dir.path().join("preview.csv")).unwrap();
    assert_eq!(written.lines().count(), 2);
    assert!(written.contains(",podA,"));
}

/// A failed run exits non-zero and names the stage and cause on stderr
#[test]
fn test_run_failure_reports_stage_and_cause() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/allocation")
        .match_query(mockito::Matcher::Any)
        .with_body(r#"{"code":500,"message":"internal error"}"#)
        .create();
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().to_string_lossy().to_string();

    let output = oce(
        &["run", "--skip-upload", "--output-dir", &out_dir],
        &[("OCE_API_URL", &server.url())],
    );
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Failed run should exit non-zero");
    assert!(stderr.contains("fetching"), "Should name the stage: {}", stderr);
    assert!(stderr.contains("internal error"), "Should carry the cause: {}", stderr);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
