// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for gest test binaries.
//!
//! These run the `gest-fixtures` binary, which registers the modules in
//! `integration_tests::fixtures`, both in-process and with multiprocessing.

use camino_tempfile::Utf8TempDir;
use gest::GestExitCode;
use integration_tests::{
    fixtures::{CRASH_ENV, FIXTURE_FILES},
    gest_cli::{GestCli, GestOutput},
};
use pretty_assertions::assert_eq;
use regex::Regex;
use std::sync::LazyLock;

mod runner;

fn cli() -> GestCli {
    GestCli::new(env!("CARGO_BIN_EXE_gest-fixtures"))
}

/// Replaces timings, which vary from run to run.
fn normalize(output: &str) -> String {
    static DURATION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[ *[0-9.]+s\]").expect("valid regex"));
    DURATION.replace_all(output, "[DURATION]").into_owned()
}

fn assert_exit_code(output: &GestOutput, expected: i32) {
    assert_eq!(
        output.exit_code(),
        Some(expected),
        "unexpected exit code for:\n\n{output}"
    );
}

#[test]
fn in_process_run_reports_every_suite() {
    let output = cli().args(["-j", "1"]).unchecked(true).output();
    assert_exit_code(&output, GestExitCode::TEST_RUN_FAILED);

    let stdout = output.stdout_as_str();
    for line in [
        "PASS [",
        "./fixtures/math.rs",
        "FAIL [",
        "./fixtures/failing.rs",
        "FAIL failing > compares the wrong number",
        "FAIL failing > returns an error",
        "TIMEOUT timeout > sleeps too long",
        "Not a test: fixtures/not_a_test.rs",
        "Summary [",
    ] {
        assert!(stdout.contains(line), "stdout contains {line:?}:\n\n{output}");
    }

    // Passing units are only listed in verbose mode.
    assert!(
        !stdout.contains("math > adds"),
        "passing units aren't listed:\n\n{output}"
    );

    for file in FIXTURE_FILES {
        let display = format!("./{file}");
        assert!(stdout.contains(&display), "{display} was reported:\n\n{output}");
    }
}

#[test]
fn multiprocessing_matches_in_process() {
    let in_process = cli().args(["-j", "1", "-v"]).unchecked(true).output();
    let workers = cli()
        .args(["-j", "1", "-v", "--multiprocessing"])
        .unchecked(true)
        .output();

    assert_exit_code(&in_process, GestExitCode::TEST_RUN_FAILED);
    assert_exit_code(&workers, GestExitCode::TEST_RUN_FAILED);
    assert_eq!(
        normalize(&in_process.stdout_as_str()),
        normalize(&workers.stdout_as_str())
    );
}

#[test]
fn console_logs_reach_the_host() {
    for extra in [None, Some("--multiprocessing")] {
        let mut cli = cli();
        cli.args(["--test-file-pattern", "hooks"]);
        if let Some(extra) = extra {
            cli.arg(extra);
        }
        let output = cli.output();
        assert!(
            output
                .stderr_as_str()
                .contains("hello from hooks > sees the first before_each"),
            "console message logged ({extra:?}):\n\n{output}"
        );
    }
}

#[test]
fn file_pattern_skips_other_files() {
    let output = cli()
        .args(["--test-file-pattern", r"math\.rs$", "--multiprocessing"])
        .output();
    assert_exit_code(&output, GestExitCode::OK);

    let stdout = output.stdout_as_str();
    assert!(stdout.contains("PASS ["), "math passed:\n\n{output}");
    assert!(stdout.contains("SKIP ["), "other files skipped:\n\n{output}");
    assert!(!stdout.contains("FAIL"), "nothing failed:\n\n{output}");
}

#[test]
fn name_pattern_skips_units() {
    let output = cli()
        .args(["--test-file-pattern", "math", "-t", "nested", "-v"])
        .output();
    let stdout = output.stdout_as_str();
    assert!(
        stdout.contains("PASS math > nested > multiplies"),
        "matching unit ran:\n\n{output}"
    );
    assert!(
        stdout.contains("SKIP math > adds"),
        "other unit skipped:\n\n{output}"
    );
}

#[test]
fn after_each_failure_fails_the_run() {
    for extra in [None, Some("--multiprocessing")] {
        let mut cli = cli();
        cli.args(["--test-file-pattern", "teardown"]).unchecked(true);
        if let Some(extra) = extra {
            cli.arg(extra);
        }
        let output = cli.output();
        assert_exit_code(&output, GestExitCode::TEST_RUN_FAILED);
        assert!(
            output.stdout_as_str().contains("teardown broke"),
            "hook error reported ({extra:?}):\n\n{output}"
        );
    }
}

#[test]
fn worker_crash_fails_suite_and_respawns() {
    let output = cli()
        .args([
            "-j",
            "1",
            "--multiprocessing",
            "--test-file-pattern",
            "crash|math",
        ])
        .env(CRASH_ENV, "1")
        .unchecked(true)
        .output();
    assert_exit_code(&output, GestExitCode::TEST_RUN_FAILED);

    let stdout = output.stdout_as_str();
    assert!(
        stdout.contains("Test subprocess exited unexpectedly with:"),
        "crash reported:\n\n{output}"
    );
    assert!(
        stdout.contains("worker crashing on purpose"),
        "worker stderr included:\n\n{output}"
    );

    // The math suite ran in a fresh worker afterwards.
    let math_line = stdout
        .lines()
        .find(|line| line.contains("./fixtures/math.rs"))
        .unwrap_or_else(|| panic!("math suite reported:\n\n{output}"));
    assert!(math_line.contains("PASS"), "math passed:\n\n{output}");
}

#[test]
fn project_config_is_applied() {
    let dir = Utf8TempDir::new().unwrap();
    std::fs::write(dir.path().join("gest.toml"), "multiprocessing = true\n").unwrap();

    let output = cli()
        .current_dir(dir.path())
        .args(["--test-file-pattern", "math"])
        .env("GEST_LOG", "gest_runner=debug")
        .output();
    assert!(
        output.stderr_as_str().contains("spawned worker"),
        "config enabled multiprocessing:\n\n{output}"
    );
}

#[test]
fn invalid_config_is_a_setup_error() {
    let dir = Utf8TempDir::new().unwrap();
    std::fs::write(dir.path().join("gest.toml"), "parallel = 0\n").unwrap();

    let output = cli().current_dir(dir.path()).unchecked(true).output();
    assert_exit_code(&output, GestExitCode::SETUP_ERROR);
    assert!(
        output.stderr_as_str().contains("failed to parse config"),
        "error displayed:\n\n{output}"
    );
}

#[test]
fn missing_explicit_config_is_a_setup_error() {
    let dir = Utf8TempDir::new().unwrap();
    let output = cli()
        .current_dir(dir.path())
        .args(["--config", "missing.toml"])
        .unchecked(true)
        .output();
    assert_exit_code(&output, GestExitCode::SETUP_ERROR);
}

#[test]
fn invalid_pattern_is_a_setup_error() {
    let output = cli().args(["-t", "("]).unchecked(true).output();
    assert_exit_code(&output, GestExitCode::SETUP_ERROR);
    assert!(
        output.stderr_as_str().contains("invalid test name pattern"),
        "error displayed:\n\n{output}"
    );
}
