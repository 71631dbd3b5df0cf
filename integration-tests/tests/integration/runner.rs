// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives [`TestRunner`] directly, with workers spawned from the fixture binary.

use gest_runner::{
    config::Parallel,
    progress::{TrackerEvent, UnitStatus},
    reporter::{RunReport, SuiteStatus},
    runner::{TestRunner, TestRunnerBuilder},
    worker::WorkerCommand,
};
use integration_tests::fixtures::{fixture_registry, FIXTURE_FILES};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use test_case::test_case;

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(
        env!("CARGO_BIN_EXE_gest-fixtures"),
        [WorkerCommand::SUBCOMMAND_NAME],
    )
}

fn build(multiprocessing: bool, parallel: usize) -> TestRunner {
    let mut builder = TestRunnerBuilder::default();
    builder.set_parallel(Parallel::Count(parallel));
    if multiprocessing {
        builder.set_multiprocessing(worker_command());
    }
    builder.build(fixture_registry()).unwrap()
}

/// Every unit's status, keyed by test file and full unit name.
fn unit_statuses(report: &RunReport) -> BTreeMap<(String, String), UnitStatus> {
    report
        .suites
        .iter()
        .flat_map(|suite| {
            suite.units.iter().map(|unit| {
                (
                    (suite.state.test_filepath.clone(), unit.unit_name.join(" > ")),
                    unit.status(),
                )
            })
        })
        .collect()
}

fn suite_statuses(report: &RunReport) -> BTreeMap<String, SuiteStatus> {
    report
        .suites
        .iter()
        .map(|suite| (suite.state.test_filepath.clone(), suite.status()))
        .collect()
}

#[test_case(false, 1; "in process, one slot")]
#[test_case(false, 3; "in process, three slots")]
#[test_case(true, 1; "multiprocessing, one slot")]
#[test_case(true, 3; "multiprocessing, three slots")]
fn every_suite_finishes_once(multiprocessing: bool, parallel: usize) {
    let mut added = Vec::new();
    let mut finished = Vec::new();
    let report = build(multiprocessing, parallel).execute(|event| match event {
        TrackerEvent::SuiteAdded { handle, .. } => added.push(*handle),
        TrackerEvent::Finished { handle, .. } => finished.push(*handle),
    });

    assert_eq!(added.len(), FIXTURE_FILES.len());
    added.sort();
    finished.sort();
    assert_eq!(added, finished, "each added suite finished exactly once");

    assert!(!report.success);
    assert!(report.flush_errors.is_empty());
    assert_eq!(report.stats.suites.total, FIXTURE_FILES.len());
    let units = report.stats.units;
    assert_eq!(units.passed + units.failed + units.skipped, units.total);
}

#[test]
fn multiprocessing_matches_in_process() {
    let in_process = build(false, 2).execute(|_| {});
    let workers = build(true, 2).execute(|_| {});

    assert_eq!(unit_statuses(&in_process), unit_statuses(&workers));
    assert_eq!(suite_statuses(&in_process), suite_statuses(&workers));
    assert_eq!(in_process.stats, workers.stats);
}

#[test]
fn fixture_outcomes() {
    let report = build(true, 2).execute(|_| {});
    let suites = suite_statuses(&report);
    assert_eq!(suites["./fixtures/math.rs"], SuiteStatus::Passed);
    assert_eq!(suites["./fixtures/hooks.rs"], SuiteStatus::Passed);
    assert_eq!(suites["./fixtures/failing.rs"], SuiteStatus::Failed);
    assert_eq!(suites["./fixtures/timeout.rs"], SuiteStatus::Failed);
    assert_eq!(suites["./fixtures/teardown.rs"], SuiteStatus::Failed);
    assert_eq!(suites["./fixtures/not_a_test.rs"], SuiteStatus::Failed);

    let timeout = report
        .suites
        .iter()
        .find(|suite| suite.state.test_filepath == "./fixtures/timeout.rs")
        .unwrap();
    let slow = timeout
        .units
        .iter()
        .find(|unit| unit.unit_name.last().map(String::as_str) == Some("sleeps too long"))
        .unwrap();
    assert!(slow.timed_out);

    let failing = report
        .suites
        .iter()
        .find(|suite| suite.state.test_filepath == "./fixtures/failing.rs")
        .unwrap();
    let expect_failure = failing
        .units
        .iter()
        .find(|unit| unit.unit_name.last().map(String::as_str) == Some("compares the wrong number"))
        .and_then(|unit| unit.error.as_ref())
        .unwrap();
    assert!(
        expect_failure.is_expect_error,
        "assertion failures survive the worker boundary"
    );
}
