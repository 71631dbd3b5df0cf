// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]. It spawns a number of runner slots which
//! pull test files off a shared queue, and runs each one either in-process or in the slot's worker
//! process.

mod imp;
mod suite;

pub use imp::*;

use self::suite::SuiteRunner;
use crate::{
    errors::{TestError, TestRunnerBuildError},
    progress::{ErrorOrigin, ProgressError, ProgressSink, SuiteProgress},
    registry::{ModuleExport, SuiteRegistry},
    suite::{panic_error, LogSink},
    time::stopwatch,
};
use camino::Utf8Path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::debug;

/// Options that control which tests run.
///
/// These are forwarded verbatim to worker processes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunnerOptions {
    /// Only run units whose full name (suite names and unit name joined with ` > `) matches this
    /// regular expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name_pattern: Option<String>,

    /// Only run test files whose path matches this regular expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_file_pattern: Option<String>,
}

impl TestRunnerOptions {
    pub(crate) fn name_pattern(&self) -> Result<Option<Regex>, TestRunnerBuildError> {
        self.test_name_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| TestRunnerBuildError::InvalidNamePattern {
                    pattern: pattern.to_owned(),
                    err,
                })
            })
            .transpose()
    }

    pub(crate) fn file_pattern(&self) -> Result<Option<Regex>, TestRunnerBuildError> {
        self.test_file_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| TestRunnerBuildError::InvalidFilePattern {
                    pattern: pattern.to_owned(),
                    err,
                })
            })
            .transpose()
    }
}

/// Whether an `after_all` hook failure fails its suite.
///
/// Either way, every `after_all` hook runs and every failure is reported as a suite-level error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AfterAllPolicy {
    /// Report the failure, but keep the verdict computed from the suite's units and children.
    #[default]
    ReportOnly,

    /// Report the failure and fail the suite.
    FailSuite,
}

impl AfterAllPolicy {
    pub(crate) fn fails_suite(self) -> bool {
        matches!(self, Self::FailSuite)
    }
}

/// Settings shared by every suite in a run, in-process or in a worker.
#[derive(Clone, Debug)]
pub(crate) struct RunSettings {
    pub(crate) name_pattern: Option<Regex>,
    pub(crate) default_timeout: Duration,
    pub(crate) after_all_policy: AfterAllPolicy,
}

impl RunSettings {
    pub(crate) fn new(
        options: &TestRunnerOptions,
        default_timeout: Duration,
        after_all_policy: AfterAllPolicy,
    ) -> Result<Self, TestRunnerBuildError> {
        Ok(Self {
            name_pattern: options.name_pattern()?,
            default_timeout,
            after_all_policy,
        })
    }

    /// Returns the options for a module, which may override the default timeout.
    pub(crate) fn for_module(&self, timeout: Option<Duration>) -> SuiteRunnerOptions {
        SuiteRunnerOptions {
            name_pattern: self.name_pattern.clone(),
            timeout: timeout.unwrap_or(self.default_timeout),
            after_all_policy: self.after_all_policy,
        }
    }
}

/// Options for running a single suite tree.
#[derive(Clone, Debug)]
pub(crate) struct SuiteRunnerOptions {
    pub(crate) name_pattern: Option<Regex>,
    pub(crate) timeout: Duration,
    pub(crate) after_all_policy: AfterAllPolicy,
}

/// What happened when a test module was run.
#[derive(Debug)]
pub(crate) enum ModuleOutcome {
    /// The module's suite ran to completion.
    Ran { passed: bool, duration: Duration },

    /// The module doesn't export a suite. The error has already been reported.
    NotATest(TestError),
}

/// Loads the module for `test_file` and runs its suite, reporting to `sink`.
///
/// This is shared by the in-process runner and by worker processes, so both report exactly the
/// same progress records. Finishing the suite is up to the caller.
pub(crate) async fn run_module(
    registry: &SuiteRegistry,
    test_file: &Utf8Path,
    settings: &RunSettings,
    sink: &dyn ProgressSink,
    log_sink: Arc<dyn LogSink>,
) -> Result<ModuleOutcome, TestError> {
    // Building a module runs user code, which may panic.
    let module = match std::panic::catch_unwind(AssertUnwindSafe(|| registry.load(test_file))) {
        Ok(Ok(module)) => module,
        Ok(Err(err)) => return Err(TestError::from_std(&err)),
        Err(payload) => return Err(panic_error(&*payload)),
    };

    let suite = match module.default_export {
        ModuleExport::Suite(suite) => suite,
        ModuleExport::Other(found) => {
            debug!(%test_file, %found, "module does not export a suite");
            let error = TestError::Gest(format!(
                "Not a test: {test_file}\n\
                 Make sure the module's default export is a suite built with `describe` \
                 (found {found})."
            ));
            sink.suite_progress(SuiteProgress::error(
                None,
                ProgressError::new(ErrorOrigin::Gest, error.clone()),
            ));
            return Ok(ModuleOutcome::NotATest(error));
        }
    };

    let options = settings.for_module(module.timeout);
    let start = stopwatch();
    let passed = SuiteRunner::new(&options, sink, log_sink)
        .run_suite(&suite, &[])
        .await;
    Ok(ModuleOutcome::Ran {
        passed,
        duration: start.snapshot().duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, "math > adds", true; "no pattern")]
    #[test_case(Some("adds$"), "math > adds", true; "suffix")]
    #[test_case(Some("^math > sub"), "math > adds", false; "no match")]
    fn name_pattern(pattern: Option<&str>, name: &str, expected: bool) {
        let options = TestRunnerOptions {
            test_name_pattern: pattern.map(str::to_owned),
            ..Default::default()
        };
        let settings =
            RunSettings::new(&options, Duration::from_secs(5), AfterAllPolicy::default()).unwrap();
        let matches = settings
            .name_pattern
            .as_ref()
            .map_or(true, |re| re.is_match(name));
        assert_eq!(matches, expected);
    }

    #[test]
    fn invalid_patterns() {
        let options = TestRunnerOptions {
            test_name_pattern: Some("(".to_owned()),
            test_file_pattern: Some("[".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            options.name_pattern(),
            Err(TestRunnerBuildError::InvalidNamePattern { .. })
        ));
        assert!(matches!(
            options.file_pattern(),
            Err(TestRunnerBuildError::InvalidFilePattern { .. })
        ));
    }

    #[test]
    fn module_timeout_overrides_default() {
        let settings = RunSettings::new(
            &TestRunnerOptions::default(),
            Duration::from_secs(5),
            AfterAllPolicy::FailSuite,
        )
        .unwrap();
        assert_eq!(settings.for_module(None).timeout, Duration::from_secs(5));
        assert_eq!(
            settings.for_module(Some(Duration::from_millis(10))).timeout,
            Duration::from_millis(10)
        );
        assert!(settings.for_module(None).after_all_policy.fails_suite());
    }
}
