// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::StderrStyles;
use gest_runner::errors::{ConfigParseError, TestRunnerBuildError, WorkerError};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Exit codes returned by gest test binaries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub struct GestExitCode;

impl GestExitCode {
    /// Every suite passed.
    pub const OK: i32 = 0;

    /// Setting up the run failed: bad configuration or command-line arguments.
    pub const SETUP_ERROR: i32 = 96;

    /// At least one unit or suite failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// A worker process could not be started or served, or output could not be written.
    pub const INTERNAL_ERROR: i32 = 102;
}

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error that gest reports to the user and exits with.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("unable to determine the current directory")]
    CurrentDir {
        #[source]
        err: std::io::Error,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("failed to build test runner")]
    RunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("worker setup failed")]
    WorkerSetupError {
        #[source]
        err: WorkerError,
    },
    #[error("worker failed")]
    WorkerError {
        #[source]
        err: WorkerError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
    #[error("test run failed")]
    TestRunFailed,
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDir { .. }
            | Self::ConfigParseError { .. }
            | Self::RunnerBuildError { .. } => GestExitCode::SETUP_ERROR,
            Self::WorkerSetupError { .. }
            | Self::WorkerError { .. }
            | Self::WriteOutputError { .. } => GestExitCode::INTERNAL_ERROR,
            Self::TestRunFailed => GestExitCode::TEST_RUN_FAILED,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::CurrentDir { err } => {
                error!("unable to determine the current directory");
                Some(err as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::RunnerBuildError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WorkerSetupError { err } => {
                error!("failed to set up worker processes");
                Some(err as &dyn Error)
            }
            Self::WorkerError { err } => {
                error!("worker process failed");
                Some(err as &dyn Error)
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
        };

        while let Some(err) = next_error {
            error!(
                "{} {}",
                "caused by:".style(styles.warning_text),
                err
            );
            next_error = err.source();
        }
    }
}
