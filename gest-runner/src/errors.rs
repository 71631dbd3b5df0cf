// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by gest.
//!
//! There are two families of errors in here:
//!
//! * [`TestError`] is the value "thrown" by test code: a unit callback, a hook, a deferred task or
//!   the runner itself on behalf of a unit (e.g. a timeout). It's a closed set of kinds, and it
//!   crosses the worker process boundary as an [`ErrorEnvelope`].
//! * Everything else is an ordinary error produced by gest's own machinery (configuration, module
//!   loading, worker processes, report finalization).

use crate::suite::SourceLocation;
use camino::Utf8PathBuf;
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use swrite::{swrite, SWrite};
use thiserror::Error;
use tracing::warn;

/// The marker used in an [`ErrorEnvelope`] when the thrown value wasn't a recognized error.
pub const UNKNOWN_ERROR_MARKER: &str = "none";

/// A value thrown by test code, or synthesized by the runner on behalf of a unit.
///
/// Classification is always done by matching on the variant, never by inspecting the message.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[serde(into = "ErrorEnvelope", from = "ErrorEnvelope")]
pub enum TestError {
    /// A plain failure raised by test code.
    #[error("{message}")]
    Failure {
        /// The failure message.
        message: String,

        /// Where the failure was raised, if known.
        location: Option<SourceLocation>,
    },

    /// An assertion failure.
    #[error("{0}")]
    Expect(ExpectError),

    /// One or more deferred teardown tasks failed.
    #[error("Deferred task(s) has failed.")]
    DeferredTasks(Vec<DeferredTaskFailure>),

    /// A unit did not settle before its timeout elapsed.
    #[error("Unit test has not finished within the given time ({}ms)", .0.as_millis())]
    Timeout(Duration),

    /// Test code panicked.
    #[error("{message}")]
    Panic {
        /// The panic message.
        message: String,
    },

    /// gest itself could not run a suite.
    #[error("{0}")]
    Gest(String),

    /// A thrown value that isn't a recognized error (e.g. a panic with a non-string payload).
    #[error("{0}")]
    Opaque(String),

    /// An error reconstructed from a worker process.
    #[error("{}", .0.message)]
    Remote(ErrorEnvelope),
}

impl TestError {
    /// Creates a plain failure at the caller's location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            location: Some(SourceLocation::caller()),
        }
    }

    /// Creates a plain failure out of a standard error, including its source chain.
    #[track_caller]
    pub fn from_std(error: &(dyn StdError + 'static)) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            swrite!(message, "\n  caused by: {cause}");
            source = cause.source();
        }
        Self::new(message)
    }

    /// Returns the name of this kind of error.
    pub fn name(&self) -> &str {
        match self {
            Self::Failure { .. } => "Error",
            Self::Expect(_) => "ExpectError",
            Self::DeferredTasks(_) => "DeferredTaskError",
            Self::Timeout(_) => "TimeoutError",
            Self::Panic { .. } => "Panic",
            Self::Gest(_) => "GestError",
            Self::Opaque(_) => "UnknownError",
            Self::Remote(envelope) => &envelope.name,
        }
    }

    /// Returns the marker identifying this kind across the worker boundary.
    pub fn internal_marker(&self) -> &str {
        match self {
            Self::Opaque(_) => UNKNOWN_ERROR_MARKER,
            Self::Remote(envelope) => &envelope.internal_marker,
            other => other.name(),
        }
    }

    /// Returns a human-readable trace of where this error came from, if available.
    pub fn stack(&self) -> Option<String> {
        match self {
            Self::Failure { location, .. } => location.as_ref().map(|loc| format!("    at {loc}")),
            Self::Expect(err) => Some(format!("    at {}", err.location)),
            Self::DeferredTasks(failures) => {
                let mut out = String::new();
                for (index, failure) in failures.iter().enumerate() {
                    if index > 0 {
                        out.push('\n');
                    }
                    swrite!(
                        out,
                        "  {}. {}\n      at {}",
                        index + 1,
                        failure.error,
                        failure.location
                    );
                }
                Some(out)
            }
            Self::Timeout(_) | Self::Panic { .. } | Self::Gest(_) => None,
            Self::Opaque(_) => Some("<unable to generate a stack trace>".to_owned()),
            Self::Remote(envelope) => envelope.stack.clone(),
        }
    }

    /// Returns true if this is an assertion failure, including one sent over from a worker.
    pub fn is_expect_error(&self) -> bool {
        match self {
            Self::Expect(_) => true,
            Self::Remote(envelope) => envelope.internal_marker == "ExpectError",
            _ => false,
        }
    }

    /// Returns true if gest raised this error itself and has already reported it.
    pub fn is_gest_error(&self) -> bool {
        match self {
            Self::Gest(_) => true,
            Self::Remote(envelope) => envelope.internal_marker == "GestError",
            _ => false,
        }
    }

    /// Returns the location where the error was raised, if known.
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            Self::Failure { location, .. } => location.as_ref(),
            Self::Expect(err) => Some(&err.location),
            Self::Remote(envelope) => envelope.location.as_ref(),
            _ => None,
        }
    }

    /// Marks an assertion failure as handled, disarming its watchdog. A no-op for other kinds.
    pub fn mark_handled(&self) {
        if let Self::Expect(err) = self {
            err.handle();
        }
    }
}

/// A failed deferred task, as part of [`TestError::DeferredTasks`].
#[derive(Clone, Debug)]
pub struct DeferredTaskFailure {
    /// Where the task was registered.
    pub location: SourceLocation,

    /// What the task failed with.
    pub error: TestError,
}

/// An assertion failure, produced by a matcher.
///
/// On creation, an assertion failure arms a watchdog: if nothing marks it as handled within
/// [`Self::UNHANDLED_GRACE`], a warning is logged. This catches assertions made inside futures that
/// were never awaited.
#[derive(Clone, Debug)]
pub struct ExpectError {
    message: String,
    expected: Option<String>,
    received: Option<String>,
    diff: Option<String>,
    location: SourceLocation,
    handled: Arc<AtomicBool>,
}

impl ExpectError {
    /// How long an assertion failure may stay unhandled before a warning is logged.
    pub const UNHANDLED_GRACE: Duration = Duration::from_millis(100);

    /// Creates a new assertion failure and arms its watchdog.
    pub fn new(
        message: impl Into<String>,
        expected: Option<String>,
        received: Option<String>,
        diff: Option<String>,
        location: SourceLocation,
    ) -> Self {
        let this = Self {
            message: message.into(),
            expected,
            received,
            diff,
            location,
            handled: Arc::new(AtomicBool::new(false)),
        };
        this.arm_watchdog();
        this
    }

    fn arm_watchdog(&self) {
        // Outside of a runtime there's nothing that could await the assertion anyway.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let handled = self.handled.clone();
        let message = self.message.clone();
        handle.spawn(async move {
            tokio::time::sleep(Self::UNHANDLED_GRACE).await;
            if !handled.load(Ordering::Acquire) {
                warn!(
                    "an expect error was not handled, this is most likely due to an async \
                     matcher not being awaited\n\nError: {message}"
                );
            }
        });
    }

    /// Marks this assertion failure as handled.
    pub fn handle(&self) {
        self.handled.store(true, Ordering::Release);
    }

    /// Returns true if this assertion failure has been handled.
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns a rendering of the expected value.
    pub fn expected(&self) -> Option<&str> {
        self.expected.as_deref()
    }

    /// Returns a rendering of the received value.
    pub fn received(&self) -> Option<&str> {
        self.received.as_deref()
    }

    /// Returns a diff between the expected and received values.
    pub fn diff(&self) -> Option<&str> {
        self.diff.as_deref()
    }

    /// Returns where the assertion was made.
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }
}

impl fmt::Display for ExpectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The serialized form of a [`TestError`], used across the worker process boundary.
///
/// Live error values can't cross a process boundary, so the worker flattens them into this
/// envelope and the host reconstructs a [`TestError::Remote`] out of it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// The kind name, e.g. `ExpectError`.
    pub name: String,

    /// The error message.
    pub message: String,

    /// A trace of where the error came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// The kind marker, or [`UNKNOWN_ERROR_MARKER`].
    pub internal_marker: String,

    /// Where the error was raised, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,

    /// Extra structured fields (`expected`, `received`, `diff` for assertion failures).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl From<TestError> for ErrorEnvelope {
    fn from(error: TestError) -> Self {
        if let TestError::Remote(envelope) = error {
            return envelope;
        }

        let mut details = BTreeMap::new();
        if let TestError::Expect(expect) = &error {
            // The envelope replaces the live error, so the watchdog has done its job.
            expect.handle();
            let fields = [
                ("expected", expect.expected()),
                ("received", expect.received()),
                ("diff", expect.diff()),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    details.insert(key.to_owned(), value.to_owned());
                }
            }
        }

        Self {
            name: error.name().to_owned(),
            message: error.to_string(),
            stack: error.stack(),
            internal_marker: error.internal_marker().to_owned(),
            location: error.location().cloned(),
            details,
        }
    }
}

impl From<ErrorEnvelope> for TestError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self::Remote(envelope)
    }
}

/// An error that occurred while parsing the gest config.
#[derive(Debug, Error)]
#[error("failed to parse gest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurs while parsing a [`Parallel`](crate::config::Parallel) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for parallel: {input}")]
pub struct ParallelParseError {
    input: String,
}

impl ParallelParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// The test name pattern is not a valid regular expression.
    #[error("invalid test name pattern `{pattern}`")]
    InvalidNamePattern {
        /// The pattern.
        pattern: String,

        /// The underlying error.
        #[source]
        err: regex::Error,
    },

    /// The test file pattern is not a valid regular expression.
    #[error("invalid test file pattern `{pattern}`")]
    InvalidFilePattern {
        /// The pattern.
        pattern: String,

        /// The underlying error.
        #[source]
        err: regex::Error,
    },

    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The current directory could not be determined, or is not valid UTF-8.
    #[error("unable to determine the current directory")]
    CurrentDir(#[source] std::io::Error),
}

/// An error that occurs while loading a test module out of a
/// [`SuiteRegistry`](crate::registry::SuiteRegistry).
#[derive(Clone, Debug, Error)]
#[error("failed to load test module `{test_file}`: no such module is registered")]
pub struct ModuleLoadError {
    test_file: Utf8PathBuf,
}

impl ModuleLoadError {
    pub(crate) fn new(test_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            test_file: test_file.into(),
        }
    }
}

/// An error that occurs while talking to a worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The current executable could not be determined.
    #[error("unable to determine the current executable")]
    CurrentExe(#[source] std::io::Error),

    /// An error occurred while creating the worker's Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The worker process could not be spawned.
    #[error("failed to spawn worker process `{program}`")]
    Spawn {
        /// The program that was executed.
        program: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A message could not be written to or read from the worker.
    #[error("failed to communicate with the worker process")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized or deserialized.
    #[error("malformed worker protocol message")]
    Protocol(#[from] serde_json::Error),

    /// The worker's pipes were not set up.
    #[error("worker process was spawned without piped {0}")]
    MissingPipe(&'static str),

    /// The worker process is gone.
    #[error("worker process has already exited")]
    Exited,
}

/// An error that occurs while resolving source locations for a finished suite.
#[derive(Debug, Error)]
#[error("failed to read source map `{map_file}`")]
pub struct EnrichError {
    map_file: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl EnrichError {
    /// Creates a new `EnrichError`.
    pub fn new(map_file: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self {
            map_file: map_file.into(),
            err,
        }
    }

    /// Returns the map file that couldn't be read.
    pub fn map_file(&self) -> &Utf8PathBuf {
        &self.map_file
    }
}

/// An error that occurred while finalizing a suite's report, returned by
/// [`ProgressTracker::flush`](crate::progress::ProgressTracker::flush).
#[derive(Debug, Error)]
#[error("failed to finalize the report for `{test_file}`")]
pub struct FlushError {
    test_file: Utf8PathBuf,
    #[source]
    err: FlushErrorKind,
}

impl FlushError {
    pub(crate) fn new(test_file: impl Into<Utf8PathBuf>, err: FlushErrorKind) -> Self {
        Self {
            test_file: test_file.into(),
            err,
        }
    }

    /// Returns the test file whose report could not be finalized.
    pub fn test_file(&self) -> &Utf8PathBuf {
        &self.test_file
    }

    /// Returns the map file that couldn't be read, if that's what went wrong.
    pub fn map_file(&self) -> Option<&Utf8PathBuf> {
        match &self.err {
            FlushErrorKind::Enrich(err) => Some(err.map_file()),
            FlushErrorKind::Join(_) => None,
        }
    }
}

/// The cause of a [`FlushError`].
#[derive(Debug, Error)]
pub enum FlushErrorKind {
    /// Source locations could not be resolved.
    #[error(transparent)]
    Enrich(EnrichError),

    /// The finalization task panicked.
    #[error("finalization task panicked")]
    Join(#[source] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn location() -> SourceLocation {
        SourceLocation::new("tests/math.rs", 12, 5)
    }

    #[test]
    fn envelope_round_trip_keeps_kind() {
        let error = TestError::Expect(ExpectError::new(
            "Expected values to be equal",
            Some("2".to_owned()),
            Some("3".to_owned()),
            None,
            location(),
        ));

        let json = serde_json::to_string(&error).unwrap();
        let back: TestError = serde_json::from_str(&json).unwrap();

        assert!(back.is_expect_error(), "expect kind survives the boundary");
        assert_eq!(back.name(), "ExpectError");
        assert_eq!(back.to_string(), "Expected values to be equal");
        assert_eq!(back.stack().as_deref(), Some("    at tests/math.rs:12:5"));
        assert_eq!(back.location(), Some(&location()));
        let TestError::Remote(envelope) = back else {
            panic!("deserialized errors are remote");
        };
        assert_eq!(envelope.details.get("expected").map(String::as_str), Some("2"));
        assert_eq!(envelope.details.get("received").map(String::as_str), Some("3"));
        assert!(!envelope.details.contains_key("diff"));
    }

    #[test]
    fn opaque_values_use_unknown_marker() {
        let envelope = ErrorEnvelope::from(TestError::Opaque("42".to_owned()));
        assert_eq!(
            envelope,
            ErrorEnvelope {
                name: "UnknownError".to_owned(),
                message: "42".to_owned(),
                stack: Some("<unable to generate a stack trace>".to_owned()),
                internal_marker: UNKNOWN_ERROR_MARKER.to_owned(),
                location: None,
                details: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn envelope_wire_format() {
        let envelope = ErrorEnvelope::from(TestError::Gest("Not a test: a.rs".to_owned()));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "GestError",
                "message": "Not a test: a.rs",
                "internalMarker": "GestError",
            })
        );
        assert!(TestError::from(envelope).is_gest_error());
    }

    #[test]
    fn deferred_stack_lists_every_failure() {
        let error = TestError::DeferredTasks(vec![
            DeferredTaskFailure {
                location: SourceLocation::new("a.rs", 1, 1),
                error: TestError::Failure {
                    message: "first".to_owned(),
                    location: None,
                },
            },
            DeferredTaskFailure {
                location: SourceLocation::new("a.rs", 2, 1),
                error: TestError::Panic {
                    message: "second".to_owned(),
                },
            },
        ]);

        assert_eq!(
            error.stack().as_deref(),
            Some("  1. first\n      at a.rs:1:1\n  2. second\n      at a.rs:2:1")
        );
    }

    #[test]
    fn timeout_message() {
        assert_eq!(
            TestError::Timeout(Duration::from_millis(1500)).to_string(),
            "Unit test has not finished within the given time (1500ms)"
        );
    }
}
