// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::TestError,
    helpers::duration_micros,
    suite::{HookRef, UnitRef},
};
use camino::Utf8PathBuf;
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The kind marker for [`SuiteHandle`].
pub enum SuiteKind {}

impl TypedUuidKind for SuiteKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("gest_suite");
        TAG
    }
}

/// An opaque handle to a suite registered with a [`ProgressTracker`](super::ProgressTracker).
pub type SuiteHandle = TypedUuid<SuiteKind>;

/// Information about a test file, provided when a suite tracker is created.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteMeta {
    /// The path of the test file.
    pub filepath: Utf8PathBuf,

    /// The location map used to resolve source locations, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_file: Option<Utf8PathBuf>,
}

impl SuiteMeta {
    /// Creates a new `SuiteMeta` without a map file.
    pub fn new(filepath: impl Into<Utf8PathBuf>) -> Self {
        Self {
            filepath: filepath.into(),
            map_file: None,
        }
    }
}

/// Where an error came from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorOrigin {
    /// gest could not run the suite at all.
    Gest,

    /// A lifecycle hook failed.
    LifecycleHook,

    /// A unit, its deferred teardown, or the test module itself failed.
    Test,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gest => "gest",
            Self::LifecycleHook => "lifecycleHook",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

/// An error attached to a progress record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressError {
    /// Where the error came from.
    pub origin: ErrorOrigin,

    /// The error itself.
    pub thrown: TestError,

    /// The hook that failed, for [`ErrorOrigin::LifecycleHook`] errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookRef>,
}

impl ProgressError {
    /// Creates a new error with the given origin.
    pub fn new(origin: ErrorOrigin, thrown: TestError) -> Self {
        Self {
            origin,
            thrown,
            hook: None,
        }
    }

    /// Creates a new error for a failed hook.
    pub fn hook(thrown: TestError, hook: HookRef) -> Self {
        Self {
            origin: ErrorOrigin::LifecycleHook,
            thrown,
            hook: Some(hook),
        }
    }
}

/// The outcome of a single unit.
///
/// Exactly one of these is recorded per unit. Use the constructors to build one, which keep the
/// passed, failed, timed out and skipped states mutually exclusive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitProgress {
    /// The names of the enclosing suites followed by the unit's own name.
    pub unit_name: Vec<String>,

    /// How long the unit took, for passed units.
    #[serde(
        default,
        with = "duration_micros::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,

    /// Why the unit failed, for failed and timed out units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,

    /// Further errors reported by the unit beyond the primary one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_errors: Vec<ProgressError>,

    /// True if the unit timed out.
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,

    /// True if the unit was skipped.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,

    /// The unit, for link resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitRef>,
}

impl UnitProgress {
    /// A unit that passed.
    pub fn passed(unit_name: Vec<String>, duration: Duration, unit: UnitRef) -> Self {
        Self {
            duration: Some(duration),
            ..Self::base(unit_name, unit)
        }
    }

    /// A unit that failed. The first error is the primary one.
    pub fn failed(
        unit_name: Vec<String>,
        error: ProgressError,
        additional_errors: Vec<ProgressError>,
        unit: UnitRef,
    ) -> Self {
        Self {
            error: Some(error),
            additional_errors,
            ..Self::base(unit_name, unit)
        }
    }

    /// A unit that did not finish before its timeout.
    pub fn timed_out(unit_name: Vec<String>, error: ProgressError, unit: UnitRef) -> Self {
        Self {
            error: Some(error),
            timed_out: true,
            ..Self::base(unit_name, unit)
        }
    }

    /// A unit that was skipped.
    pub fn skipped(unit_name: Vec<String>, unit: UnitRef) -> Self {
        Self {
            skipped: true,
            ..Self::base(unit_name, unit)
        }
    }

    fn base(unit_name: Vec<String>, unit: UnitRef) -> Self {
        Self {
            unit_name,
            duration: None,
            error: None,
            additional_errors: Vec::new(),
            timed_out: false,
            skipped: false,
            unit: Some(unit),
        }
    }
}

/// A suite-level event: a suite-level error, or the suite being skipped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteProgress {
    /// The name path of the suite the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_unit_name: Option<Vec<String>>,

    /// The error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,

    /// True if the whole suite was skipped.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
}

impl SuiteProgress {
    /// A suite-level error.
    pub fn error(parent_unit_name: Option<Vec<String>>, error: ProgressError) -> Self {
        Self {
            parent_unit_name,
            error: Some(error),
            skipped: false,
        }
    }

    /// The whole suite was skipped.
    pub fn skipped() -> Self {
        Self {
            parent_unit_name: None,
            error: None,
            skipped: true,
        }
    }
}

/// An error, rendered for reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedError {
    /// Where the error came from.
    pub origin: ErrorOrigin,

    /// The kind name of the error.
    pub error_type: String,

    /// The error message.
    pub message: String,

    /// A trace of where the error came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// A link to the failing hook, for lifecycle hook errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    /// The error itself.
    pub thrown: TestError,
}

/// A unit error, rendered for reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitErrorReport {
    /// The rendered error.
    #[serde(flatten)]
    pub error: ParsedError,

    /// True if this was an assertion failure.
    pub is_expect_error: bool,

    /// A link to the failed assertion, or to the test file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_link: Option<String>,
}

/// The final state of a suite, produced exactly once.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteFinishState {
    /// The test file, relative to the working directory.
    pub test_filepath: String,

    /// How long the suite took.
    #[serde(with = "duration_micros")]
    pub duration: Duration,

    /// Suite-level errors, in the order they were reported.
    pub errors: Vec<ParsedError>,

    /// True if the whole suite was skipped.
    pub skipped: bool,
}

/// The final state of a unit.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFinishState {
    /// The names of the enclosing suites followed by the unit's own name.
    pub unit_name: Vec<String>,

    /// How long the unit took, for passed units.
    #[serde(with = "duration_micros::option", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Why the unit failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitErrorReport>,

    /// Further errors reported by the unit.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_errors: Vec<ParsedError>,

    /// True if the unit timed out.
    pub timed_out: bool,

    /// True if the unit was skipped.
    pub skipped: bool,

    /// A link to where the unit was declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_link: Option<String>,
}

impl UnitFinishState {
    /// Returns the unit's status.
    pub fn status(&self) -> UnitStatus {
        if self.skipped {
            UnitStatus::Skipped
        } else if self.error.is_some() || self.timed_out {
            UnitStatus::Failed
        } else {
            UnitStatus::Passed
        }
    }
}

/// The status of a finished unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitStatus {
    /// The unit passed.
    Passed,

    /// The unit failed or timed out.
    Failed,

    /// The unit was skipped.
    Skipped,
}

fn is_false(b: &bool) -> bool {
    !*b
}
