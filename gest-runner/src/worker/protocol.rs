// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire protocol between the host and its workers.
//!
//! Messages are JSON objects, one per line, prefixed with [`PROTOCOL_PREFIX`]. The host writes
//! [`HostMessage`]s to the worker's stdin, and the worker writes [`WorkerMessage`]s to its stdout.
//! Test code may print to stdout as well; lines without the prefix are not protocol messages.

use crate::{
    errors::TestError,
    helpers::{duration_micros, duration_millis},
    progress::{SuiteProgress, UnitProgress},
    registry::TestSuiteEntry,
    runner::{AfterAllPolicy, TestRunnerOptions},
    suite::LogType,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// The prefix for every protocol line.
pub const PROTOCOL_PREFIX: &str = "@@gest:";

/// A message sent from the host to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Run a test file through the suite runner and report back.
    #[serde(rename_all = "camelCase")]
    RunSuite {
        /// The test file to run.
        entry: TestSuiteEntry,

        /// Options for the run.
        options: TestRunnerOptions,

        /// The per-unit timeout, unless the module overrides it.
        #[serde(with = "duration_millis")]
        default_timeout: Duration,

        /// How `after_all` failures affect the suite.
        #[serde(default)]
        after_all_policy: AfterAllPolicy,
    },
}

/// A message sent from a worker to the host.
///
/// These mirror the [`HostApi`](super::HostApi) methods. Progress records carry no suite handle: the
/// host attaches the handle of the suite the worker is currently running.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// A unit's outcome.
    UnitProgress {
        /// The record.
        record: UnitProgress,
    },

    /// A suite-level event.
    SuiteProgress {
        /// The record.
        record: SuiteProgress,
    },

    /// The suite is complete.
    Finish {
        /// How long the suite took, in microseconds.
        #[serde(default, with = "duration_micros::option")]
        duration: Option<Duration>,
    },

    /// Test code logged a console message.
    #[serde(rename_all = "camelCase")]
    SendLog {
        /// The kind of message.
        log_type: LogType,

        /// The message arguments.
        args: Vec<String>,
    },

    /// At least one unit or suite failed.
    TestsFailed,

    /// The worker is done with the current test file. `error` is set if the file could not be run.
    TestFinished {
        /// Why the test file could not be run.
        #[serde(default)]
        error: Option<TestError>,
    },
}

/// Encodes a message as a protocol line, including the trailing newline.
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(message)?;
    Ok(format!("{PROTOCOL_PREFIX}{json}\n"))
}

/// Decodes a protocol line.
///
/// Returns `None` if the line isn't a protocol line at all.
pub fn decode<T: DeserializeOwned>(line: &str) -> Option<Result<T, serde_json::Error>> {
    let json = line.strip_prefix(PROTOCOL_PREFIX)?;
    Some(serde_json::from_str(json.trim_end()))
}
