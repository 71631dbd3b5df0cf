// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long it takes to run units and suites.
//!
//! Units need to track a start time and a duration. For that we use a combination of a wall-clock
//! `DateTime` and an `Instant` (monotonic clock). Durations are always measured with the monotonic
//! clock and reported with microsecond resolution.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls will happen imperceptibly close to each other, which is good
            // enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: truncate_to_micros(self.instant.elapsed()),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

/// Drops sub-microsecond precision, which is what gets reported everywhere.
pub(crate) fn truncate_to_micros(duration: Duration) -> Duration {
    Duration::from_micros(duration.as_micros().min(u128::from(u64::MAX)) as u64)
}
