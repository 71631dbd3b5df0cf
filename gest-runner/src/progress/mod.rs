// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracking the progress of suites and units.
//!
//! Runners report [`UnitProgress`] and [`SuiteProgress`] records for a suite through a
//! [`ProgressSink`]. The [`ProgressTracker`] accumulates them per suite, and once a suite is
//! finished it renders the accumulated records into a [`SuiteFinishState`] and a list of
//! [`UnitFinishState`]s, which subscribers receive as a single [`TrackerEvent::Finished`].

mod enrich;
mod records;
mod tracker;

pub use enrich::{FileLinkEnricher, LocationResolver, SourceEnricher};
pub use records::*;
pub use tracker::*;
