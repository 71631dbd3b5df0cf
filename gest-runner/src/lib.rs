// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for gest, a describe/it style test runner.
//!
//! The basic flow of a run is:
//!
//! 1. Test modules are registered in a [`SuiteRegistry`](registry::SuiteRegistry). Each module
//!    builds a [`Suite`](suite::Suite) tree through the [`describe`](suite::describe) collector.
//! 2. A [`TestRunner`](runner::TestRunner) spawns a number of runner slots which pull modules off a
//!    shared queue and execute them, either in-process or inside a long-lived worker process per
//!    slot (see [`worker`]).
//! 3. Every unit and suite event is fed into the [`ProgressTracker`](progress::ProgressTracker),
//!    which freezes each suite into a finished report exactly once.
//!
//! Test code can additionally control time through the virtual clock in [`clock`].

pub mod clock;
pub mod config;
pub mod errors;
mod helpers;
pub mod matchers;
pub mod progress;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod suite;
mod time;
pub mod worker;
