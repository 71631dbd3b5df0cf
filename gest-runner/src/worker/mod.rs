// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running test files in long-lived worker processes.
//!
//! With multiprocessing enabled, each runner slot owns one worker: a child process running the same
//! executable with the hidden [worker subcommand](WorkerCommand::SUBCOMMAND_NAME). The host sends one
//! [`HostMessage::RunSuite`] per test file over the worker's stdin, and the worker reports progress
//! back over its stdout (see [`protocol`]). If a worker dies, the suite it was running fails and a
//! fresh worker is spawned for the next test file.

mod client;
mod command;
mod host;
pub mod protocol;

pub use client::{serve, serve_io};
pub use command::WorkerCommand;
pub use host::{HostApi, Multiprocessing, SlotId, WorkerApi, WorkerExit, WorkerHandle};
pub use protocol::{HostMessage, WorkerMessage};
