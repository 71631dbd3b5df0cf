// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared code for gest's integration tests.

pub mod fixtures;
pub mod gest_cli;
