// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The command-line harness for gest test binaries.
//!
//! A test binary registers its test modules and hands the registry to [`main`]:
//!
//! ```no_run
//! use gest_runner::{registry::{SuiteRegistry, TestModule}, suite::describe};
//!
//! fn main() -> color_eyre::Result<()> {
//!     let mut registry = SuiteRegistry::new();
//!     registry.register("tests/math.rs", || {
//!         TestModule::new(describe("math", |s| {
//!             s.it("adds", |_| async { Ok(()) });
//!         }))
//!     });
//!     gest::main(registry)
//! }
//! ```
//!
//! The same binary doubles as the worker process when multiprocessing is enabled, so every worker
//! sees exactly the same modules as the host.

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
pub use output::{Color, OutputContext, StderrStyles};

use clap::Parser;
use gest_runner::registry::SuiteRegistry;

/// Parses the command line, runs the requested command and exits the process.
pub fn main(registry: SuiteRegistry) -> color_eyre::Result<()> {
    color_eyre::install()?;
    let _ = enable_ansi_support::enable_ansi_support();

    let app = GestApp::parse();
    let output = app.init_output();

    match app.exec(registry, output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
