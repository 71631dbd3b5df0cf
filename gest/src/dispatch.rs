// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result},
    output::{clap_styles, OutputContext, OutputOpts},
    GestExitCode,
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use gest_runner::{
    config::{GestConfig, Parallel},
    progress::TrackerEvent,
    registry::SuiteRegistry,
    reporter::SummaryDisplayer,
    runner::{TestRunnerBuilder, TestRunnerOptions},
    worker::{self, WorkerCommand},
};
use std::{io::Write, time::Duration};
use tracing::debug;

/// Runs the describe/it suites registered in this test binary.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style(), args_conflicts_with_subcommands = true)]
pub struct GestApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    run: RunOpts,

    #[clap(subcommand)]
    command: Option<Command>,
}

impl GestApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        match &self.command {
            Some(Command::Worker) => OutputContext::color_never_init(),
            None => self.output.init(),
        }
    }

    /// Executes the app against `registry`, returning the process exit code.
    pub fn exec(self, registry: SuiteRegistry, output: OutputContext) -> Result<i32> {
        match self.command {
            Some(Command::Worker) => {
                worker::serve(registry).map_err(|err| ExpectedError::WorkerError { err })?;
                Ok(GestExitCode::OK)
            }
            None => self.run.exec(registry, output),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves test files for a host process over stdin and stdout.
    #[command(name = "__gest-worker", hide = true)]
    Worker,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Run options")]
struct RunOpts {
    /// Only run units whose full name matches this regular expression
    #[arg(long, short = 't', value_name = "REGEX", env = "GEST_TEST_NAME_PATTERN")]
    test_name_pattern: Option<String>,

    /// Only run test files whose path matches this regular expression
    #[arg(long, value_name = "REGEX", env = "GEST_TEST_FILE_PATTERN")]
    test_file_pattern: Option<String>,

    /// Number of runner slots [possible values: integer or "num-cpus"]
    #[arg(
        long,
        short = 'j',
        value_name = "SLOTS",
        allow_negative_numbers = true,
        env = "GEST_PARALLEL"
    )]
    parallel: Option<Parallel>,

    /// Per-unit timeout, e.g. "500ms" or "10s"
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    default_timeout: Option<Duration>,

    /// Run each test file in a worker process
    #[arg(long, env = "GEST_MULTIPROCESSING")]
    multiprocessing: bool,

    /// Config file [default: gest.toml in the current directory]
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,
}

impl RunOpts {
    fn exec(self, registry: SuiteRegistry, output: OutputContext) -> Result<i32> {
        let cwd = current_dir()?;
        let config = GestConfig::from_sources(&cwd, self.config.as_deref())?;
        debug!(?config, "loaded config");

        let mut builder = TestRunnerBuilder::default();
        builder
            .set_options(TestRunnerOptions {
                test_name_pattern: self.test_name_pattern,
                test_file_pattern: self.test_file_pattern,
            })
            .set_parallel(self.parallel.unwrap_or(config.parallel))
            .set_default_timeout(self.default_timeout.unwrap_or(config.default_timeout))
            .set_after_all_policy(config.after_all_policy)
            .set_cwd(cwd);
        if self.multiprocessing || config.multiprocessing {
            let command = WorkerCommand::current_exe()
                .map_err(|err| ExpectedError::WorkerSetupError { err })?;
            builder.set_multiprocessing(command);
        }

        let runner = builder.build(registry)?;
        debug!(parallel = runner.parallel(), "starting test run");
        let report = runner.execute(|event| {
            if let TrackerEvent::Finished { suite, .. } = event {
                debug!(test_file = %suite.test_filepath, "suite finished");
            }
        });

        let mut displayer = SummaryDisplayer::new(output.verbose);
        if output.color.should_colorize(supports_color::Stream::Stdout) {
            displayer.colorize();
        }
        let mut stdout = std::io::stdout().lock();
        displayer
            .write_report(&report, &mut stdout)
            .and_then(|()| stdout.flush())
            .map_err(|err| ExpectedError::WriteOutputError { err })?;

        if report.success {
            Ok(GestExitCode::OK)
        } else {
            Err(ExpectedError::TestRunFailed)
        }
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().map_err(|err| ExpectedError::CurrentDir { err })?;
    Utf8PathBuf::try_from(dir).map_err(|err| ExpectedError::CurrentDir {
        err: err.into_io_error(),
    })
}
