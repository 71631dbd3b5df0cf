// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::WorkerError;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

/// How to start a worker process.
///
/// A worker is normally the current executable, re-run with the hidden [`Self::SUBCOMMAND_NAME`]
/// subcommand. Since the worker is the same binary, it registers exactly the same test modules.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// The name of the worker subcommand, used throughout gest.
    pub const SUBCOMMAND_NAME: &'static str = "__gest-worker";

    /// Returns a command that re-runs the current executable as a worker.
    pub fn current_exe() -> Result<Self, WorkerError> {
        let program = std::env::current_exe().map_err(WorkerError::CurrentExe)?;
        Ok(Self::new(program, [Self::SUBCOMMAND_NAME]))
    }

    /// Returns a command that runs `program` with `args` as a worker.
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the program that is run.
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_exe_uses_subcommand() {
        let command = WorkerCommand::current_exe().unwrap();
        assert_eq!(command.args, [OsString::from("__gest-worker")]);
        assert_eq!(
            command.program(),
            std::env::current_exe().unwrap().as_path()
        );
    }
}
