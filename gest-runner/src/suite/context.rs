// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{SourceLocation, TestResult};
use crate::{
    errors::{DeferredTaskFailure, TestError},
    helpers::{lock, panic_message},
};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info, warn};

/// The kind of a console message logged by test code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// A plain message.
    Log,

    /// An informational message.
    Info,

    /// A debugging message.
    Debug,

    /// A warning.
    Warn,

    /// An error.
    Error,
}

/// The `tracing` target for console messages logged by test code.
pub const CONSOLE_TARGET: &str = "gest::console";

/// Receives console messages logged by test code.
///
/// In-process runs log through [`TracingLogSink`]. Worker processes forward messages to the host.
pub trait LogSink: Send + Sync {
    /// Logs a message.
    fn log(&self, log_type: LogType, message: &str);
}

/// A [`LogSink`] that emits messages as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, log_type: LogType, message: &str) {
        match log_type {
            LogType::Log | LogType::Info => info!(target: CONSOLE_TARGET, "{message}"),
            LogType::Debug => debug!(target: CONSOLE_TARGET, "{message}"),
            LogType::Warn => warn!(target: CONSOLE_TARGET, "{message}"),
            LogType::Error => error!(target: CONSOLE_TARGET, "{message}"),
        }
    }
}

type DeferredFn = Box<dyn FnOnce() -> BoxFuture<'static, TestResult> + Send>;

struct DeferredTask {
    location: SourceLocation,
    task: DeferredFn,
}

/// The context passed to a running unit.
///
/// Cloning a context is cheap, and all clones refer to the same unit.
#[derive(Clone)]
pub struct UnitContext {
    inner: Arc<UnitContextInner>,
}

struct UnitContextInner {
    name_path: Vec<String>,
    deferred: Mutex<Vec<DeferredTask>>,
    reported: Mutex<Vec<TestError>>,
    log_sink: Arc<dyn LogSink>,
}

impl UnitContext {
    pub(crate) fn new(name_path: Vec<String>, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(UnitContextInner {
                name_path,
                deferred: Mutex::new(Vec::new()),
                reported: Mutex::new(Vec::new()),
                log_sink,
            }),
        }
    }

    /// Returns the unit's own name.
    pub fn title(&self) -> &str {
        self.inner
            .name_path
            .last()
            .map_or("", String::as_str)
    }

    /// Returns the names of every enclosing suite followed by the unit's own name.
    pub fn name_path(&self) -> &[String] {
        &self.inner.name_path
    }

    /// Returns the unit's full title, joined with ` > `.
    pub fn full_title(&self) -> String {
        self.inner.name_path.join(" > ")
    }

    /// Registers a teardown task, run after the unit's body whether or not the body failed.
    ///
    /// Tasks run in registration order, and every task runs even if an earlier one fails.
    #[track_caller]
    pub fn defer<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let task = DeferredTask {
            location: SourceLocation::caller(),
            task: Box::new(move || f().boxed()),
        };
        lock(&self.inner.deferred).push(task);
    }

    /// Reports an error raised outside of the unit's body, for example by a background task.
    ///
    /// The unit fails even if its body succeeds.
    pub fn report_error(&self, error: TestError) {
        error.mark_handled();
        lock(&self.inner.reported).push(error);
    }

    /// An alias for [`Self::report_error`].
    pub fn log_error(&self, error: TestError) {
        self.report_error(error)
    }

    /// Logs a console message.
    pub fn log(&self, log_type: LogType, message: impl fmt::Display) {
        self.inner.log_sink.log(log_type, &message.to_string());
    }

    /// Runs and drains every registered deferred task.
    pub(crate) async fn run_deferred(&self) -> TestResult {
        let tasks = std::mem::take(&mut *lock(&self.inner.deferred));
        let mut failures = Vec::new();
        for DeferredTask { location, task } in tasks {
            let result = match AssertUnwindSafe(task()).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(panic_error(payload.as_ref())),
            };
            if let Err(error) = result {
                error.mark_handled();
                failures.push(DeferredTaskFailure { location, error });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TestError::DeferredTasks(failures))
        }
    }

    /// Takes every error reported through [`Self::report_error`] so far.
    pub(crate) fn take_reported(&self) -> Vec<TestError> {
        std::mem::take(&mut *lock(&self.inner.reported))
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("name_path", &self.inner.name_path)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_error(payload: &(dyn std::any::Any + Send)) -> TestError {
    match panic_message(payload) {
        Some(message) => TestError::Panic { message },
        None => TestError::Opaque("<non-string panic payload>".to_owned()),
    }
}
