// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Walking a suite tree: hooks, units, nested suites.

use super::SuiteRunnerOptions;
use crate::{
    errors::TestError,
    helpers::lock,
    progress::{ErrorOrigin, ProgressError, ProgressSink, SuiteProgress, UnitProgress},
    suite::{panic_error, Hook, HookKind, LogSink, Suite, TestResult, Unit, UnitContext},
    time::stopwatch,
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tokio::task::AbortHandle;
use tracing::debug;

/// A hook failure that has already been reported as a suite-level error.
///
/// Returned to unwind a suite's control flow without reporting the failure a second time.
#[derive(Clone, Copy, Debug)]
struct AlreadyReported;

/// Runs a single suite tree, reporting every unit and hook outcome to a [`ProgressSink`].
///
/// A suite runs strictly sequentially. Unit bodies run on their own tokio tasks so that a unit that
/// times out can be left behind; any such task still running is aborted when the runner is dropped.
pub(crate) struct SuiteRunner<'a> {
    options: &'a SuiteRunnerOptions,
    sink: &'a dyn ProgressSink,
    log_sink: Arc<dyn LogSink>,
    abandoned: Mutex<Vec<AbortHandle>>,
}

impl<'a> SuiteRunner<'a> {
    pub(crate) fn new(
        options: &'a SuiteRunnerOptions,
        sink: &'a dyn ProgressSink,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            options,
            sink,
            log_sink,
            abandoned: Mutex::new(Vec::new()),
        }
    }

    /// Runs `suite` and everything nested in it. Returns true if the suite passed.
    pub(crate) fn run_suite<'s>(
        &'s self,
        suite: &'s Suite,
        parent_name: &'s [String],
    ) -> BoxFuture<'s, bool> {
        async move {
            let suite_name = name_path(parent_name, suite.name());
            self.run_suite_inner(suite, &suite_name)
                .await
                .unwrap_or(false)
        }
        .boxed()
    }

    async fn run_suite_inner(
        &self,
        suite: &Suite,
        suite_name: &[String],
    ) -> Result<bool, AlreadyReported> {
        debug!(suite = %suite_name.join(" > "), "running suite");

        for hook in suite.hooks(HookKind::BeforeAll) {
            if let Err(reported) = self.run_hook(hook, suite_name).await {
                self.mark_skipped(suite.units(), suite_name);
                return Err(reported);
            }
        }

        let mut passed = true;
        'units: for unit in suite.units() {
            if self.skip_if_filtered(unit, suite_name) {
                continue;
            }

            for hook in suite.hooks(HookKind::BeforeEach) {
                if self.run_hook(hook, suite_name).await.is_err() {
                    self.mark_skipped(std::slice::from_ref(unit), suite_name);
                    continue 'units;
                }
            }

            passed &= self.run_unit(unit, suite_name).await;

            for hook in suite.hooks(HookKind::AfterEach) {
                if self.run_hook(hook, suite_name).await.is_err() {
                    break;
                }
            }
        }

        for child in suite.children() {
            let derived = suite.derive_child(child);
            passed &= self.run_suite(&derived, suite_name).await;
        }

        let mut after_all_failed = false;
        for hook in suite.hooks(HookKind::AfterAll) {
            after_all_failed |= self.run_hook(hook, suite_name).await.is_err();
        }
        if after_all_failed && self.options.after_all_policy.fails_suite() {
            return Err(AlreadyReported);
        }

        Ok(passed)
    }

    async fn run_hook(&self, hook: &Hook, suite_name: &[String]) -> Result<(), AlreadyReported> {
        let result = catch_panic((hook.callback())()).await;
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!(kind = %hook.kind(), location = %hook.location(), "hook failed");
                error.mark_handled();
                self.sink.suite_progress(SuiteProgress::error(
                    Some(suite_name.to_vec()),
                    ProgressError::hook(error, hook.to_ref()),
                ));
                Err(AlreadyReported)
            }
        }
    }

    fn mark_skipped(&self, units: &[Unit], suite_name: &[String]) {
        for unit in units {
            self.sink.unit_progress(UnitProgress::skipped(
                name_path(suite_name, unit.name()),
                unit.to_ref(),
            ));
        }
    }

    /// Reports `unit` as skipped if it's declared as such or doesn't match the name pattern.
    fn skip_if_filtered(&self, unit: &Unit, suite_name: &[String]) -> bool {
        let unit_name = name_path(suite_name, unit.name());
        let matches = self
            .options
            .name_pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(&unit_name.join(" > ")));

        if unit.skip() || !matches {
            self.sink
                .unit_progress(UnitProgress::skipped(unit_name, unit.to_ref()));
            true
        } else {
            false
        }
    }

    /// Runs a unit and reports its outcome. Returns true if the unit passed.
    async fn run_unit(&self, unit: &Unit, suite_name: &[String]) -> bool {
        let unit_name = name_path(suite_name, unit.name());
        let cx = UnitContext::new(unit_name.clone(), self.log_sink.clone());

        let callback = unit.callback().clone();
        let task_cx = cx.clone();
        let task = tokio::spawn(async move {
            let body = catch_panic(callback(task_cx.clone())).await;
            let deferred = task_cx.run_deferred().await;
            (body, deferred)
        });
        let abort_handle = task.abort_handle();

        let start = stopwatch();
        let outcome = tokio::time::timeout(self.options.timeout, task).await;

        let (body, deferred) = match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(join_error)) => (Err(TestError::new(join_error.to_string())), Ok(())),
            Err(_elapsed) => {
                debug!(unit = %unit_name.join(" > "), "unit timed out");
                // The task keeps running, but nothing it reports from now on is recorded.
                lock(&self.abandoned).push(abort_handle);
                let error = TestError::Timeout(self.options.timeout);
                self.sink.unit_progress(UnitProgress::timed_out(
                    unit_name,
                    ProgressError::new(ErrorOrigin::Test, error),
                    unit.to_ref(),
                ));
                return false;
            }
        };
        let duration = start.snapshot().duration;

        let errors: Vec<_> = body
            .err()
            .into_iter()
            .chain(deferred.err())
            .chain(cx.take_reported())
            .map(|error| {
                error.mark_handled();
                ProgressError::new(ErrorOrigin::Test, error)
            })
            .collect();

        let mut errors = errors.into_iter();
        match errors.next() {
            None => {
                self.sink
                    .unit_progress(UnitProgress::passed(unit_name, duration, unit.to_ref()));
                true
            }
            Some(primary) => {
                self.sink.unit_progress(UnitProgress::failed(
                    unit_name,
                    primary,
                    errors.collect(),
                    unit.to_ref(),
                ));
                false
            }
        }
    }
}

impl Drop for SuiteRunner<'_> {
    fn drop(&mut self) {
        for handle in lock(&self.abandoned).drain(..) {
            handle.abort();
        }
    }
}

async fn catch_panic(fut: BoxFuture<'_, TestResult>) -> TestResult {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload.as_ref())),
    }
}

fn name_path(parent: &[String], name: &str) -> Vec<String> {
    let mut path = Vec::with_capacity(parent.len() + 1);
    path.extend_from_slice(parent);
    path.push(name.to_owned());
    path
}
