// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{run_module, AfterAllPolicy, ModuleOutcome, RunSettings, TestRunnerOptions};
use crate::{
    config::Parallel,
    errors::{TestError, TestRunnerBuildError},
    helpers::lock,
    progress::{
        ErrorOrigin, ProgressError, ProgressTracker, SourceEnricher, SuiteHandle, SuiteMeta,
        SuiteProgress, TrackerEvent,
    },
    registry::{SuiteRegistry, TestSuiteEntry},
    reporter::{ReportAggregator, RunReport},
    suite::TracingLogSink,
    time::stopwatch,
    worker::{HostMessage, Multiprocessing, SlotId, WorkerApi, WorkerCommand},
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use regex::Regex;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{runtime::Runtime, task::JoinSet};
use tracing::{debug, error};

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    options: TestRunnerOptions,
    parallel: Option<Parallel>,
    default_timeout: Option<Duration>,
    multiprocessing: Option<WorkerCommand>,
    after_all_policy: AfterAllPolicy,
    enricher: Option<DebugIgnore<Arc<dyn SourceEnricher>>>,
    cwd: Option<Utf8PathBuf>,
}

impl TestRunnerBuilder {
    /// The per-unit timeout used when neither the builder nor a module sets one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Sets the options that control which tests run.
    pub fn set_options(&mut self, options: TestRunnerOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Sets the number of runner slots.
    pub fn set_parallel(&mut self, parallel: Parallel) -> &mut Self {
        self.parallel = Some(parallel);
        self
    }

    /// Sets the default per-unit timeout.
    pub fn set_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Runs every test file in a worker process started with `command`.
    pub fn set_multiprocessing(&mut self, command: WorkerCommand) -> &mut Self {
        self.multiprocessing = Some(command);
        self
    }

    /// Sets how `after_all` hook failures affect their suite.
    pub fn set_after_all_policy(&mut self, policy: AfterAllPolicy) -> &mut Self {
        self.after_all_policy = policy;
        self
    }

    /// Sets the enricher used to resolve links in reports.
    pub fn set_enricher(&mut self, enricher: Arc<dyn SourceEnricher>) -> &mut Self {
        self.enricher = Some(DebugIgnore(enricher));
        self
    }

    /// Sets the directory test file paths are displayed relative to. Defaults to the current
    /// directory.
    pub fn set_cwd(&mut self, cwd: impl Into<Utf8PathBuf>) -> &mut Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Creates a new test runner for the modules in `registry`.
    pub fn build(self, registry: SuiteRegistry) -> Result<TestRunner, TestRunnerBuildError> {
        let settings = RunSettings::new(
            &self.options,
            self.default_timeout.unwrap_or(Self::DEFAULT_TIMEOUT),
            self.after_all_policy,
        )?;
        let file_pattern = self.options.file_pattern()?;
        let parallel = self.parallel.unwrap_or_default().compute().max(1);

        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()
                .and_then(|dir| {
                    Utf8PathBuf::try_from(dir).map_err(|err| err.into_io_error())
                })
                .map_err(TestRunnerBuildError::CurrentDir)?,
        };
        let tracker = match self.enricher {
            Some(enricher) => ProgressTracker::with_enricher(cwd, enricher.0),
            None => ProgressTracker::new(cwd),
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("gest-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;

        Ok(TestRunner {
            inner: Arc::new(RunnerShared {
                queue: Mutex::new(Vec::new()),
                registry,
                tracker,
                options: self.options,
                settings,
                file_pattern,
                multiprocessing: self.multiprocessing.map(Multiprocessing::new),
            }),
            parallel,
            runtime,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    inner: Arc<RunnerShared>,
    parallel: usize,
    runtime: Runtime,
}

impl TestRunner {
    /// Returns the number of runner slots.
    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Returns the progress tracker for this run.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.inner.tracker
    }

    /// Executes every registered test file, calling `callback` for each tracker event.
    ///
    /// Returns once every suite has finished and its report has been finalized.
    pub fn execute<F>(self, mut callback: F) -> RunReport
    where
        F: FnMut(&TrackerEvent),
    {
        let Self {
            inner,
            parallel,
            runtime,
        } = self;

        let report = runtime.block_on(inner.execute(parallel, &mut callback));

        // Abandoned unit tasks may still be running; don't wait for them.
        runtime.shutdown_background();
        report
    }
}

#[derive(Debug)]
struct RunnerShared {
    // Popped from the back, so this holds the entries in reverse registration order.
    queue: Mutex<Vec<TestSuiteEntry>>,
    registry: SuiteRegistry,
    tracker: ProgressTracker,
    options: TestRunnerOptions,
    settings: RunSettings,
    file_pattern: Option<Regex>,
    multiprocessing: Option<Multiprocessing>,
}

impl RunnerShared {
    async fn execute(
        self: Arc<Self>,
        parallel: usize,
        callback: &mut dyn FnMut(&TrackerEvent),
    ) -> RunReport {
        let start = stopwatch();
        let mut events = self.tracker.subscribe();

        {
            let mut queue = lock(&self.queue);
            queue.extend(self.registry.entries().into_iter().rev());
            debug!(files = queue.len(), parallel, "starting run");
        }

        let mut slots = JoinSet::new();
        for id in 0..parallel {
            slots.spawn(RunnerSlot::new(id, self.clone()).run());
        }

        let mut aggregator = ReportAggregator::default();
        let mut success = true;
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    callback(&event);
                    aggregator.record(event);
                }
                slot = slots.join_next() => match slot {
                    Some(Ok(slot_success)) => success &= slot_success,
                    Some(Err(join_error)) => {
                        error!("runner slot panicked: {join_error}");
                        success = false;
                    }
                    None => break,
                },
            }
        }

        let flush_errors = match self.tracker.flush().await {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };
        while let Ok(event) = events.try_recv() {
            callback(&event);
            aggregator.record(event);
        }

        if let Some(multiprocessing) = &self.multiprocessing {
            multiprocessing.close_all().await;
        }

        let end = start.snapshot();
        aggregator.finish(end.start_time, end.duration, success, flush_errors)
    }

    fn next_entry(&self) -> Option<TestSuiteEntry> {
        lock(&self.queue).pop()
    }
}

/// One of the runner instances pulling test files off the shared queue.
struct RunnerSlot {
    id: SlotId,
    shared: Arc<RunnerShared>,
    worker_api: Option<Arc<WorkerApi>>,
}

impl RunnerSlot {
    fn new(id: SlotId, shared: Arc<RunnerShared>) -> Self {
        let worker_api = shared
            .multiprocessing
            .as_ref()
            .map(|_| Arc::new(WorkerApi::new(shared.tracker.clone())));
        Self {
            id,
            shared,
            worker_api,
        }
    }

    /// Processes test files until the queue is empty. Returns false if anything failed.
    async fn run(self) -> bool {
        let mut success = true;
        while let Some(entry) = self.shared.next_entry() {
            success &= self.next_suite(entry).await;
        }

        if let Some(multiprocessing) = &self.shared.multiprocessing {
            multiprocessing.terminate_worker(self.id).await;
        }
        debug!(slot = self.id, success, "runner slot done");
        success
    }

    async fn next_suite(&self, entry: TestSuiteEntry) -> bool {
        let tracker = &self.shared.tracker;
        let handle = tracker.create_suite_tracker(SuiteMeta {
            filepath: entry.test_file.clone(),
            map_file: entry.map_file.clone(),
        });

        if let Some(pattern) = &self.shared.file_pattern {
            if !pattern.is_match(entry.test_file.as_str()) {
                debug!(test_file = %entry.test_file, "skipping test file");
                tracker.suite_progress(handle, SuiteProgress::skipped());
                tracker.finish(handle, None);
                return true;
            }
        }

        let result = match &self.worker_api {
            Some(api) => self.run_in_worker(api, handle, entry).await,
            None => self.run_in_process(handle, &entry).await,
        };

        match result {
            Ok(passed) => passed,
            Err(error) => {
                // Gest errors have already been reported and finished by whoever raised them.
                if !error.is_gest_error() {
                    tracker.suite_progress(
                        handle,
                        SuiteProgress::error(None, ProgressError::new(ErrorOrigin::Test, error)),
                    );
                    tracker.finish(handle, None);
                }
                false
            }
        }
    }

    async fn run_in_process(
        &self,
        handle: SuiteHandle,
        entry: &TestSuiteEntry,
    ) -> Result<bool, TestError> {
        let tracker = &self.shared.tracker;
        let sink = tracker.sink(handle);
        let outcome = run_module(
            &self.shared.registry,
            &entry.test_file,
            &self.shared.settings,
            &sink,
            Arc::new(TracingLogSink),
        )
        .await?;

        match outcome {
            ModuleOutcome::Ran { passed, duration } => {
                tracker.finish(handle, Some(duration));
                Ok(passed)
            }
            ModuleOutcome::NotATest(error) => {
                tracker.finish(handle, None);
                Err(error)
            }
        }
    }

    async fn run_in_worker(
        &self,
        api: &Arc<WorkerApi>,
        handle: SuiteHandle,
        entry: TestSuiteEntry,
    ) -> Result<bool, TestError> {
        let Some(multiprocessing) = &self.shared.multiprocessing else {
            return Err(TestError::new("multiprocessing is not enabled"));
        };

        let message = HostMessage::RunSuite {
            entry,
            options: self.shared.options.clone(),
            default_timeout: self.shared.settings.default_timeout,
            after_all_policy: self.shared.settings.after_all_policy,
        };
        let result = multiprocessing
            .run_suite(self.id, api, handle, &message)
            .await;
        let failed = api.take_failed();
        result.map(|()| !failed)
    }
}
