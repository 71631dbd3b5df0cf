// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    enrich::{FileLinkEnricher, FinishSnapshot, SourceEnricher},
    records::{
        ProgressError, SuiteFinishState, SuiteHandle, SuiteMeta, SuiteProgress, UnitFinishState,
        UnitProgress,
    },
};
use crate::{
    errors::{FlushError, FlushErrorKind},
    helpers::lock,
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

/// An event emitted by a [`ProgressTracker`] to its subscribers.
#[derive(Clone, Debug)]
pub enum TrackerEvent {
    /// A suite was registered. Sent before [`ProgressTracker::create_suite_tracker`] returns.
    SuiteAdded {
        /// The new suite.
        handle: SuiteHandle,

        /// Information about the test file.
        meta: SuiteMeta,
    },

    /// A suite finished. Sent exactly once per suite.
    Finished {
        /// The suite that finished.
        handle: SuiteHandle,

        /// The final state of the suite.
        suite: SuiteFinishState,

        /// The final states of every unit in the suite, in the order they were reported.
        units: Vec<UnitFinishState>,
    },
}

/// Receives unit and suite progress for a single suite.
///
/// The suite runner reports through this trait, so it doesn't need to know whether it's talking to
/// a [`ProgressTracker`] directly or to a host process over IPC.
pub trait ProgressSink: Send + Sync {
    /// Records the outcome of a unit.
    fn unit_progress(&self, record: UnitProgress);

    /// Records a suite-level event.
    fn suite_progress(&self, record: SuiteProgress);
}

/// Tracks the progress of every suite in a run.
///
/// Each suite has its own append-only accumulator, so runner slots reporting on different suites
/// never contend on the same state. Cloning a tracker is cheap, and all clones share state.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    cwd: Utf8PathBuf,
    enricher: DebugIgnore<Arc<dyn SourceEnricher>>,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    suites: HashMap<SuiteHandle, Arc<Mutex<SuiteAccumulator>>>,
    subscribers: Vec<mpsc::UnboundedSender<TrackerEvent>>,
    pending: Vec<JoinHandle<Result<(), FlushError>>>,
}

#[derive(Debug)]
struct SuiteAccumulator {
    meta: SuiteMeta,
    units: Vec<UnitProgress>,
    errors: Vec<ProgressError>,
    skipped: bool,
    finished: bool,
}

impl ProgressTracker {
    /// Creates a new tracker that resolves links with the default [`FileLinkEnricher`].
    ///
    /// Test file paths are displayed relative to `cwd`.
    pub fn new(cwd: impl Into<Utf8PathBuf>) -> Self {
        Self::with_enricher(cwd, Arc::new(FileLinkEnricher))
    }

    /// Creates a new tracker with a custom enricher.
    pub fn with_enricher(cwd: impl Into<Utf8PathBuf>, enricher: Arc<dyn SourceEnricher>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                cwd: cwd.into(),
                enricher: DebugIgnore(enricher),
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Subscribes to tracker events.
    ///
    /// Only events emitted after this call are received.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrackerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.state).subscribers.push(sender);
        receiver
    }

    /// Registers a new suite, returning its handle.
    pub fn create_suite_tracker(&self, meta: SuiteMeta) -> SuiteHandle {
        let handle = SuiteHandle::new_v4();
        let accumulator = SuiteAccumulator {
            meta: meta.clone(),
            units: Vec::new(),
            errors: Vec::new(),
            skipped: false,
            finished: false,
        };

        let mut state = lock(&self.inner.state);
        state
            .suites
            .insert(handle, Arc::new(Mutex::new(accumulator)));
        debug!(%handle, filepath = %meta.filepath, "suite added");
        state.emit(TrackerEvent::SuiteAdded { handle, meta });
        handle
    }

    /// Returns a [`ProgressSink`] that reports into the given suite.
    pub fn sink(&self, handle: SuiteHandle) -> SuiteTracker {
        SuiteTracker {
            tracker: self.clone(),
            handle,
        }
    }

    /// Records the outcome of a unit in a suite.
    pub fn unit_progress(&self, handle: SuiteHandle, record: UnitProgress) {
        self.update(handle, |acc| acc.units.push(record));
    }

    /// Records a suite-level event.
    pub fn suite_progress(&self, handle: SuiteHandle, record: SuiteProgress) {
        self.update(handle, |acc| {
            // A suite stays skipped once any event marks it so.
            acc.skipped |= record.skipped;
            if let Some(error) = record.error {
                acc.errors.push(error);
            }
        });
    }

    fn update(&self, handle: SuiteHandle, f: impl FnOnce(&mut SuiteAccumulator)) {
        let Some(accumulator) = self.accumulator(handle) else {
            warn!(%handle, "progress update for an unknown suite was lost");
            return;
        };
        let mut acc = lock(&accumulator);
        if acc.finished {
            warn!(
                %handle,
                filepath = %acc.meta.filepath,
                "progress update arrived after the suite finished and was lost"
            );
            return;
        }
        f(&mut acc);
    }

    fn accumulator(&self, handle: SuiteHandle) -> Option<Arc<Mutex<SuiteAccumulator>>> {
        lock(&self.inner.state).suites.get(&handle).cloned()
    }

    /// Freezes a suite and emits its [`TrackerEvent::Finished`] event.
    ///
    /// Link resolution happens on a blocking thread, so the event is emitted asynchronously. Must be
    /// called from within a tokio runtime.
    pub fn finish(&self, handle: SuiteHandle, duration: Option<Duration>) {
        let Some(accumulator) = self.accumulator(handle) else {
            warn!(%handle, "finish called for an unknown suite");
            return;
        };

        let snapshot = {
            let mut acc = lock(&accumulator);
            if acc.finished {
                warn!(%handle, filepath = %acc.meta.filepath, "suite finished more than once");
                return;
            }
            acc.finished = true;
            FinishSnapshot {
                meta: acc.meta.clone(),
                duration: duration.unwrap_or_default(),
                units: acc.units.clone(),
                errors: acc.errors.clone(),
                skipped: acc.skipped,
            }
        };

        let tracker = self.clone();
        let task = tokio::spawn(async move { tracker.finalize(handle, snapshot).await });
        lock(&self.inner.state).pending.push(task);
    }

    async fn finalize(&self, handle: SuiteHandle, snapshot: FinishSnapshot) -> Result<(), FlushError> {
        let test_file = snapshot.meta.filepath.clone();
        let fallback = snapshot.clone();
        let cwd = self.inner.cwd.clone();
        let enricher = self.inner.enricher.0.clone();

        let rendered = tokio::task::spawn_blocking(move || {
            match enricher.load(&snapshot.meta) {
                Ok(resolver) => (snapshot.render(&cwd, Some(&*resolver)), None),
                Err(err) => (snapshot.render(&cwd, None), Some(FlushErrorKind::Enrich(err))),
            }
        })
        .await;

        let ((suite, units), error) = match rendered {
            Ok(rendered) => rendered,
            Err(join_error) => (
                fallback.render(&self.inner.cwd, None),
                Some(FlushErrorKind::Join(join_error)),
            ),
        };

        debug!(%handle, filepath = %suite.test_filepath, "suite finished");
        lock(&self.inner.state).emit(TrackerEvent::Finished {
            handle,
            suite,
            units,
        });

        match error {
            Some(err) => Err(FlushError::new(test_file, err)),
            None => Ok(()),
        }
    }

    /// Waits until every finished suite has emitted its [`TrackerEvent::Finished`] event.
    ///
    /// Returns the errors encountered while finalizing suites, if any. Every suite emits its event
    /// even if finalizing it failed.
    pub async fn flush(&self) -> Result<(), Vec<FlushError>> {
        let mut errors = Vec::new();
        loop {
            let pending = std::mem::take(&mut lock(&self.inner.state).pending);
            if pending.is_empty() {
                break;
            }
            for task in pending {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => errors.push(err),
                    // finalize itself doesn't panic, and its tasks are never aborted.
                    Err(join_error) => warn!("suite finalization task failed: {join_error}"),
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl TrackerState {
    fn emit(&mut self, event: TrackerEvent) {
        // Drop subscribers that have gone away.
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// A [`ProgressSink`] bound to one suite of a [`ProgressTracker`].
#[derive(Clone, Debug)]
pub struct SuiteTracker {
    tracker: ProgressTracker,
    handle: SuiteHandle,
}

impl SuiteTracker {
    /// Returns the suite's handle.
    pub fn handle(&self) -> SuiteHandle {
        self.handle
    }
}

impl ProgressSink for SuiteTracker {
    fn unit_progress(&self, record: UnitProgress) {
        self.tracker.unit_progress(self.handle, record);
    }

    fn suite_progress(&self, record: SuiteProgress) {
        self.tracker.suite_progress(self.handle, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TestError,
        progress::{ErrorOrigin, UnitStatus},
        suite::{SourceLocation, UnitRef},
    };
    use pretty_assertions::assert_eq;

    fn unit_ref(name: &str) -> UnitRef {
        UnitRef {
            name: name.to_owned(),
            location: SourceLocation::new("tests/a.rs", 1, 1),
        }
    }

    fn name(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn suite_added_is_sent_before_returning() {
        let tracker = ProgressTracker::new("/work");
        let mut events = tracker.subscribe();

        let handle = tracker.create_suite_tracker(SuiteMeta::new("/work/tests/a.rs"));
        match events.try_recv().expect("event was sent synchronously") {
            TrackerEvent::SuiteAdded { handle: added, meta } => {
                assert_eq!(added, handle);
                assert_eq!(meta.filepath.as_str(), "/work/tests/a.rs");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_is_emitted_exactly_once() {
        let tracker = ProgressTracker::new("/work");
        let mut events = tracker.subscribe();
        let handle = tracker.create_suite_tracker(SuiteMeta::new("/work/tests/a.rs"));

        tracker.unit_progress(
            handle,
            UnitProgress::passed(name(&["a", "one"]), Duration::from_micros(10), unit_ref("one")),
        );
        tracker.unit_progress(
            handle,
            UnitProgress::failed(
                name(&["a", "two"]),
                ProgressError::new(ErrorOrigin::Test, TestError::new("boom")),
                Vec::new(),
                unit_ref("two"),
            ),
        );
        tracker.unit_progress(handle, UnitProgress::skipped(name(&["a", "three"]), unit_ref("three")));

        tracker.finish(handle, Some(Duration::from_millis(5)));
        tracker.finish(handle, None);
        tracker.unit_progress(handle, UnitProgress::skipped(name(&["a", "late"]), unit_ref("late")));
        tracker.flush().await.expect("no finalization errors");

        let mut finished = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TrackerEvent::Finished { suite, units, .. } = event {
                finished.push((suite, units));
            }
        }
        assert_eq!(finished.len(), 1, "exactly one finished event");

        let (suite, units) = &finished[0];
        assert_eq!(suite.test_filepath, "./tests/a.rs");
        assert_eq!(suite.duration, Duration::from_millis(5));
        assert!(suite.errors.is_empty());
        let statuses: Vec<_> = units.iter().map(UnitFinishState::status).collect();
        assert_eq!(
            statuses,
            [UnitStatus::Passed, UnitStatus::Failed, UnitStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn suites_finish_in_any_order() {
        let tracker = ProgressTracker::new("/work");
        let mut events = tracker.subscribe();

        let handles: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|file| tracker.create_suite_tracker(SuiteMeta::new(format!("/work/{file}.rs"))))
            .collect();
        for handle in handles.iter().rev() {
            tracker.suite_progress(*handle, SuiteProgress::skipped());
            tracker.finish(*handle, None);
        }
        tracker.flush().await.expect("no finalization errors");

        let mut finished: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                TrackerEvent::Finished { handle, suite, .. } => Some((handle, suite.skipped)),
                TrackerEvent::SuiteAdded { .. } => None,
            })
            .collect();
        finished.sort_by_key(|(handle, _)| handles.iter().position(|h| h == handle));
        assert_eq!(
            finished,
            handles.iter().map(|h| (*h, true)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn skipped_is_sticky() {
        let tracker = ProgressTracker::new("/work");
        let mut events = tracker.subscribe();
        let handle = tracker.create_suite_tracker(SuiteMeta::new("/work/a.rs"));

        tracker.suite_progress(handle, SuiteProgress::skipped());
        tracker.suite_progress(
            handle,
            SuiteProgress::error(None, ProgressError::new(ErrorOrigin::Gest, TestError::Gest("x".into()))),
        );
        tracker.finish(handle, None);
        tracker.flush().await.unwrap();

        let suite = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|event| match event {
                TrackerEvent::Finished { suite, .. } => Some(suite),
                TrackerEvent::SuiteAdded { .. } => None,
            })
            .expect("suite finished");
        assert!(suite.skipped);
        assert_eq!(suite.errors.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_map_file_still_finishes() {
        let tracker = ProgressTracker::new("/work");
        let mut events = tracker.subscribe();

        let good = tracker.create_suite_tracker(SuiteMeta::new("/work/good.rs"));
        let bad = tracker.create_suite_tracker(SuiteMeta {
            filepath: "/work/bad.rs".into(),
            map_file: Some("/nonexistent/bad.map.json".into()),
        });
        tracker.finish(good, None);
        tracker.finish(bad, None);

        let errors = tracker.flush().await.expect_err("bad map file");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].test_file().as_str(), "/work/bad.rs");
        assert_eq!(
            errors[0].map_file().map(|f| f.as_str()),
            Some("/nonexistent/bad.map.json")
        );

        let finished = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| matches!(event, TrackerEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 2, "both suites emit a finished event");
    }
}
