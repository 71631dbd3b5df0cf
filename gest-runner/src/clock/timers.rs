// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{registry::run_callback, FakeTimerRegistry, TimerId};
use crate::{errors::TestError, helpers::lock, suite::SourceLocation};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::AbortHandle;
use tracing::warn;

/// Timer functions for test code, backed by either real tokio timers or a [`FakeTimerRegistry`].
///
/// Timers are routed by the mode in effect when they are scheduled. Real timers need a tokio
/// runtime.
///
/// Cloning is cheap, and all clones share state.
#[derive(Clone, Debug, Default)]
pub struct Timers {
    registry: FakeTimerRegistry,
    real: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl Timers {
    /// Creates a new set of timers with fake mode disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the underlying fake timer registry.
    pub fn registry(&self) -> &FakeTimerRegistry {
        &self.registry
    }

    /// Runs `callback` once after `delay`.
    #[track_caller]
    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> TimerId
    where
        F: Fn() -> Result<(), TestError> + Send + Sync + 'static,
    {
        if self.registry.is_enabled() {
            return self.registry.add_timeout(move |()| callback(), delay, ());
        }

        let location = SourceLocation::caller();
        let id = self.registry.next_id();
        let real = self.real.clone();
        self.spawn_real(id, async move {
            tokio::time::sleep(delay).await;
            lock(&real).remove(&id);
            run_callback(&location, callback);
        });
        id
    }

    /// Cancels a timeout. Unknown ids are ignored.
    pub fn clear_timeout(&self, id: TimerId) {
        self.registry.cancel_timeout(id);
        self.abort_real(id);
    }

    /// Runs `callback` every `period`.
    #[track_caller]
    pub fn set_interval<F>(&self, callback: F, period: Duration) -> TimerId
    where
        F: Fn() -> Result<(), TestError> + Send + Sync + 'static,
    {
        if self.registry.is_enabled() {
            return self.registry.add_interval(move |()| callback(), period, ());
        }

        let location = SourceLocation::caller();
        let id = self.registry.next_id();
        let period = period.max(Duration::from_millis(1));
        self.spawn_real(id, async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                run_callback(&location, &callback);
            }
        });
        id
    }

    /// Cancels an interval. Unknown ids are ignored.
    pub fn clear_interval(&self, id: TimerId) {
        self.registry.cancel_interval(id);
        self.abort_real(id);
    }

    /// Routes newly scheduled timers to the fake registry.
    pub fn enable(&self) {
        self.registry.enable();
    }

    /// Routes newly scheduled timers to real timers again, dropping every pending fake timer.
    pub fn disable(&self) {
        self.registry.disable();
    }

    /// Runs every pending fake timer once.
    pub fn run_all(&self) {
        self.registry.run_all();
    }

    /// Runs the earliest pending fake timer.
    pub fn run_next(&self) {
        self.registry.run_next(None);
    }

    /// Moves the fake clock forward, running every fake timer that comes due.
    pub fn advance(&self, by: Duration) {
        self.registry.advance_by(by);
    }

    /// With `None`, returns true if any fake timer is pending. With `Some(n)`, returns true if
    /// exactly `n` are.
    pub fn is_timeout_started(&self, times: Option<usize>) -> bool {
        let count = self.registry.count();
        match times {
            Some(times) => count == times,
            None => count > 0,
        }
    }

    fn spawn_real(&self, id: TimerId, task: impl std::future::Future<Output = ()> + Send + 'static) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut real = lock(&self.real);
                let task = handle.spawn(task);
                real.insert(id, task.abort_handle());
            }
            Err(_) => warn!(%id, "real timers need a tokio runtime, timer will never fire"),
        }
    }

    fn abort_real(&self, id: TimerId) {
        if let Some(task) = lock(&self.real).remove(&id) {
            task.abort();
        }
    }
}
