// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::TestError,
    helpers::lock,
    suite::{panic_error, SourceLocation},
};
use derive_where::derive_where;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, error};

/// Identifies a timeout or interval. Timeouts and intervals share one id space.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type TimerCallback<A, R> = Arc<dyn Fn(A) -> Result<R, TestError> + Send + Sync>;

struct Entry<A, R> {
    id: TimerId,
    target: Duration,
    period: Option<Duration>,
    callback: TimerCallback<A, R>,
    args: A,
    location: SourceLocation,
}

struct RegistryState<A, R> {
    next_id: u64,
    // Sorted by target, stable on ties.
    entries: Vec<Entry<A, R>>,
    fake: bool,
    now: Duration,
    // The intervals currently firing, innermost last, and whether each was cancelled while firing.
    // Callbacks may fire other timers, so this nests.
    running: Vec<(TimerId, bool)>,
}

impl<A, R> RegistryState<A, R> {
    fn insert(&mut self, entry: Entry<A, R>) {
        let index = self.entries.partition_point(|e| e.target <= entry.target);
        self.entries.insert(index, entry);
    }
}

/// An ordered registry of fake timeouts and intervals, driven by a virtual clock.
///
/// `A` is the type of the arguments passed to callbacks, and `R` is the type callbacks return.
/// Callbacks are always invoked without any internal lock held, so they may freely add or cancel
/// timers. A callback that fails or panics is logged, and never stops the other pending timers
/// from firing.
///
/// Cloning a registry is cheap, and all clones share state.
#[derive_where(Clone)]
pub struct FakeTimerRegistry<A = (), R = ()> {
    origin: Instant,
    state: Arc<Mutex<RegistryState<A, R>>>,
}

impl<A, R> fmt::Debug for FakeTimerRegistry<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("FakeTimerRegistry")
            .field("fake", &state.fake)
            .field("now", &state.now)
            .field("pending", &state.entries.len())
            .finish()
    }
}

impl<A, R> Default for FakeTimerRegistry<A, R>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> FakeTimerRegistry<A, R>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Creates a new registry with fake mode disabled.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                entries: Vec::new(),
                fake: false,
                now: Duration::ZERO,
                running: Vec::new(),
            })),
        }
    }

    /// Returns the current time, measured from when the registry was created.
    ///
    /// While fake mode is enabled the time is frozen, and only moves through
    /// [`advance_by`](Self::advance_by).
    pub fn now(&self) -> Duration {
        let state = lock(&self.state);
        if state.fake {
            state.now
        } else {
            self.origin.elapsed()
        }
    }

    /// Returns true if fake mode is enabled.
    pub fn is_enabled(&self) -> bool {
        lock(&self.state).fake
    }

    /// Enables fake mode, freezing the clock at the current time.
    pub fn enable(&self) {
        let mut state = lock(&self.state);
        if !state.fake {
            state.fake = true;
            state.now = self.origin.elapsed();
        }
    }

    /// Disables fake mode, and drops every pending timer.
    pub fn disable(&self) {
        let mut state = lock(&self.state);
        state.fake = false;
        state.entries.clear();
    }

    /// Drops every pending timer.
    pub fn clear(&self) {
        lock(&self.state).entries.clear();
    }

    /// Returns the number of pending timeouts and intervals.
    pub fn count(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub(crate) fn next_id(&self) -> TimerId {
        let mut state = lock(&self.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Schedules `callback` to run once, `delay` from now.
    #[track_caller]
    pub fn add_timeout<F>(&self, callback: F, delay: Duration, args: A) -> TimerId
    where
        F: Fn(A) -> Result<R, TestError> + Send + Sync + 'static,
    {
        self.add(Arc::new(callback), delay, None, args, SourceLocation::caller())
    }

    /// Schedules `callback` to run every `period`, starting `period` from now.
    ///
    /// A zero period is treated as 1ms.
    #[track_caller]
    pub fn add_interval<F>(&self, callback: F, period: Duration, args: A) -> TimerId
    where
        F: Fn(A) -> Result<R, TestError> + Send + Sync + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        self.add(
            Arc::new(callback),
            period,
            Some(period),
            args,
            SourceLocation::caller(),
        )
    }

    fn add(
        &self,
        callback: TimerCallback<A, R>,
        delay: Duration,
        period: Option<Duration>,
        args: A,
        location: SourceLocation,
    ) -> TimerId {
        let id = self.next_id();
        let target = self.now() + delay;
        lock(&self.state).insert(Entry {
            id,
            target,
            period,
            callback,
            args,
            location,
        });
        id
    }

    /// Cancels a timeout. Unknown and already-fired ids are ignored.
    pub fn cancel_timeout(&self, id: TimerId) {
        self.cancel(id);
    }

    /// Cancels an interval. Unknown ids are ignored.
    ///
    /// An interval may cancel itself from its own callback.
    pub fn cancel_interval(&self, id: TimerId) {
        self.cancel(id);
    }

    fn cancel(&self, id: TimerId) {
        let mut state = lock(&self.state);
        state.entries.retain(|entry| entry.id != id);
        for (running, cancelled) in &mut state.running {
            if *running == id {
                *cancelled = true;
            }
        }
    }

    /// Runs the earliest pending timer, passing it `args` instead of its own arguments if given.
    ///
    /// Returns what the callback returned, or `None` if nothing was pending or the callback failed.
    pub fn run_next(&self, args: Option<A>) -> Option<R> {
        let entry = {
            let mut state = lock(&self.state);
            if state.entries.is_empty() {
                return None;
            }
            state.entries.remove(0)
        };
        self.fire(entry, args)
    }

    /// Runs every timer that is pending right now, in order.
    ///
    /// Intervals are rescheduled as usual, but the rescheduled occurrences don't run as part of the
    /// same call.
    pub fn run_all(&self) {
        let batch: Vec<_> = lock(&self.state).entries.iter().map(|e| e.id).collect();
        for id in batch {
            let entry = {
                let mut state = lock(&self.state);
                // An earlier callback may have cancelled this one.
                let Some(index) = state.entries.iter().position(|e| e.id == id) else {
                    continue;
                };
                state.entries.remove(index)
            };
            self.fire(entry, None);
        }
    }

    /// Moves the virtual clock forward by `by`, running every timer that comes due, in order.
    ///
    /// The clock is set to each timer's target time just before it runs, so callbacks observe a
    /// non-decreasing time. An interval fires once per period that elapses.
    pub fn advance_by(&self, by: Duration) {
        let end = lock(&self.state).now + by;
        loop {
            let entry = {
                let mut state = lock(&self.state);
                match state.entries.first() {
                    Some(entry) if entry.target <= end => {
                        state.now = state.now.max(entry.target);
                        state.entries.remove(0)
                    }
                    _ => {
                        state.now = end;
                        break;
                    }
                }
            };
            self.fire(entry, None);
        }
    }

    fn fire(&self, entry: Entry<A, R>, args: Option<A>) -> Option<R> {
        if entry.period.is_some() {
            lock(&self.state).running.push((entry.id, false));
        }

        debug!(id = %entry.id, target = ?entry.target, "firing fake timer");
        let args = args.unwrap_or_else(|| entry.args.clone());
        let result = run_callback(&entry.location, || (entry.callback)(args));

        if let Some(period) = entry.period {
            let mut state = lock(&self.state);
            let cancelled = matches!(state.running.pop(), Some((_, true)));
            if !cancelled {
                state.insert(Entry {
                    target: entry.target + period,
                    ..entry
                });
            }
        }

        result
    }
}

/// Runs a timer callback, logging failures and panics.
pub(super) fn run_callback<R>(
    location: &SourceLocation,
    f: impl FnOnce() -> Result<R, TestError>,
) -> Option<R> {
    let error = match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(error)) => error,
        Err(payload) => panic_error(&*payload),
    };
    error.mark_handled();
    error!(
        "exception raised in a timer callback: {error}\n\
         the timer was scheduled at {location}"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{collection::vec, prelude::*};
    use test_strategy::proptest;

    type Recorder = Arc<Mutex<Vec<(u32, Duration)>>>;

    fn fake_registry() -> (FakeTimerRegistry, Recorder) {
        let registry = FakeTimerRegistry::new();
        registry.enable();
        (registry, Arc::default())
    }

    fn record(
        registry: &FakeTimerRegistry,
        fired: &Recorder,
        tag: u32,
    ) -> impl Fn(()) -> Result<(), TestError> + Send + Sync + 'static {
        let registry = registry.clone();
        let fired = fired.clone();
        move |()| {
            fired.lock().unwrap().push((tag, registry.now()));
            Ok(())
        }
    }

    fn tags(fired: &Recorder) -> Vec<u32> {
        fired.lock().unwrap().iter().map(|(tag, _)| *tag).collect()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn timeout_fires_once_target_is_reached() {
        let (registry, fired) = fake_registry();
        registry.add_timeout(record(&registry, &fired, 1), ms(100), ());

        registry.advance_by(ms(40));
        assert!(tags(&fired).is_empty());
        registry.advance_by(ms(60));
        assert_eq!(tags(&fired), [1]);
        registry.advance_by(ms(1000));
        assert_eq!(tags(&fired), [1], "timeouts fire once");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn interval_fires_every_period() {
        let (registry, fired) = fake_registry();
        let start = registry.now();
        registry.add_interval(record(&registry, &fired, 1), ms(100), ());

        registry.advance_by(ms(1000));

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 10);
        for (i, (_, at)) in fired.iter().enumerate() {
            assert_eq!(*at - start, ms(100) * (i as u32 + 1));
        }
        assert_eq!(registry.count(), 1, "interval stays scheduled");
    }

    #[test]
    fn advance_fires_in_target_order() {
        let (registry, fired) = fake_registry();
        for delay in [70, 20, 100, 50] {
            registry.add_timeout(record(&registry, &fired, delay), ms(u64::from(delay)), ());
        }

        registry.advance_by(ms(25));
        assert_eq!(tags(&fired), [20]);
        registry.advance_by(ms(75));
        assert_eq!(tags(&fired), [20, 50, 70, 100]);
    }

    #[test]
    fn run_all_runs_one_batch() {
        let (registry, fired) = fake_registry();
        registry.add_interval(record(&registry, &fired, 1), ms(10), ());
        registry.add_timeout(record(&registry, &fired, 2), ms(5), ());

        registry.run_all();
        assert_eq!(tags(&fired), [2, 1]);
        assert_eq!(registry.count(), 1, "the interval was rescheduled but not rerun");
    }

    #[test]
    fn run_next_returns_callback_value() {
        let registry = FakeTimerRegistry::<u32, u32>::new();
        registry.enable();
        registry.add_timeout(|n| Ok(n * 2), ms(10), 21);
        registry.add_timeout(|n| Ok(n + 1), ms(20), 1);

        assert_eq!(registry.run_next(None), Some(42));
        assert_eq!(registry.run_next(Some(9)), Some(10), "explicit args win");
        assert_eq!(registry.run_next(None), None);
    }

    #[test]
    fn failing_callbacks_do_not_stop_the_drain() {
        let (registry, fired) = fake_registry();
        registry.add_timeout(|()| Err(TestError::new("boom")), ms(1), ());
        registry.add_timeout(
            |()| {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            },
            ms(2),
            (),
        );
        registry.add_timeout(record(&registry, &fired, 3), ms(3), ());

        registry.advance_by(ms(10));
        assert_eq!(tags(&fired), [3]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (registry, fired) = fake_registry();
        let id = registry.add_timeout(record(&registry, &fired, 1), ms(10), ());
        registry.cancel_timeout(id);
        registry.cancel_timeout(id);
        registry.cancel_interval(TimerId(12345));

        registry.advance_by(ms(100));
        assert!(tags(&fired).is_empty());
    }

    #[test]
    fn interval_cancels_itself() {
        let registry = FakeTimerRegistry::<(), ()>::new();
        registry.enable();
        let fired = Arc::new(Mutex::new(0));
        let id = Arc::new(Mutex::new(None));

        let id2 = id.clone();
        let fired2 = fired.clone();
        let registry2 = registry.clone();
        let interval = registry.add_interval(
            move |()| {
                let mut fired = fired2.lock().unwrap();
                *fired += 1;
                if *fired == 3 {
                    if let Some(id) = *id2.lock().unwrap() {
                        registry2.cancel_interval(id);
                    }
                }
                Ok(())
            },
            ms(10),
            (),
        );
        *id.lock().unwrap() = Some(interval);

        registry.advance_by(ms(100));
        assert_eq!(*fired.lock().unwrap(), 3);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn interval_cancels_itself_after_firing_another() {
        let registry = FakeTimerRegistry::<(), ()>::new();
        registry.enable();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let id = Arc::new(Mutex::new(None));

        let (id2, fired2, registry2) = (id.clone(), fired.clone(), registry.clone());
        let outer = registry.add_interval(
            move |()| {
                fired2.lock().unwrap().push("outer");
                // Fires the inner interval from within this callback.
                registry2.run_next(None);
                if let Some(id) = *id2.lock().unwrap() {
                    registry2.cancel_interval(id);
                }
                Ok(())
            },
            ms(10),
            (),
        );
        *id.lock().unwrap() = Some(outer);

        let fired3 = fired.clone();
        registry.add_interval(
            move |()| {
                fired3.lock().unwrap().push("inner");
                Ok(())
            },
            ms(15),
            (),
        );

        registry.run_next(None);
        assert_eq!(*fired.lock().unwrap(), ["outer", "inner"]);
        assert_eq!(registry.count(), 1, "only the inner interval is rescheduled");

        registry.advance_by(ms(100));
        assert!(
            !fired.lock().unwrap().iter().skip(2).any(|tag| *tag == "outer"),
            "the outer interval stays cancelled"
        );
    }

    #[test]
    fn zero_period_interval_terminates() {
        let (registry, fired) = fake_registry();
        registry.add_interval(record(&registry, &fired, 1), Duration::ZERO, ());
        registry.advance_by(ms(5));
        assert_eq!(tags(&fired).len(), 5);
    }

    #[test]
    fn disable_clears_and_unfreezes() {
        let (registry, fired) = fake_registry();
        registry.add_timeout(record(&registry, &fired, 1), ms(10), ());
        assert!(registry.is_enabled());

        registry.disable();
        assert_eq!(registry.count(), 0);
        assert!(!registry.is_enabled());
    }

    #[proptest(cases = 64)]
    fn advance_fires_sorted_and_stable(#[strategy(vec(0u64..200, 1..24))] delays: Vec<u64>) {
        let (registry, fired) = fake_registry();
        for (tag, delay) in delays.iter().enumerate() {
            registry.add_timeout(record(&registry, &fired, tag as u32), ms(*delay), ());
        }

        registry.advance_by(ms(200));

        let mut expected: Vec<_> = (0..delays.len() as u32).collect();
        expected.sort_by_key(|tag| delays[*tag as usize]);
        prop_assert_eq!(tags(&fired), expected);
        prop_assert_eq!(registry.count(), 0);
    }

    #[proptest(cases = 64)]
    fn split_advances_match_one_advance(
        #[strategy(1u64..50)] period: u64,
        #[strategy(vec(0u64..100, 1..8))] steps: Vec<u64>,
    ) {
        let (registry, fired) = fake_registry();
        registry.add_interval(record(&registry, &fired, 0), ms(period), ());
        for step in &steps {
            registry.advance_by(ms(*step));
        }

        let total: u64 = steps.iter().sum();
        let fired = fired.lock().unwrap();
        prop_assert_eq!(fired.len() as u64, total / period);
        prop_assert!(fired.windows(2).all(|w| w[0].1 <= w[1].1));
    }
}
