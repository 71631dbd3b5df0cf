// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A virtual clock for test code.
//!
//! [`FakeTimerRegistry`] keeps timeouts and intervals in one queue ordered by target time, and
//! fires them as the virtual clock is moved forward. [`Timers`] is the surface test code uses: the
//! familiar `set_timeout`/`set_interval` functions, which go to real tokio timers until fake mode is
//! enabled.
//!
//! ```
//! use gest_runner::clock::Timers;
//! use std::{
//!     sync::{
//!         atomic::{AtomicBool, Ordering},
//!         Arc,
//!     },
//!     time::Duration,
//! };
//!
//! let timers = Timers::new();
//! timers.enable();
//!
//! let fired = Arc::new(AtomicBool::new(false));
//! let fired2 = fired.clone();
//! timers.set_timeout(
//!     move || {
//!         fired2.store(true, Ordering::SeqCst);
//!         Ok(())
//!     },
//!     Duration::from_secs(60),
//! );
//!
//! timers.advance(Duration::from_secs(59));
//! assert!(!fired.load(Ordering::SeqCst));
//! timers.advance(Duration::from_secs(1));
//! assert!(fired.load(Ordering::SeqCst));
//! ```

mod registry;
mod timers;

pub use registry::{FakeTimerRegistry, TimerId};
pub use timers::Timers;
