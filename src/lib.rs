//! Tickpool: a worker-pool timer manager.
//!
//! # Overview
//!
//! Tickpool drives a shared timer engine with a small pool of OS threads. At
//! any instant exactly one worker — the *timed waiter* — sleeps until the
//! earliest known deadline; the remaining workers park with no deadline and
//! stand by to absorb a burst of simultaneous expiries without blocking the
//! waiter.
//!
//! # Core Guarantees
//!
//! - **One timed waiter**: a generation counter serialises timed-waiter
//!   elections, so at most one thread ever sleeps keyed to the earliest
//!   deadline
//! - **No lost kicks**: an out-of-band kick from the timer engine is observed
//!   either before a worker parks or by the next worker to wake
//! - **Progress under bursts**: when the last idle waiter starts running
//!   expired callbacks, a replacement worker is spawned so the next deadline
//!   is never unattended
//! - **Lock discipline**: the timer engine is consulted and callbacks are
//!   flushed without the coordinator lock held; exited workers are joined by
//!   a surviving peer, never under a lock
//!
//! # Module Structure
//!
//! - [`types`]: the [`Time`](types::Time) monotonic timestamp
//! - [`clock`]: time sources (wall clock and virtual time for tests)
//! - [`exec`]: per-thread execution context buffering fired callbacks
//! - [`engine`]: the timer-engine contract and a min-heap implementation
//! - [`manager`]: the coordinator, worker loop, and wait protocol
//! - [`tracing_compat`]: structured logging facade (no-op unless the
//!   `tracing-integration` feature is enabled)
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickpool::{HeapTimerEngine, TimeSource, TimerManager, WallClock};
//!
//! let clock: Arc<WallClock> = Arc::new(WallClock::new());
//! let engine = Arc::new(HeapTimerEngine::new());
//! let manager = TimerManager::new(engine.clone(), clock.clone());
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let observer = fired.clone();
//! let deadline = clock.deadline_after(Duration::from_millis(5));
//! if engine.register(deadline, move || {
//!     observer.fetch_add(1, Ordering::SeqCst);
//! }) {
//!     manager.kick();
//! }
//!
//! while fired.load(Ordering::SeqCst) == 0 {
//!     std::thread::yield_now();
//! }
//! manager.shutdown();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod engine;
pub mod exec;
pub mod manager;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use clock::{TimeSource, VirtualClock, WallClock};
pub use engine::{HeapTimerEngine, TimerCheck, TimerEngine};
pub use exec::{ExecContext, TimerCallback};
pub use manager::{ManagerSnapshot, TimerManager, TimerManagerOptions};
pub use types::Time;
