//! Clock sources feeding the timer manager.
//!
//! The manager never computes a deadline of its own; all it asks of a clock
//! is "now", so the next timed wait can be sized against an absolute
//! [`Time`]. Production code anchors on the process monotonic clock, tests
//! script time by hand.

use crate::types::Time;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic source of "now".
pub trait TimeSource: Send + Sync {
    /// The current instant.
    fn now(&self) -> Time;

    /// The instant `delay` from now, saturating at
    /// [`Time::INFINITE_FUTURE`].
    fn deadline_after(&self, delay: Duration) -> Time {
        self.now() + delay
    }
}

/// The process monotonic clock, anchored where the value was created.
///
/// [`Time::ZERO`] is the moment of construction; readings never go
/// backwards because `Instant` does not.
#[derive(Debug)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    /// Anchors a new clock at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.origin.elapsed().as_nanos();
        Time::from_nanos(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

/// A hand-driven clock for deterministic tests.
///
/// Readings return whatever the test last scripted; nothing moves on its
/// own.
#[derive(Debug, Default)]
pub struct VirtualClock {
    nanos: AtomicU64,
}

impl VirtualClock {
    /// A virtual clock sitting at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let delta_nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(delta_nanos, Ordering::AcqRel);
    }

    /// Moves the clock forward to `target`; already past it, stays put.
    pub fn advance_to(&self, target: Time) {
        self.nanos.fetch_max(target.as_nanos(), Ordering::AcqRel);
    }

    /// Points the clock at `target`, forwards or backwards.
    pub fn jump_to(&self, target: Time) {
        self.nanos.store(target.as_nanos(), Ordering::Release);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}
