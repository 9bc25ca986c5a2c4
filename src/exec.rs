//! Per-thread execution context for fired timer callbacks.
//!
//! When the timer engine reports expired timers it does not run them; it
//! enqueues their callbacks into the calling thread's [`ExecContext`]. The
//! worker then flushes the context *after* releasing the coordinator lock, so
//! callbacks are free to register new timers (and trigger kicks) without any
//! lock-ordering hazards.

use crate::clock::TimeSource;
use crate::types::Time;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A fired timer's work, run exactly once during a flush.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// A per-thread buffer of fired callbacks with a cached monotonic "now".
///
/// The cache means one clock read per worker cycle no matter how many timers
/// are compared against it; the worker invalidates it at the top of every
/// cycle.
pub struct ExecContext {
    queue: VecDeque<TimerCallback>,
    cached_now: Option<Time>,
    clock: Arc<dyn TimeSource>,
    internal_thread: bool,
}

impl ExecContext {
    /// Creates a context for an application thread (`tick`-style drives).
    #[must_use]
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            queue: VecDeque::new(),
            cached_now: None,
            clock,
            internal_thread: false,
        }
    }

    /// Creates a context for a pool worker thread.
    #[must_use]
    pub fn internal(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            internal_thread: true,
            ..Self::new(clock)
        }
    }

    /// Returns true when this context belongs to a pool worker.
    #[must_use]
    pub fn is_internal_thread(&self) -> bool {
        self.internal_thread
    }

    /// Buffers a fired callback for the next [`flush`](Self::flush).
    pub fn enqueue(&mut self, callback: TimerCallback) {
        self.queue.push_back(callback);
    }

    /// Returns the number of callbacks awaiting a flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Runs every buffered callback to completion, in enqueue order.
    ///
    /// Returns how many callbacks ran. Must not be called with the
    /// coordinator lock held.
    pub fn flush(&mut self) -> usize {
        let mut ran = 0;
        while let Some(callback) = self.queue.pop_front() {
            callback();
            ran += 1;
        }
        ran
    }

    /// Returns the current time, reading the clock at most once per cycle.
    pub fn now(&mut self) -> Time {
        if let Some(now) = self.cached_now {
            now
        } else {
            let now = self.clock.now();
            self.cached_now = Some(now);
            now
        }
    }

    /// Drops the cached "now" so the next [`now`](Self::now) re-reads the clock.
    pub fn invalidate_now(&mut self) {
        self.cached_now = None;
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("pending", &self.queue.len())
            .field("cached_now", &self.cached_now)
            .field("internal_thread", &self.internal_thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> ExecContext {
        ExecContext::new(Arc::new(VirtualClock::new()))
    }

    #[test]
    fn flush_runs_in_enqueue_order() {
        let mut cx = context();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            cx.enqueue(Box::new(move || order.lock().unwrap().push(label)));
        }

        assert_eq!(cx.pending(), 3);
        assert_eq!(cx.flush(), 3);
        assert_eq!(cx.pending(), 0);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn flush_on_empty_is_a_noop() {
        let mut cx = context();
        assert_eq!(cx.flush(), 0);
    }

    #[test]
    fn callbacks_run_exactly_once() {
        let mut cx = context();
        let count = Arc::new(AtomicUsize::new(0));
        let observer = count.clone();
        cx.enqueue(Box::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        cx.flush();
        cx.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn now_is_cached_until_invalidated() {
        let clock = Arc::new(VirtualClock::new());
        let mut cx = ExecContext::new(clock.clone());

        assert_eq!(cx.now(), Time::ZERO);
        clock.advance(std::time::Duration::from_millis(1));
        assert_eq!(cx.now(), Time::ZERO);

        cx.invalidate_now();
        assert_eq!(cx.now(), Time::from_millis(1));
    }

    #[test]
    fn internal_flag() {
        let clock: Arc<VirtualClock> = Arc::new(VirtualClock::new());
        assert!(!ExecContext::new(clock.clone()).is_internal_thread());
        assert!(ExecContext::internal(clock).is_internal_thread());
    }
}
