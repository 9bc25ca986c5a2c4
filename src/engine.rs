//! The timer-engine contract and a min-heap engine.
//!
//! The manager treats timer storage as an external collaborator: it asks the
//! engine what expired and when the next deadline is, and the engine hints
//! back when a freshly registered deadline is earlier than anything a sleeping
//! worker could know about (a *kick*). [`HeapTimerEngine`] is the shipped
//! implementation; tests substitute scripted engines through [`TimerEngine`].

use crate::exec::{ExecContext, TimerCallback};
use crate::types::Time;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Outcome of a single timer check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCheck {
    /// One or more timers expired; their callbacks were enqueued into the
    /// caller's [`ExecContext`].
    Fired,
    /// Nothing expired. `next_deadline` is the earliest pending deadline, or
    /// [`Time::INFINITE_FUTURE`] when no timer is registered.
    CheckedAndEmpty {
        /// The earliest future deadline known to the engine.
        next_deadline: Time,
    },
    /// Another thread holds the engine's check lock; back off. The caller
    /// must not trust any deadline it previously computed.
    NotChecked,
}

/// The timer storage the manager drives.
///
/// Implementations are invoked concurrently and must be internally
/// synchronised. Neither method may take the manager's coordinator lock.
pub trait TimerEngine: Send + Sync {
    /// Pops expired timers into `cx` or reports the next deadline.
    fn check_timers(&self, cx: &mut ExecContext) -> TimerCheck;

    /// Acknowledges a kick after the manager observed it, re-arming the
    /// engine's kick hint.
    fn consume_kick(&self);
}

struct TimerEntry {
    deadline: Time,
    seq: u64,
    callback: TimerCallback,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for min-heap (earliest deadline first); FIFO among equal
        // deadlines via the registration sequence.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

/// A min-heap timer engine.
///
/// Registration is cheap and concurrent; checking is serialised by a
/// dedicated lock taken with `try_lock`, so a worker that loses the race
/// reports [`TimerCheck::NotChecked`] instead of queueing up behind the
/// winner.
pub struct HeapTimerEngine {
    state: Mutex<HeapState>,
    check_lock: Mutex<()>,
    kick_pending: AtomicBool,
}

impl Default for HeapTimerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapTimerEngine {
    /// Creates an empty engine.
    ///
    /// The engine never reads a clock of its own; "now" comes from the
    /// checking thread's [`ExecContext`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            check_lock: Mutex::new(()),
            kick_pending: AtomicBool::new(false),
        }
    }

    /// Registers `callback` to run once `deadline` passes.
    ///
    /// Returns `true` when the caller should kick the manager: the new
    /// deadline is strictly earlier than every previously registered one and
    /// no kick is already in flight. Equal deadlines never kick (the
    /// incumbent timed waiter already covers them).
    pub fn register<F>(&self, deadline: Time, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let previous_min = {
            let mut state = self.state.lock().unwrap();
            let previous_min = state
                .heap
                .peek()
                .map_or(Time::INFINITE_FUTURE, |entry| entry.deadline);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(TimerEntry {
                deadline,
                seq,
                callback: Box::new(callback),
            });
            previous_min
        };
        deadline < previous_min && !self.kick_pending.swap(true, Ordering::AcqRel)
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    /// Returns the earliest pending deadline, or `INFINITE_FUTURE` when empty.
    #[must_use]
    pub fn next_deadline(&self) -> Time {
        self.state
            .lock()
            .unwrap()
            .heap
            .peek()
            .map_or(Time::INFINITE_FUTURE, |entry| entry.deadline)
    }

    /// Drops every pending timer without firing it.
    pub fn clear(&self) {
        self.state.lock().unwrap().heap.clear();
    }
}

impl TimerEngine for HeapTimerEngine {
    fn check_timers(&self, cx: &mut ExecContext) -> TimerCheck {
        let Ok(_checking) = self.check_lock.try_lock() else {
            return TimerCheck::NotChecked;
        };

        let now = cx.now();
        let mut state = self.state.lock().unwrap();
        let mut fired = 0;
        while let Some(entry) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = state.heap.pop() {
                cx.enqueue(entry.callback);
                fired += 1;
            }
        }
        if fired > 0 {
            return TimerCheck::Fired;
        }
        let next_deadline = state
            .heap
            .peek()
            .map_or(Time::INFINITE_FUTURE, |entry| entry.deadline);
        TimerCheck::CheckedAndEmpty { next_deadline }
    }

    fn consume_kick(&self) {
        self.kick_pending.store(false, Ordering::Release);
    }
}

impl fmt::Debug for HeapTimerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapTimerEngine")
            .field("pending", &self.pending_count())
            .field("next_deadline", &self.next_deadline())
            .field("kick_pending", &self.kick_pending.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::{Arc, Mutex as StdMutex};

    fn engine_with_clock() -> (HeapTimerEngine, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        (HeapTimerEngine::new(), clock)
    }

    fn context(clock: &Arc<VirtualClock>) -> ExecContext {
        ExecContext::new(clock.clone())
    }

    #[test]
    fn empty_engine_reports_infinite_next_deadline() {
        let (engine, clock) = engine_with_clock();
        let mut cx = context(&clock);
        assert_eq!(
            engine.check_timers(&mut cx),
            TimerCheck::CheckedAndEmpty {
                next_deadline: Time::INFINITE_FUTURE
            }
        );
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn unexpired_timer_reports_its_deadline() {
        let (engine, clock) = engine_with_clock();
        engine.register(Time::from_millis(100), || {});
        engine.register(Time::from_millis(40), || {});
        engine.register(Time::from_millis(70), || {});

        let mut cx = context(&clock);
        assert_eq!(
            engine.check_timers(&mut cx),
            TimerCheck::CheckedAndEmpty {
                next_deadline: Time::from_millis(40)
            }
        );
    }

    #[test]
    fn expired_timers_fire_into_the_context() {
        let (engine, clock) = engine_with_clock();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        for (label, millis) in [("late", 200), ("early", 50), ("mid", 100)] {
            let fired = fired.clone();
            engine.register(Time::from_millis(millis), move || {
                fired.lock().unwrap().push(label);
            });
        }

        clock.jump_to(Time::from_millis(120));
        let mut cx = context(&clock);
        assert_eq!(engine.check_timers(&mut cx), TimerCheck::Fired);
        assert_eq!(cx.flush(), 2);
        assert_eq!(*fired.lock().unwrap(), vec!["early", "mid"]);
        assert_eq!(engine.next_deadline(), Time::from_millis(200));
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let (engine, clock) = engine_with_clock();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let fired = fired.clone();
            engine.register(Time::from_millis(10), move || {
                fired.lock().unwrap().push(label);
            });
        }

        clock.jump_to(Time::from_millis(10));
        let mut cx = context(&clock);
        assert_eq!(engine.check_timers(&mut cx), TimerCheck::Fired);
        cx.flush();
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn register_kicks_only_for_strictly_earlier_deadlines() {
        let (engine, _clock) = engine_with_clock();
        assert!(engine.register(Time::from_millis(100), || {}));
        // Later and equal deadlines are already covered.
        assert!(!engine.register(Time::from_millis(200), || {}));
        assert!(!engine.register(Time::from_millis(100), || {}));
        // Earlier, but a kick is still in flight.
        assert!(!engine.register(Time::from_millis(50), || {}));

        engine.consume_kick();
        assert!(engine.register(Time::from_millis(10), || {}));
    }

    #[test]
    fn contended_check_reports_not_checked() {
        let (engine, clock) = engine_with_clock();
        engine.register(Time::from_millis(5), || {});
        clock.jump_to(Time::from_millis(10));

        let _held = engine.check_lock.lock().unwrap();
        let mut cx = context(&clock);
        assert_eq!(engine.check_timers(&mut cx), TimerCheck::NotChecked);
        // Nothing was popped while contended.
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn clear_drops_pending_timers() {
        let (engine, clock) = engine_with_clock();
        engine.register(Time::from_millis(5), || {});
        engine.register(Time::from_millis(15), || {});
        engine.clear();

        clock.jump_to(Time::from_millis(20));
        let mut cx = context(&clock);
        assert_eq!(
            engine.check_timers(&mut cx),
            TimerCheck::CheckedAndEmpty {
                next_deadline: Time::INFINITE_FUTURE
            }
        );
    }
}
