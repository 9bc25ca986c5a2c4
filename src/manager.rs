//! The timer manager: a worker pool driving a shared timer engine.
//!
//! # Design
//!
//! Every worker runs the same cycle: probe the engine, then either run the
//! expired callbacks or sleep. The sleep side is where the coordination
//! lives — exactly one worker (the *timed waiter*) sleeps with a finite
//! deadline equal to the earliest pending timer; everyone else parks with no
//! deadline. A 64-bit generation counter identifies the current timed-waiter
//! epoch: a worker records the value at election and, on waking, knows it
//! still held the role iff the counter is unchanged.
//!
//! ## Kicks
//!
//! When the engine learns of a deadline earlier than anything a sleeping
//! worker could know, it asks for a [`kick`](TimerManager::kick). A kick
//! invalidates the incumbent timed waiter (by bumping the generation),
//! latches a `kicked` flag, and signals one waiter; the flag guarantees the
//! next waking worker re-probes the engine rather than trusting a stale
//! deadline, and it is observed even by a worker that had not parked yet.
//!
//! ## Pool growth
//!
//! When the last idle waiter starts running callbacks, a replacement worker
//! is spawned before the callbacks run, so the next deadline is never
//! unattended. A burst of simultaneous expiries can therefore grow the pool;
//! it only shrinks when threading stops.
//!
//! ## Worker reaping
//!
//! A thread cannot join itself, so an exiting worker deposits its
//! `ThreadId` on a concurrent queue and any surviving worker (or the
//! stopping thread) later detaches the matching handle and joins it —
//! always without the coordinator lock held. A panicking timer callback
//! still deposits its worker for joining before the panic resumes.

use crate::clock::TimeSource;
use crate::engine::{TimerCheck, TimerEngine};
use crate::exec::ExecContext;
use crate::tracing_compat::{debug, trace};
use crate::types::Time;
use crossbeam_queue::SegQueue;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

/// Configuration for a [`TimerManager`].
#[derive(Debug, Clone)]
pub struct TimerManagerOptions {
    /// Spawn the first worker at construction. Defaults to `true`; with
    /// `false` the pool stays empty until
    /// [`set_threading(true)`](TimerManager::set_threading) and timers only
    /// fire through [`tick`](TimerManager::tick).
    pub start_threaded: bool,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for TimerManagerOptions {
    fn default() -> Self {
        Self {
            start_threaded: true,
            thread_name_prefix: "tickpool".to_string(),
        }
    }
}

/// A consistent view of the coordinator counters, taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSnapshot {
    /// Whether the pool is running.
    pub threaded: bool,
    /// Live workers (spawned and not yet cleaned up).
    pub thread_count: usize,
    /// Workers currently idle or sleeping (not running callbacks).
    pub waiter_count: usize,
    /// Whether some worker sleeps with a finite deadline.
    pub has_timed_waiter: bool,
    /// Timed-waiter wakeups in the current threaded session.
    pub wakeups: u64,
}

struct ManagerState {
    threaded: bool,
    thread_count: usize,
    waiter_count: usize,
    has_timed_waiter: bool,
    timed_waiter_deadline: Time,
    timed_waiter_generation: u64,
    kicked: bool,
    wakeups: u64,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            threaded: false,
            thread_count: 0,
            waiter_count: 0,
            has_timed_waiter: false,
            timed_waiter_deadline: Time::INFINITE_FUTURE,
            timed_waiter_generation: 0,
            kicked: false,
            wakeups: 0,
        }
    }
}

struct ManagerShared {
    engine: Arc<dyn TimerEngine>,
    clock: Arc<dyn TimeSource>,
    state: Mutex<ManagerState>,
    /// Wakes waiters: one at a time for kicks and untimed-waiter nudges,
    /// everyone on stop.
    wait_cv: Condvar,
    /// Wakes the stopping thread as workers drain.
    shutdown_cv: Condvar,
    /// ThreadIds deposited by exited workers, awaiting a join by a peer.
    completed: SegQueue<ThreadId>,
    /// Join handles of live workers, keyed by thread id. The lock is held
    /// across the spawn so a fast-exiting worker cannot race its own
    /// registration.
    live: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
    next_worker_id: AtomicU64,
    thread_name_prefix: String,
}

/// A pool of worker threads collectively driving a [`TimerEngine`].
///
/// The manager owns no timers. It arranges for exactly one worker to sleep
/// until the engine's next deadline, runs whatever the engine reports as
/// expired, and grows the pool when a burst would otherwise leave the next
/// deadline unattended.
///
/// Dropping the manager stops the pool and joins every worker.
pub struct TimerManager {
    shared: Arc<ManagerShared>,
}

impl TimerManager {
    /// Creates a manager with default [`TimerManagerOptions`], spawning the
    /// first worker immediately.
    #[must_use]
    pub fn new(engine: Arc<dyn TimerEngine>, clock: Arc<dyn TimeSource>) -> Self {
        Self::with_options(engine, clock, TimerManagerOptions::default())
    }

    /// Creates a manager with the given options.
    #[must_use]
    pub fn with_options(
        engine: Arc<dyn TimerEngine>,
        clock: Arc<dyn TimeSource>,
        options: TimerManagerOptions,
    ) -> Self {
        let shared = Arc::new(ManagerShared {
            engine,
            clock,
            state: Mutex::new(ManagerState::new()),
            wait_cv: Condvar::new(),
            shutdown_cv: Condvar::new(),
            completed: SegQueue::new(),
            live: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(0),
            thread_name_prefix: options.thread_name_prefix,
        });
        let manager = Self { shared };
        if options.start_threaded {
            manager.start_threads();
        }
        manager
    }

    /// Starts or stops the pool. Idempotent in both directions.
    ///
    /// Stopping blocks until every worker has exited and been joined, and
    /// resets the [`wakeups`](Self::wakeups_testonly) counter; a pending
    /// timer does not delay the stop (the engine keeps it).
    pub fn set_threading(&self, enabled: bool) {
        if enabled {
            self.start_threads();
        } else {
            self.stop_threads();
        }
    }

    /// Interrupts the timed waiter because an earlier deadline exists.
    ///
    /// Invalidates the current timed-waiter deadline, latches the kick so the
    /// next waking worker re-probes the engine, and releases exactly one
    /// waiter.
    pub fn kick(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.kicked = true;
        state.has_timed_waiter = false;
        state.timed_waiter_deadline = Time::INFINITE_FUTURE;
        state.timed_waiter_generation += 1;
        self.shared.wait_cv.notify_one();
    }

    /// Drives the engine once from the calling thread.
    ///
    /// Checks timers with a fresh execution context and runs whatever fired.
    /// Safe alongside a running pool: the engine serialises checking
    /// internally and the coordinator is never touched.
    pub fn tick(&self) {
        let mut cx = ExecContext::new(Arc::clone(&self.shared.clock));
        let _ = self.shared.engine.check_timers(&mut cx);
        cx.flush();
    }

    /// Stops the pool and joins every worker.
    ///
    /// Consuming `self` makes a second shutdown unrepresentable; dropping an
    /// un-shutdown manager performs the same stop.
    pub fn shutdown(self) {
        self.stop_threads();
    }

    /// Whether the pool is currently running.
    #[must_use]
    pub fn is_threaded(&self) -> bool {
        self.shared.state.lock().unwrap().threaded
    }

    /// Number of live workers.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().unwrap().thread_count
    }

    /// Number of workers currently idle or sleeping.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.shared.state.lock().unwrap().waiter_count
    }

    /// Timed-waiter wakeups in the current threaded session.
    ///
    /// Reset to zero on every stop so a test measures a single session.
    #[must_use]
    pub fn wakeups_testonly(&self) -> u64 {
        self.shared.state.lock().unwrap().wakeups
    }

    /// Takes a consistent snapshot of the coordinator counters.
    #[must_use]
    pub fn snapshot(&self) -> ManagerSnapshot {
        let state = self.shared.state.lock().unwrap();
        ManagerSnapshot {
            threaded: state.threaded,
            thread_count: state.thread_count,
            waiter_count: state.waiter_count,
            has_timed_waiter: state.has_timed_waiter,
            wakeups: state.wakeups,
        }
    }

    fn start_threads(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.threaded {
            return;
        }
        state.threaded = true;
        spawn_worker(&self.shared, state);
    }

    fn stop_threads(&self) {
        let mut state = self.shared.state.lock().unwrap();
        debug!(threaded = state.threaded, "stopping timer workers");
        if state.threaded {
            state.threaded = false;
            self.shared.wait_cv.notify_all();
            while state.thread_count > 0 {
                trace!(live = state.thread_count, "waiting for workers to drain");
                state = self.shared.shutdown_cv.wait(state).unwrap();
                drop(state);
                gc_completed(&self.shared);
                state = self.shared.state.lock().unwrap();
            }
        }
        // The counter is per threaded session.
        state.wakeups = 0;
        drop(state);
        join_all(&self.shared);
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TimerManager")
            .field("threaded", &snapshot.threaded)
            .field("thread_count", &snapshot.thread_count)
            .field("waiter_count", &snapshot.waiter_count)
            .field("has_timed_waiter", &snapshot.has_timed_waiter)
            .finish()
    }
}

/// Spawns one worker, consuming the coordinator guard.
///
/// Counters are bumped before the guard is released so the new worker is
/// accounted for by the time anyone else observes the state.
fn spawn_worker(shared: &Arc<ManagerShared>, mut state: MutexGuard<'_, ManagerState>) {
    assert!(state.threaded, "spawned a timer worker on a stopped pool");
    state.waiter_count += 1;
    state.thread_count += 1;
    drop(state);

    debug!("spawning timer worker");
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-timer-{worker_id}", shared.thread_name_prefix);
    let mut live = shared.live.lock().unwrap();
    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_main(&worker_shared))
        .expect("failed to spawn timer worker");
    live.push((handle.thread().id(), handle));
}

fn worker_main(shared: &Arc<ManagerShared>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| worker_loop(shared)));
    worker_cleanup(shared);
    if let Err(payload) = result {
        panic::resume_unwind(payload);
    }
}

fn worker_loop(shared: &Arc<ManagerShared>) {
    let mut cx = ExecContext::internal(Arc::clone(&shared.clock));
    loop {
        cx.invalidate_now();
        match shared.engine.check_timers(&mut cx) {
            TimerCheck::Fired => run_some_timers(shared, &mut cx),
            TimerCheck::NotChecked => {
                // Another worker just checked; it will take the timed sleep
                // itself or wake us, so sleeping without a deadline is safe.
                trace!("timers not checked, deferring to the checking worker");
                if !wait_until(shared, Time::INFINITE_FUTURE) {
                    return;
                }
            }
            TimerCheck::CheckedAndEmpty { next_deadline } => {
                if !wait_until(shared, next_deadline) {
                    return;
                }
            }
        }
    }
}

/// Runs the callbacks the engine just enqueued into `cx`.
///
/// The caller was a waiter; while it runs callbacks it is not, and if it was
/// the last one a replacement is spawned so the next deadline stays covered.
fn run_some_timers(shared: &Arc<ManagerShared>, cx: &mut ExecContext) {
    let mut state = shared.state.lock().unwrap();
    assert!(state.waiter_count > 0, "timer runner was not a waiter");
    state.waiter_count -= 1;
    if state.waiter_count == 0 && state.threaded {
        // The pool grows until threading stops; a pile-up of simultaneous
        // expiries may transiently spawn many workers.
        spawn_worker(shared, state);
    } else {
        if !state.has_timed_waiter {
            // No one holds the next deadline while we run callbacks; wake
            // one untimed waiter to cover it.
            trace!("nudging an untimed waiter");
            shared.wait_cv.notify_one();
        }
        drop(state);
    }

    trace!("flushing fired timer callbacks");
    let flushed = panic::catch_unwind(AssertUnwindSafe(|| cx.flush()));

    gc_completed(shared);
    let mut state = shared.state.lock().unwrap();
    state.waiter_count += 1;
    drop(state);
    // A panicking callback must not corrupt the counters: the worker is back
    // to waiter status before the panic continues into cleanup.
    if let Err(payload) = flushed {
        panic::resume_unwind(payload);
    }
}

/// Sleeps until `next`, a kick, or shutdown.
///
/// Returns `false` when the worker should exit. With a finite `next` the
/// worker tries to become the timed waiter; a strictly earlier deadline
/// displaces the incumbent, an equal one does not.
fn wait_until(shared: &ManagerShared, mut next: Time) -> bool {
    let mut state = shared.state.lock().unwrap();
    if !state.threaded {
        return false;
    }

    // A kick that arrived before we parked means `next` may already be
    // stale; skip the sleep and re-probe the engine.
    if !state.kicked {
        // Sentinel that cannot match a live generation.
        let mut my_generation = state.timed_waiter_generation.wrapping_sub(1);
        if next != Time::INFINITE_FUTURE {
            if !state.has_timed_waiter || next < state.timed_waiter_deadline {
                state.timed_waiter_generation += 1;
                my_generation = state.timed_waiter_generation;
                state.has_timed_waiter = true;
                state.timed_waiter_deadline = next;
                trace!(deadline = %next, "sleeping until the next deadline");
            } else {
                // The incumbent already holds an earlier-or-equal deadline.
                next = Time::INFINITE_FUTURE;
            }
        }
        if next == Time::INFINITE_FUTURE {
            trace!("sleeping until kicked");
        }

        state = if next == Time::INFINITE_FUTURE {
            shared.wait_cv.wait(state).unwrap()
        } else {
            let timeout = next.saturating_duration_since(shared.clock.now());
            shared.wait_cv.wait_timeout(state, timeout).unwrap().0
        };

        let was_timed_waiter = my_generation == state.timed_waiter_generation;
        trace!(
            was_timed_waiter,
            kicked = state.kicked,
            "wait ended"
        );
        // Still the timed waiter: release the role before re-probing. A
        // replacement is elected on the next cycle if there is more to wait
        // for.
        if was_timed_waiter {
            state.wakeups += 1;
            state.has_timed_waiter = false;
            state.timed_waiter_deadline = Time::INFINITE_FUTURE;
        }
    }

    if state.kicked {
        // Acknowledge before sleeping again; the engine side is lock-free
        // and never takes the coordinator lock.
        shared.engine.consume_kick();
        state.kicked = false;
    }
    true
}

fn worker_cleanup(shared: &ManagerShared) {
    let mut state = shared.state.lock().unwrap();
    assert!(
        state.waiter_count > 0 && state.thread_count > 0,
        "timer worker exiting twice"
    );
    state.waiter_count -= 1;
    state.thread_count -= 1;
    if state.thread_count == 0 {
        shared.shutdown_cv.notify_one();
    }
    drop(state);
    // Deposit for a surviving peer; a thread cannot join itself.
    shared.completed.push(thread::current().id());
    debug!("timer worker exiting");
}

/// Joins workers that deposited themselves on the completed queue.
///
/// Must be called without the coordinator lock; handles are detached under
/// the registry lock and joined with no lock held.
fn gc_completed(shared: &ManagerShared) {
    let mut detached = Vec::new();
    {
        let mut live = shared.live.lock().unwrap();
        while let Some(id) = shared.completed.pop() {
            if let Some(position) = live.iter().position(|(thread_id, _)| *thread_id == id) {
                detached.push(live.swap_remove(position).1);
            }
        }
    }
    for handle in detached {
        let _ = handle.join();
    }
}

/// Joins every remaining worker after the pool has drained.
///
/// The completed queue is drained last: once every handle is joined, all
/// deposits have landed, so the queue is left empty.
fn join_all(shared: &ManagerShared) {
    let handles: Vec<JoinHandle<()>> = {
        let mut live = shared.live.lock().unwrap();
        live.drain(..).map(|(_, handle)| handle).collect()
    };
    for handle in handles {
        let _ = handle.join();
    }
    while shared.completed.pop().is_some() {}
}
