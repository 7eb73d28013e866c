//! Clocks and cancellable timers.
//!
//! Everything time-dependent in the outline (boundary markers, autosave
//! debounce, dedup windows, retention) reads time through [`Clock`] and
//! defers work through [`Scheduler`]. Production uses [`SystemClock`] and
//! [`TokioScheduler`]; tests drive a [`ManualClock`], which implements both
//! and fires timers only when advanced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Source of wall-clock time in Unix millis.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Deferred callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
pub trait Scheduler: Send + Sync {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;
}

pub type SharedClock = Arc<dyn Clock>;
pub type SharedScheduler = Arc<dyn Scheduler>;

/// Handle to a scheduled task. Cancelling after the task ran is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        planloom_types::now_millis()
    }
}

/// Scheduler backed by `tokio::time::sleep` on a runtime handle.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the current runtime, if called from inside one.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let timer = TimerHandle::new();
        let guard = timer.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !guard.is_cancelled() {
                task();
            }
        });
        timer
    }
}

struct PendingTimer {
    deadline: u64,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

struct ManualState {
    now: u64,
    next_seq: u64,
    timers: Vec<PendingTimer>,
}

/// Deterministic clock and scheduler for tests.
///
/// Time only moves on [`advance`](Self::advance), which fires due timers in
/// deadline order (ties in scheduling order) with the clock set to each
/// timer's deadline while it runs.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start_ms,
                next_seq: 0,
                timers: Vec::new(),
            }),
        }
    }

    /// Move time forward, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by.as_millis() as u64;
        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.seq))
                    .map(|(i, _)| i);
                match next {
                    Some(i) => {
                        let timer = state.timers.swap_remove(i);
                        state.now = state.now.max(timer.deadline);
                        timer
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };
            // Run outside the lock: tasks may schedule more timers.
            if !due.handle.is_cancelled() {
                (due.task)();
            }
        }
    }

    /// Timers scheduled and not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.state.lock().now
    }
}

impl Scheduler for ManualClock {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = state.now + delay.as_millis() as u64;
        state.timers.push(PendingTimer {
            deadline,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
