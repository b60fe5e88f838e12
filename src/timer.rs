//! One-shot timers tied to the connection's event loop.
//!
//! The controller arms at most one timer per request. Disarming is best
//! effort: a cancel that loses the race with an already-firing callback
//! reports `false`, and the caller must treat that as "too late, the
//! callback will run or has run".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// One-shot callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled one-shot timer.
///
/// The fire/disarm race is decided by a single atomic claim: whichever side
/// swaps the flag first owns the timer. A callback that loses the claim
/// never runs; a disarm that loses the claim returns `false`.
pub struct TimerHandle {
    claimed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Create a handle with no backing task (used by timer implementations
    /// that drive callbacks themselves, e.g. test clocks).
    pub fn new(claimed: Arc<AtomicBool>) -> Self {
        Self {
            claimed,
            task: None,
        }
    }

    /// Create a handle backed by a spawned task that can be aborted.
    pub fn with_task(claimed: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            claimed,
            task: Some(task),
        }
    }

    /// Disarm the timer. Returns `true` if the callback was claimed before
    /// it fired and is guaranteed never to run; `false` if the timer
    /// already fired (or began firing).
    pub fn disarm(self) -> bool {
        let won = !self.claimed.swap(true, Ordering::AcqRel);
        if won {
            if let Some(task) = self.task {
                task.abort();
            }
        }
        won
    }
}

/// Scheduler for one-shot callbacks on the event loop owning a connection.
///
/// Implementations must run the callback on the same logical executor that
/// drives the connection's I/O, so the callback needs no locking beyond
/// what the controller already holds for cross-thread resume/cancel.
pub trait EventLoopTimer: Send + Sync {
    /// Schedule `callback` to run once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a previously scheduled timer. Returns `false` if the timer
    /// already fired or was never armed by this scheduler.
    fn cancel(&self, handle: TimerHandle) -> bool {
        handle.disarm()
    }
}

/// Timer backed by the Tokio runtime driving the connection.
#[derive(Default)]
pub struct TokioTimer;

impl TokioTimer {
    pub fn new() -> Self {
        Self
    }
}

impl EventLoopTimer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let claimed = Arc::new(AtomicBool::new(false));
        let claim = Arc::clone(&claimed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim before running: a concurrent disarm that got here first
            // means the callback must not run.
            if !claim.swap(true, Ordering::AcqRel) {
                callback();
            }
        });
        TimerHandle::with_task(claimed, task)
    }
}
