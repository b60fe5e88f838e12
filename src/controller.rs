//! Per-request asynchronous response lifecycle state machine.
//!
//! One controller exists per request. Application code may suspend the
//! request, hand the returned [`ResponseHandle`] to a worker thread, and
//! resume or cancel later; the event loop may fire a timeout concurrently.
//! Among all candidate terminal transitions exactly one wins: the state
//! change, timer disarm, and sink take happen together under a single
//! per-request lock, so the losers observe a terminal state and no-op.
//! The flush itself runs outside the lock and the physical write is
//! marshalled back onto the connection-owning task by the sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use hyper::StatusCode;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::response::{HandlerError, ResponseSink, ResponseValue, RetryAfter};
use crate::timer::{EventLoopTimer, TimerHandle};

/// Lifecycle of a single request's response.
///
/// Transitions are monotonic: `Active -> Suspended -> {Completed,
/// Cancelled}`. Nothing leaves a terminal state. `Cancelled` is a
/// refinement of "done" used for diagnostics and response code selection;
/// a timeout-forced 503 counts as `Completed`, matching the distinction
/// `cancel()` relies on for its idempotency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Suspended,
    Completed,
    Cancelled,
}

impl LifecycleState {
    /// True for `Completed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Cancelled)
    }
}

/// User callback invoked when a suspension times out, before the forced
/// 503 fallback. May resume, cancel, or do nothing.
pub type TimeoutHandler = Box<dyn FnMut(&ResponseHandle) + Send>;

struct Inner {
    state: LifecycleState,
    /// Sticky: set by `suspend`, never reset.
    suspended: bool,
    /// Armed only while `state == Suspended`; disarmed as part of any
    /// terminal transition.
    timer_handle: Option<TimerHandle>,
    /// Taken exactly once, under the lock, by the winning transition.
    sink: Option<Box<dyn ResponseSink>>,
    timeout_handler: Option<TimeoutHandler>,
}

struct Shared {
    inner: Mutex<Inner>,
    timer: Arc<dyn EventLoopTimer>,
}

/// Controller owned by the connection for one request/response cycle.
pub struct AsyncResponseController {
    shared: Arc<Shared>,
}

/// Handle returned by [`AsyncResponseController::suspend`], through which
/// the request is later resumed or cancelled, possibly from another
/// thread. Cloneable; all clones share the same state machine.
#[derive(Clone)]
pub struct ResponseHandle {
    shared: Arc<Shared>,
}

impl AsyncResponseController {
    /// Create the controller for a new request. The sink is exclusively
    /// owned for the cycle and will be flushed exactly once.
    pub fn new(sink: Box<dyn ResponseSink>, timer: Arc<dyn EventLoopTimer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: LifecycleState::Active,
                    suspended: false,
                    timer_handle: None,
                    sink: Some(sink),
                    timeout_handler: None,
                }),
                timer,
            }),
        }
    }

    /// True once `suspend` has ever succeeded. Does not imply the request
    /// is still pending.
    pub fn is_suspended(&self) -> bool {
        self.shared.inner.lock().unwrap().suspended
    }

    /// Current lifecycle state (diagnostics).
    pub fn state(&self) -> LifecycleState {
        self.shared.inner.lock().unwrap().state
    }

    /// Suspend the request, optionally arming a timeout. Control returns
    /// to the event loop; the returned handle is used to complete the
    /// request later. Suspension is single-use: a second call is a caller
    /// contract violation, not a lost race.
    pub fn suspend(&self, timeout: Option<Duration>) -> Result<ResponseHandle, StateError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.suspended {
            return Err(StateError::AlreadySuspended);
        }
        inner.suspended = true;
        inner.state = LifecycleState::Suspended;
        if let Some(delay) = timeout {
            inner.timer_handle = Some(arm_timer(&self.shared, delay));
        }
        drop(inner);
        Ok(ResponseHandle {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Re-arm the suspension timeout; see [`ResponseHandle::set_timeout`].
    /// Returns `false` when the request was never suspended.
    pub fn set_timeout(&self, delay: Duration) -> bool {
        set_timeout(&self.shared, delay)
    }

    /// Finish a suspended request whose payload was already written
    /// through a lower-level path. No-op unless currently suspended.
    pub fn complete(&self) {
        complete(&self.shared);
    }
}

impl ResponseHandle {
    /// Complete the request with a computed value. Returns `false` without
    /// side effects if another completion already won.
    pub fn resume(&self, value: impl Into<ResponseValue>) -> bool {
        match finish(&self.shared, LifecycleState::Completed) {
            Some(sink) => {
                if let Err(error) = sink.flush_success(value.into()) {
                    warn!("response flush failed: {}", error);
                }
                true
            }
            None => {
                debug!("resume lost completion race; request already terminal");
                false
            }
        }
    }

    /// Complete the request with an error response. Same race semantics
    /// as [`resume`](Self::resume).
    pub fn resume_error(&self, error: HandlerError) -> bool {
        match finish(&self.shared, LifecycleState::Completed) {
            Some(sink) => {
                if let Err(flush_error) = sink.flush_error(error) {
                    warn!("error response flush failed: {}", flush_error);
                }
                true
            }
            None => {
                debug!("resume_error lost completion race; request already terminal");
                false
            }
        }
    }

    /// Force a fixed 503 completion. Idempotent for cancellation: returns
    /// `true` if already cancelled, `false` if a normal resume already
    /// completed the request.
    pub fn cancel(&self) -> bool {
        self.cancel_inner(None)
    }

    /// As [`cancel`](Self::cancel), with a `Retry-After` header on the
    /// emitted response.
    pub fn cancel_after(&self, retry_after: RetryAfter) -> bool {
        self.cancel_inner(Some(retry_after))
    }

    fn cancel_inner(&self, retry_after: Option<RetryAfter>) -> bool {
        let sink = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                LifecycleState::Cancelled => return true,
                LifecycleState::Completed => return false,
                LifecycleState::Active => {
                    debug!("cancel before suspend; nothing to cancel");
                    return false;
                }
                LifecycleState::Suspended => {}
            }
            inner.state = LifecycleState::Cancelled;
            disarm(&mut inner);
            inner.sink.take()
        };
        if let Some(sink) = sink {
            let mut extra = HeaderMap::new();
            if let Some(retry) = retry_after {
                if let Ok(value) = HeaderValue::from_str(&retry.as_secs().to_string()) {
                    extra.insert(RETRY_AFTER, value);
                }
            }
            if let Err(error) = sink.flush_fixed_status(StatusCode::SERVICE_UNAVAILABLE, extra) {
                warn!("cancel response flush failed: {}", error);
            }
        }
        true
    }

    /// Re-arm the suspension timeout. Returns `false` if the request is
    /// not suspended, or if the previously armed timer could not be
    /// disarmed (it is about to fire; the race is lost).
    pub fn set_timeout(&self, delay: Duration) -> bool {
        set_timeout(&self.shared, delay)
    }

    /// Register a callback invoked on timeout before the forced 503
    /// fallback. Replaces any previously registered callback.
    pub fn set_timeout_handler<F>(&self, handler: F)
    where
        F: FnMut(&ResponseHandle) + Send + 'static,
    {
        self.shared.inner.lock().unwrap().timeout_handler = Some(Box::new(handler));
    }

    /// Finish the suspended request after an out-of-band write; see
    /// [`AsyncResponseController::complete`].
    pub fn complete(&self) {
        complete(&self.shared);
    }

    /// True once the request has ever been suspended.
    pub fn is_suspended(&self) -> bool {
        self.shared.inner.lock().unwrap().suspended
    }

    /// True once the request was cancelled (not merely completed).
    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().unwrap().state == LifecycleState::Cancelled
    }

    /// True once any terminal transition won.
    pub fn is_done(&self) -> bool {
        self.shared.inner.lock().unwrap().state.is_terminal()
    }

    /// Current lifecycle state (diagnostics).
    pub fn state(&self) -> LifecycleState {
        self.shared.inner.lock().unwrap().state
    }
}

/// Arm a one-shot timeout whose callback drives [`handle_timeout`].
///
/// The timer implementation must not invoke the callback synchronously
/// from `schedule`; the caller holds the per-request lock.
fn arm_timer(shared: &Arc<Shared>, delay: Duration) -> TimerHandle {
    let callback_shared = Arc::clone(shared);
    shared
        .timer
        .schedule(delay, Box::new(move || handle_timeout(&callback_shared)))
}

/// Disarm any armed timer. Losing to an in-flight callback is fine; the
/// fired callback will observe the terminal state and no-op.
fn disarm(inner: &mut Inner) {
    if let Some(handle) = inner.timer_handle.take() {
        handle.disarm();
    }
}

/// The winning terminal transition: state change, timer disarm, and sink
/// take are atomic under the per-request lock. Returns `None` if the
/// request is not suspended (race lost or never suspended).
fn finish(shared: &Arc<Shared>, target: LifecycleState) -> Option<Box<dyn ResponseSink>> {
    debug_assert!(target.is_terminal());
    let mut inner = shared.inner.lock().unwrap();
    if inner.state != LifecycleState::Suspended {
        return None;
    }
    inner.state = target;
    disarm(&mut inner);
    inner.sink.take()
}

/// Replace the armed timeout. The disarm check runs under the lock so a
/// timer that already began firing deterministically wins the race.
fn set_timeout(shared: &Arc<Shared>, delay: Duration) -> bool {
    let mut inner = shared.inner.lock().unwrap();
    if inner.state != LifecycleState::Suspended {
        return false;
    }
    if let Some(handle) = inner.timer_handle.take() {
        if !handle.disarm() {
            debug!("set_timeout lost race with in-flight timer");
            return false;
        }
    }
    inner.timer_handle = Some(arm_timer(shared, delay));
    true
}

fn complete(shared: &Arc<Shared>) {
    if let Some(sink) = finish(shared, LifecycleState::Completed) {
        if let Err(error) = sink.finish() {
            warn!("out-of-band completion flush failed: {}", error);
        }
    }
}

/// Timeout path, run by the event-loop timer callback.
///
/// The user callback runs without the lock held so it may resume, cancel,
/// or attempt a re-arm. Afterwards, if the request is still suspended,
/// force a fixed 503: a timeout must never leave a request suspended
/// forever. The forced completion is conditional on the state, not on
/// whether the callback "did something".
fn handle_timeout(shared: &Arc<Shared>) {
    let handler = shared.inner.lock().unwrap().timeout_handler.take();
    if let Some(mut handler) = handler {
        let handle = ResponseHandle {
            shared: Arc::clone(shared),
        };
        handler(&handle);
        let mut inner = shared.inner.lock().unwrap();
        if inner.timeout_handler.is_none() {
            inner.timeout_handler = Some(handler);
        }
    }
    if let Some(sink) = finish(shared, LifecycleState::Completed) {
        debug!("suspended request timed out; forcing 503");
        if let Err(error) = sink.flush_fixed_status(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new())
        {
            warn!("timeout response flush failed: {}", error);
        }
    }
}
