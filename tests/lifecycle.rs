//! End-to-end lifecycle tests: suspend/resume/cancel/timeout racing for a
//! single flush per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, RETRY_AFTER};
use hyper::{Method, StatusCode, Version};
use tokio::time::Instant;

use tokio_suspend::{
    logging, AsyncResponseController, ChannelSink, EventLoopTimer, HandlerError, LifecycleState,
    RequestContext, ResponseSink, ResponseValue, RetryAfter, SinkError, StateError, TimerCallback,
    TimerHandle, TokioTimer,
};

/// What the sink was asked to flush.
#[derive(Debug)]
enum Flush {
    Success(StatusCode, Bytes),
    Error(String),
    Fixed(StatusCode, HeaderMap),
    Finished,
}

/// Sink double that records every flush.
struct RecordingSink {
    flushes: Arc<Mutex<Vec<Flush>>>,
}

impl RecordingSink {
    fn new() -> (Box<Self>, Arc<Mutex<Vec<Flush>>>) {
        let flushes = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                flushes: Arc::clone(&flushes),
            }),
            flushes,
        )
    }
}

impl ResponseSink for RecordingSink {
    fn flush_success(self: Box<Self>, value: ResponseValue) -> Result<(), SinkError> {
        let record = Flush::Success(value.status(), value.body().clone());
        self.flushes.lock().unwrap().push(record);
        Ok(())
    }

    fn flush_error(self: Box<Self>, error: HandlerError) -> Result<(), SinkError> {
        self.flushes
            .lock()
            .unwrap()
            .push(Flush::Error(error.to_string()));
        Ok(())
    }

    fn flush_fixed_status(
        self: Box<Self>,
        status: StatusCode,
        extra_headers: HeaderMap,
    ) -> Result<(), SinkError> {
        self.flushes
            .lock()
            .unwrap()
            .push(Flush::Fixed(status, extra_headers));
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        self.flushes.lock().unwrap().push(Flush::Finished);
        Ok(())
    }
}

/// Timer double fired explicitly by the test.
struct ManualTimer {
    pending: Mutex<Vec<(Arc<AtomicBool>, TimerCallback)>>,
}

impl ManualTimer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
        })
    }

    fn armed(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Fire the oldest pending timer, honoring the claim protocol.
    fn fire(&self) {
        let (claimed, callback) = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            pending.remove(0)
        };
        if !claimed.swap(true, Ordering::AcqRel) {
            callback();
        }
    }
}

impl EventLoopTimer for ManualTimer {
    fn schedule(&self, _delay: Duration, callback: TimerCallback) -> TimerHandle {
        let claimed = Arc::new(AtomicBool::new(false));
        self.pending
            .lock()
            .unwrap()
            .push((Arc::clone(&claimed), callback));
        TimerHandle::new(claimed)
    }
}

fn recording_controller() -> (AsyncResponseController, Arc<Mutex<Vec<Flush>>>) {
    let (sink, flushes) = RecordingSink::new();
    (
        AsyncResponseController::new(sink, ManualTimer::new()),
        flushes,
    )
}

/// Scenario A: suspend with a 100ms timeout and never resume. Exactly one
/// fixed 503 flush at >= 100ms; the suspended flag stays up throughout.
#[tokio::test(start_paused = true)]
async fn test_scenario_a_timeout_without_resume() {
    logging::init();
    let (sink, rx) = ChannelSink::new();
    let ctl = AsyncResponseController::new(Box::new(sink), Arc::new(TokioTimer::new()));

    let start = Instant::now();
    let _handle = ctl.suspend(Some(Duration::from_millis(100))).unwrap();
    assert!(ctl.is_suspended());

    let response = rx.await.expect("timeout must flush a response");
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(ctl.is_suspended(), "suspended stays true after completion");
    assert_eq!(ctl.state(), LifecycleState::Completed);
}

/// Scenario B: resume at 10ms beats a 100ms timeout; a cancel at 50ms
/// loses; nothing further happens when the timer's deadline passes.
#[tokio::test(start_paused = true)]
async fn test_scenario_b_resume_beats_timer() {
    let (sink, rx) = ChannelSink::new();
    let ctl = AsyncResponseController::new(Box::new(sink), Arc::new(TokioTimer::new()));
    let handle = ctl.suspend(Some(Duration::from_millis(100))).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.resume("ok"));

    let response = rx.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"ok");

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!handle.cancel(), "cancel after resume reports Completed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), LifecycleState::Completed);
    assert!(!handle.is_cancelled());
}

/// Scenario C: resume and cancel race from two threads; exactly one wins
/// and the single flush matches the winner.
#[test]
fn test_scenario_c_concurrent_resume_and_cancel() {
    for _ in 0..100 {
        let (ctl, flushes) = recording_controller();
        let handle = ctl.suspend(None).unwrap();

        let h1 = handle.clone();
        let resumer = std::thread::spawn(move || h1.resume("winner"));
        let h2 = handle.clone();
        let canceller = std::thread::spawn(move || h2.cancel());

        let resumed = resumer.join().unwrap();
        let cancelled = canceller.join().unwrap();

        assert_ne!(resumed, cancelled, "exactly one side must win");
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1, "sink must see exactly one flush");
        match &flushes[0] {
            Flush::Success(status, body) => {
                assert!(resumed);
                assert_eq!(*status, StatusCode::OK);
                assert_eq!(body.as_ref(), b"winner");
            }
            Flush::Fixed(status, _) => {
                assert!(cancelled);
                assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
            }
            other => panic!("unexpected flush: {:?}", other),
        }
    }
}

/// Scenario D: set_timeout before any suspension fails and arms nothing.
#[test]
fn test_scenario_d_set_timeout_before_suspend() {
    let timer = ManualTimer::new();
    let (sink, flushes) = RecordingSink::new();
    let ctl = AsyncResponseController::new(sink, timer.clone());

    assert!(!ctl.set_timeout(Duration::from_millis(100)));
    assert_eq!(timer.armed(), 0, "no timer may be armed");
    assert_eq!(ctl.state(), LifecycleState::Active);
    assert!(flushes.lock().unwrap().is_empty());
}

#[test]
fn test_suspend_twice_reports_state_error() {
    let (ctl, _) = recording_controller();
    let _handle = ctl.suspend(Some(Duration::from_secs(1)));
    match ctl.suspend(None) {
        Err(StateError::AlreadySuspended) => {}
        other => panic!("expected AlreadySuspended, got {:?}", other.err()),
    }
}

#[test]
fn test_exactly_one_flush_across_every_completion_path() {
    let (ctl, flushes) = recording_controller();
    let handle = ctl.suspend(None).unwrap();

    assert!(handle.resume("first"));
    assert!(!handle.resume("second"));
    assert!(!handle.resume_error("late error".into()));
    assert!(!handle.cancel());
    assert!(!handle.cancel_after(RetryAfter::After(Duration::from_secs(9))));
    ctl.complete();
    assert!(!handle.set_timeout(Duration::from_secs(1)));

    assert_eq!(flushes.lock().unwrap().len(), 1);
}

#[test]
fn test_cancel_is_idempotent_but_loses_to_resume() {
    // cancel twice: second call reports idempotent success
    let (ctl, flushes) = recording_controller();
    let handle = ctl.suspend(None).unwrap();
    assert!(handle.cancel());
    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert_eq!(flushes.lock().unwrap().len(), 1);

    // resume then cancel: cancel reports false because Completed won
    let (ctl, flushes) = recording_controller();
    let handle = ctl.suspend(None).unwrap();
    assert!(handle.resume("done"));
    assert!(!handle.cancel());
    assert!(!handle.is_cancelled());
    assert_eq!(flushes.lock().unwrap().len(), 1);
}

/// Retry-After travels end to end through the channel sink.
#[tokio::test]
async fn test_cancel_after_emits_retry_after_header() {
    let (sink, rx) = ChannelSink::new();
    let ctl = AsyncResponseController::new(Box::new(sink), Arc::new(TokioTimer::new()));
    let handle = ctl.suspend(None).unwrap();

    assert!(handle.cancel_after(RetryAfter::After(Duration::from_secs(60))));
    assert!(handle.is_cancelled());

    let response = rx.await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "60");
}

/// A handler working through the request context: stash a correlation
/// attribute, suspend, resume from a worker thread, and observe the write
/// arriving on the connection task.
#[tokio::test]
async fn test_request_context_suspend_resume_round_trip() {
    let (sink, rx) = ChannelSink::new();
    let controller = AsyncResponseController::new(Box::new(sink), Arc::new(TokioTimer::new()));
    let mut req = RequestContext::new(
        Method::GET,
        "/jobs/42".parse().unwrap(),
        Version::HTTP_11,
        HeaderMap::new(),
        "127.0.0.1:9100".parse().unwrap(),
        controller,
    );
    req.set_attribute("job_id", 42u64);

    let handle = req.async_context().suspend(None).unwrap();
    assert!(req.async_context().is_suspended());

    let job_id = *req.attribute::<u64>("job_id").unwrap();
    std::thread::spawn(move || {
        handle.resume(format!("job {} finished", job_id));
    });

    let response = rx.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"job 42 finished");
}

/// A dropped connection surfaces as a flush failure but the request still
/// reaches a terminal state and stays there.
#[test]
fn test_closed_connection_does_not_reopen_state_machine() {
    let (sink, rx) = ChannelSink::new();
    drop(rx);
    let ctl = AsyncResponseController::new(Box::new(sink), ManualTimer::new());
    let handle = ctl.suspend(None).unwrap();

    // The transition wins even though the hand-off fails.
    assert!(handle.resume("nobody listening"));
    assert_eq!(handle.state(), LifecycleState::Completed);
    assert!(!handle.resume("still nobody"));
}

/// Timeout handler decides first; the forced 503 only applies if the
/// request is still suspended afterwards.
#[test]
fn test_timeout_handler_outcomes() {
    // Handler resumes: its value wins, no 503.
    let timer = ManualTimer::new();
    let (sink, flushes) = RecordingSink::new();
    let ctl = AsyncResponseController::new(sink, timer.clone());
    let handle = ctl.suspend(Some(Duration::from_millis(100))).unwrap();
    handle.set_timeout_handler(|h| {
        h.resume("timeout fallback value");
    });
    timer.fire();
    {
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert!(matches!(&flushes[0], Flush::Success(..)));
    }

    // Handler does nothing: the fixed 503 guarantees forward progress.
    let timer = ManualTimer::new();
    let (sink, flushes) = RecordingSink::new();
    let ctl = AsyncResponseController::new(sink, timer.clone());
    let handle = ctl.suspend(Some(Duration::from_millis(100))).unwrap();
    handle.set_timeout_handler(|_| {});
    timer.fire();
    {
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert!(matches!(
            &flushes[0],
            Flush::Fixed(status, headers) if *status == StatusCode::SERVICE_UNAVAILABLE && headers.is_empty()
        ));
    }
    assert_eq!(handle.state(), LifecycleState::Completed);
}
