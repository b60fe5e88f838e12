//! tokio_suspend - Asynchronous HTTP response lifecycle control for Tokio servers.
//!
//! This crate bridges an event-loop-driven connection with a blocking-style
//! request-handling API: a handler may suspend a request, hand the resulting
//! handle to a worker thread, and resume, cancel, or let it time out later,
//! while the underlying connection is written to exactly once.
//!
//! # Features
//!
//! - **Suspend/resume**: defer a response without blocking any thread
//! - **Race-free completion**: resume, cancel, and timeout race for one
//!   winner; losers observably no-op
//! - **Event-loop timeouts**: one-shot timers with best-effort disarm
//! - **Single-writer affinity**: the finished response is marshalled back
//!   onto the connection-owning task for the physical write
//! - **Structured logging**: unified JSON logging with tracing
//!
//! # Architecture
//!
//! The controller depends on two seams, both pluggable:
//!
//! - `EventLoopTimer` - schedules the timeout callback (`TokioTimer` in
//!   production, a manual clock in tests)
//! - `ResponseSink` - consumes the one finished response (`ChannelSink`
//!   hands it to the connection task over a oneshot channel)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_suspend::{AsyncResponseController, ChannelSink, TokioTimer};
//!
//! let (sink, rx) = ChannelSink::new();
//! let controller = AsyncResponseController::new(Box::new(sink), Arc::new(TokioTimer::new()));
//! let handle = controller.suspend(Some(Duration::from_millis(100)))?;
//! std::thread::spawn(move || { handle.resume("computed elsewhere"); });
//! let response = rx.await?; // connection task writes this
//! ```

/// Package version from Cargo.toml
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod controller;
pub mod error;
pub mod logging;
pub mod request;
pub mod response;
pub mod timer;

// Re-exports for convenience
pub use controller::{AsyncResponseController, LifecycleState, ResponseHandle, TimeoutHandler};
pub use error::{SinkError, StateError};
pub use request::RequestContext;
pub use response::{
    ChannelSink, FinishedResponse, HandlerError, ResponseSink, ResponseValue, RetryAfter,
};
pub use timer::{EventLoopTimer, TimerCallback, TimerHandle, TokioTimer};
