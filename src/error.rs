//! Error types for the response lifecycle.

use std::fmt;

/// Caller-contract violation on the lifecycle state machine.
///
/// Unlike a lost completion race (which is an expected runtime outcome and
/// reported as a plain `false`), a state error means application code broke
/// the calling contract.
#[derive(Debug, PartialEq, Eq)]
pub enum StateError {
    /// `suspend` was called while the request was already suspended.
    /// Suspension is single-use per request.
    AlreadySuspended,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::AlreadySuspended => {
                write!(f, "request already suspended")
            }
        }
    }
}

impl std::error::Error for StateError {}

/// Downstream I/O failure while flushing a finished response.
///
/// Reported upward but never reopens the state machine; the request stays
/// terminally completed or cancelled regardless of whether the physical
/// write succeeded.
#[derive(Debug)]
pub enum SinkError {
    /// The connection task is gone; the finished response could not be
    /// handed off for writing.
    ConnectionClosed,
    /// The underlying connection write failed.
    Io(std::io::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::ConnectionClosed => {
                write!(f, "connection closed before response flush")
            }
            SinkError::Io(error) => {
                write!(f, "response write failed: {}", error)
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(error) => Some(error),
            _ => None,
        }
    }
}
