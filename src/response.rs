//! Response values, rendering, and the flush sink.
//!
//! The controller never touches the socket. It renders the outcome of a
//! request into a finished `hyper` response and hands it to a
//! [`ResponseSink`] exactly once; the sink's job is to get that response
//! onto the connection for writing.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::sync::oneshot;

use crate::error::SinkError;

/// A fully serialized response, ready for the connection to write.
pub type FinishedResponse = Response<Full<Bytes>>;

/// Error produced by application handler code, rendered as a 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Pre-allocated empty body for status-only responses.
pub static EMPTY_BODY: Bytes = Bytes::from_static(b"");

const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const SERVER_NAME: &str = concat!("tokio_suspend/", env!("CARGO_PKG_VERSION"));

/// A computed response value produced by a resume.
///
/// Carries just enough to serialize: status, content type, extra headers,
/// and the body bytes.
pub struct ResponseValue {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    headers: HeaderMap,
    body: Bytes,
}

impl ResponseValue {
    /// A 200 response with the given body and the default content type.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: None,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_type(mut self, value: HeaderValue) -> Self {
        self.content_type = Some(value);
        self
    }

    /// Add an extra response header.
    pub fn with_header(mut self, name: hyper::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Serialize into a finished response.
    pub fn render(self) -> FinishedResponse {
        let mut builder = Response::builder()
            .status(self.status)
            .header("Server", SERVER_NAME);

        match &self.content_type {
            Some(ct) => builder = builder.header(CONTENT_TYPE, ct),
            None => builder = builder.header(CONTENT_TYPE, DEFAULT_CONTENT_TYPE),
        }

        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let body = if self.body.is_empty() {
            EMPTY_BODY.clone()
        } else {
            self.body
        };

        // Only valid statuses and header values reach here; the setters
        // take typed values.
        builder.body(Full::new(body)).unwrap()
    }
}

impl From<&'static str> for ResponseValue {
    fn from(body: &'static str) -> Self {
        ResponseValue::new(Bytes::from_static(body.as_bytes()))
    }
}

impl From<String> for ResponseValue {
    fn from(body: String) -> Self {
        ResponseValue::new(Bytes::from(body))
    }
}

/// Retry hint attached to a cancellation response.
///
/// Both forms are emitted as a delta-seconds `Retry-After` header; an
/// absolute time is converted relative to now, saturating at zero.
#[derive(Debug, Clone, Copy)]
pub enum RetryAfter {
    /// Retry after the given delay.
    After(Duration),
    /// Retry at the given wall-clock time.
    At(SystemTime),
}

impl RetryAfter {
    /// Header value in whole seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            RetryAfter::After(d) => d.as_secs(),
            RetryAfter::At(when) => when
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Build a status-only response with optional extra headers.
pub fn fixed_status_response(status: StatusCode, extra_headers: HeaderMap) -> FinishedResponse {
    let mut builder = Response::builder()
        .status(status)
        .header("Server", SERVER_NAME);
    for (name, value) in &extra_headers {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(EMPTY_BODY.clone())).unwrap()
}

/// Render a handler error as a plain-text 500.
pub fn error_response(error: &HandlerError) -> FinishedResponse {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Server", SERVER_NAME)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(error.to_string())))
        .unwrap()
}

/// Destination for the single finished response of a request.
///
/// Each method consumes the sink; the controller holds it in an `Option`
/// and takes it under the per-request lock, so at most one flush can ever
/// be issued. The flush itself is a hand-off: the physical write happens
/// on the connection-owning task, not on the calling thread.
pub trait ResponseSink: Send + 'static {
    /// Flush a computed response value.
    fn flush_success(self: Box<Self>, value: ResponseValue) -> Result<(), SinkError>;

    /// Flush an error response rendered from a handler error.
    fn flush_error(self: Box<Self>, error: HandlerError) -> Result<(), SinkError>;

    /// Flush a fixed-status response (e.g. 503 on timeout or cancel).
    fn flush_fixed_status(
        self: Box<Self>,
        status: StatusCode,
        extra_headers: HeaderMap,
    ) -> Result<(), SinkError>;

    /// Finish a response whose payload was already written through a
    /// lower-level path; only signals the connection to close out the
    /// exchange.
    fn finish(self: Box<Self>) -> Result<(), SinkError>;
}

/// Sink that marshals the finished response onto the connection task.
///
/// The connection's service future awaits the receiving end and returns
/// the response to hyper for writing, preserving the connection's
/// single-writer affinity even when resume/cancel ran on a worker thread.
pub struct ChannelSink {
    tx: oneshot::Sender<FinishedResponse>,
}

impl ChannelSink {
    /// Create a sink and the receiver the connection task awaits.
    pub fn new() -> (Self, oneshot::Receiver<FinishedResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    fn send(self, response: FinishedResponse) -> Result<(), SinkError> {
        self.tx
            .send(response)
            .map_err(|_| SinkError::ConnectionClosed)
    }
}

impl ResponseSink for ChannelSink {
    fn flush_success(self: Box<Self>, value: ResponseValue) -> Result<(), SinkError> {
        self.send(value.render())
    }

    fn flush_error(self: Box<Self>, error: HandlerError) -> Result<(), SinkError> {
        self.send(error_response(&error))
    }

    fn flush_fixed_status(
        self: Box<Self>,
        status: StatusCode,
        extra_headers: HeaderMap,
    ) -> Result<(), SinkError> {
        self.send(fixed_status_response(status, extra_headers))
    }

    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        self.send(fixed_status_response(StatusCode::OK, HeaderMap::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_defaults() {
        let resp = ResponseValue::new("hello").render();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            DEFAULT_CONTENT_TYPE
        );
        assert!(resp.headers().get("Server").is_some());
    }

    #[test]
    fn test_render_custom_status_and_headers() {
        let resp = ResponseValue::new("created")
            .with_status(StatusCode::CREATED)
            .with_content_type(HeaderValue::from_static("application/json"))
            .with_header(
                hyper::header::LOCATION,
                HeaderValue::from_static("/things/1"),
            )
            .render();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(resp.headers().get("Location").unwrap(), "/things/1");
    }

    #[test]
    fn test_fixed_status_response_carries_extra_headers() {
        let mut extra = HeaderMap::new();
        extra.insert(
            hyper::header::RETRY_AFTER,
            HeaderValue::from_static("30"),
        );
        let resp = fixed_status_response(StatusCode::SERVICE_UNAVAILABLE, extra);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(hyper::header::RETRY_AFTER).unwrap(), "30");
    }

    #[test]
    fn test_retry_after_absolute_time_saturates() {
        let past = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(RetryAfter::At(past).as_secs(), 0);

        let future = SystemTime::now() + Duration::from_secs(120);
        let secs = RetryAfter::At(future).as_secs();
        assert!((118..=120).contains(&secs), "got {}", secs);
    }

    #[test]
    fn test_error_response_body_carries_message() {
        let err: HandlerError = "backend exploded".into();
        let resp = error_response(&err);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_to_connection_task() {
        let (sink, rx) = ChannelSink::new();
        let sink: Box<dyn ResponseSink> = Box::new(sink);
        sink.flush_success(ResponseValue::new("ok")).unwrap();

        let resp = rx.await.expect("connection task should receive response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_connection() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let sink: Box<dyn ResponseSink> = Box::new(sink);
        let err = sink
            .flush_fixed_status(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, SinkError::ConnectionClosed));
    }
}
