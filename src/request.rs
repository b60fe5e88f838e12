//! Inbound request representation handed to application handler code.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;

use hyper::header::HeaderMap;
use hyper::{Method, Uri, Version};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::controller::AsyncResponseController;

/// Readable end of the request body.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// One inbound HTTP request bound to one connection.
///
/// Owned exclusively by the connection for the duration of one
/// request/response cycle; never shared across requests. Carries the
/// async response controller for that cycle, plus an open attribute bag
/// for handler-local correlation. The bag is allocated lazily on first
/// set.
pub struct RequestContext {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: SocketAddr,
    request_id: Uuid,
    attributes: Option<HashMap<String, Box<dyn Any + Send>>>,
    input: Option<InputStream>,
    controller: AsyncResponseController,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        remote_addr: SocketAddr,
        controller: AsyncResponseController,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            remote_addr,
            request_id: Uuid::new_v4(),
            attributes: None,
            input: None,
            controller,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Override the request method (e.g. method tunnelling filters).
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Header map; lookups are case-insensitive.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Per-request correlation id.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The async response controller for this request/response cycle.
    pub fn async_context(&self) -> &AsyncResponseController {
        &self.controller
    }

    pub fn set_input(&mut self, input: InputStream) {
        self.input = Some(input);
    }

    /// Take the request body stream; subsequent calls return `None`.
    pub fn take_input(&mut self) -> Option<InputStream> {
        self.input.take()
    }

    /// Typed attribute lookup.
    pub fn attribute<T: 'static>(&self, name: &str) -> Option<&T> {
        self.attributes
            .as_ref()
            .and_then(|bag| bag.get(name))
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Any + Send) {
        self.attributes
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), Box::new(value));
    }

    pub fn remove_attribute(&mut self, name: &str) {
        if let Some(bag) = self.attributes.as_mut() {
            bag.remove(name);
        }
    }

    /// Names of all set attributes; empty if none were ever set.
    pub fn attribute_names(&self) -> Vec<&str> {
        match &self.attributes {
            Some(bag) => bag.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }
}
