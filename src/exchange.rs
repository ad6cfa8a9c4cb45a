//! Per-request exchange state spanning all retry attempts.
//!
//! An [`Exchange`] owns everything that is mutable for a single inbound
//! request: the buffered (replayable) request, the attempt counter, and the
//! attribute map that lets global filters run their side effects exactly
//! once even when the terminal call is retried.

use bytes::Bytes;
use http::{HeaderMap, Method};
use std::collections::HashMap;

/// A buffered inbound HTTP request.
///
/// The body is held as [`Bytes`] so retried attempts can replay it
/// byte-identically; it is never consumed destructively.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    method: Method,
    /// Path plus optional query string, e.g. `/httpbin/post?x=1`.
    path_and_query: String,
    /// Host the client addressed, taken from the Host header or authority.
    host: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl GatewayRequest {
    /// Creates a request from already-buffered parts.
    pub fn new(
        method: Method,
        path_and_query: impl Into<String>,
        host: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            host,
            headers,
            body,
        }
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the path component, without the query string.
    pub fn path(&self) -> &str {
        match self.path_and_query.split_once('?') {
            Some((path, _)) => path,
            None => &self.path_and_query,
        }
    }

    /// Returns the full path-and-query string sent upstream.
    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    /// Replaces the path, preserving any query string.
    pub fn set_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.path_and_query = match self.path_and_query.split_once('?') {
            Some((_, query)) => format!("{}?{}", path, query),
            None => path,
        };
    }

    /// Returns the request host, if known.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable view of the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the buffered body. Cloning is cheap and yields the same
    /// underlying bytes, which is what makes replay byte-identical.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A buffered HTTP response flowing back through the filter chain.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: http::StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl GatewayResponse {
    /// Creates a response from parts.
    pub fn new(status: http::StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Creates a response with the given status and a plain-text body.
    pub fn with_status(status: http::StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(message.into()),
        }
    }

    /// Returns the response status.
    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable view of the response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the buffered response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Attribute key for the current retry iteration index.
pub const RETRY_ITERATION_ATTR: &str = "retry_iteration";

/// An attribute value stored on an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    U32(u32),
    Str(String),
}

/// Per-exchange attribute map.
///
/// Owned exclusively by the exchange's task; this is the explicit struct
/// that replaces ambient request-scoped state. Filters use it to mark work
/// that must happen at most once per logical request.
#[derive(Debug, Default)]
pub struct Attributes {
    map: HashMap<String, AttrValue>,
}

impl Attributes {
    /// Stores a value under the given key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.map.insert(key.into(), value);
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.map.get(key)
    }

    /// Sets a marker for `key` and reports whether this call set it first.
    ///
    /// Returns `true` exactly once per key per exchange, which is how
    /// global filters guard irrevocable side effects against retries.
    pub fn mark_once(&mut self, key: impl Into<String>) -> bool {
        match self.map.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(AttrValue::Bool(true));
                true
            }
        }
    }

    /// Returns the current retry iteration index, if an attempt has begun.
    pub fn retry_iteration(&self) -> Option<u32> {
        match self.map.get(RETRY_ITERATION_ATTR) {
            Some(AttrValue::U32(n)) => Some(*n),
            _ => None,
        }
    }
}

/// The per-request mutable context spanning all retry attempts.
#[derive(Debug)]
pub struct Exchange {
    request: GatewayRequest,
    attempts_started: u32,
    attributes: Attributes,
}

impl Exchange {
    /// Creates a fresh exchange for an inbound request.
    pub fn new(request: GatewayRequest) -> Self {
        Self {
            request,
            attempts_started: 0,
            attributes: Attributes::default(),
        }
    }

    /// Returns the buffered request.
    pub fn request(&self) -> &GatewayRequest {
        &self.request
    }

    /// Returns a mutable view of the request, for request-phase filters.
    pub fn request_mut(&mut self) -> &mut GatewayRequest {
        &mut self.request
    }

    /// Returns the number of upstream attempts started so far.
    pub fn attempts_started(&self) -> u32 {
        self.attempts_started
    }

    /// Begins a new upstream attempt and returns its zero-based index.
    ///
    /// The counter increases monotonically, exactly once per upstream call,
    /// and never resets mid-exchange. The index is also published into the
    /// attribute map so filters can observe which attempt they run under.
    pub fn begin_attempt(&mut self) -> u32 {
        let index = self.attempts_started;
        self.attempts_started += 1;
        self.attributes
            .set(RETRY_ITERATION_ATTR, AttrValue::U32(index));
        index
    }

    /// Returns the attribute map.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Returns a mutable view of the attribute map.
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn request() -> GatewayRequest {
        GatewayRequest::new(
            Method::POST,
            "/httpbin/post?x=1",
            Some("www.example.org".to_string()),
            HeaderMap::new(),
            Bytes::from_static(b"HelloGateway"),
        )
    }

    #[test]
    fn test_path_and_query_split() {
        let req = request();
        assert_eq!(req.path(), "/httpbin/post");
        assert_eq!(req.path_and_query(), "/httpbin/post?x=1");
    }

    #[test]
    fn test_set_path_preserves_query() {
        let mut req = request();
        req.set_path("/post");
        assert_eq!(req.path_and_query(), "/post?x=1");
    }

    #[test]
    fn test_attempt_counter_monotonic() {
        let mut exchange = Exchange::new(request());
        assert_eq!(exchange.attempts_started(), 0);
        assert_eq!(exchange.begin_attempt(), 0);
        assert_eq!(exchange.begin_attempt(), 1);
        assert_eq!(exchange.begin_attempt(), 2);
        assert_eq!(exchange.attempts_started(), 3);
        assert_eq!(exchange.attributes().retry_iteration(), Some(2));
    }

    #[test]
    fn test_body_replay_is_byte_identical() {
        let exchange = Exchange::new(request());
        let first = exchange.request().body().clone();
        let second = exchange.request().body().clone();
        assert_eq!(first, second);
        assert_eq!(first, Bytes::from_static(b"HelloGateway"));
    }

    #[test]
    fn test_mark_once() {
        let mut attrs = Attributes::default();
        assert!(attrs.mark_once("audit_log"));
        assert!(!attrs.mark_once("audit_log"));
        assert!(attrs.mark_once("other"));
    }

    #[test]
    fn test_response_with_status() {
        let resp = GatewayResponse::with_status(StatusCode::BAD_GATEWAY, "bad gateway");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.body(), &Bytes::from_static(b"bad gateway"));
    }
}
