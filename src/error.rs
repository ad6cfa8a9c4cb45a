//! Error types for the gateway core.

use thiserror::Error;

/// Classification of a transport-level upstream failure.
///
/// The retry predicate operates on kinds, not on error text, so the
/// upstream client must classify failures when it observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// Connection could not be established (refused, unreachable, DNS).
    Connect,
    /// The attempt timed out at the transport level.
    Timeout,
    /// The connection was reset mid-request.
    Reset,
    /// The upstream spoke unparseable or otherwise broken HTTP.
    Protocol,
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamErrorKind::Connect => "connect",
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::Reset => "reset",
            UpstreamErrorKind::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

/// A transport-level failure from a single upstream call attempt.
#[derive(Error, Debug, Clone)]
#[error("upstream {kind} error: {message}")]
pub struct UpstreamError {
    /// Failure classification used by the retry predicate.
    pub kind: UpstreamErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl UpstreamError {
    /// Creates a new upstream error.
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Terminal errors surfaced by the gateway engine.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No route predicate matched the request.
    #[error("no route matched for host {host:?} path {path}")]
    NoRouteMatched { host: Option<String>, path: String },

    /// No eligible upstream server for the target service.
    #[error("no available server for service {service}")]
    Unavailable { service: String },

    /// All retry attempts were used up and the last attempt still failed
    /// at the transport level.
    #[error("all {attempts} attempts exhausted: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    /// A non-retryable upstream failure.
    #[error("upstream call failed: {0}")]
    UpstreamFailed(#[source] UpstreamError),

    /// The per-route deadline elapsed before a terminal response.
    #[error("request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A filter produced an invalid value (bad header, unbuildable response).
    #[error("filter error: {0}")]
    Filter(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
