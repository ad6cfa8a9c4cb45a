//! Outbound HTTP client abstraction.
//!
//! The gateway core issues upstream calls through the [`UpstreamClient`]
//! trait so the transport stays pluggable; [`HttpUpstreamClient`] is the
//! default hyper-backed implementation.

use crate::error::{UpstreamError, UpstreamErrorKind};
use crate::exchange::{GatewayRequest, GatewayResponse};
use crate::upstream::Server;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Issues a single HTTP call to a concrete upstream server.
///
/// Implementations must not retry internally; the retry coordinator owns
/// all replay decisions. The request body is buffered, so implementations
/// may read it as many times as the transport requires.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Sends `request` to `server`, returning the buffered response or a
    /// classified transport failure.
    async fn send(
        &self,
        server: &Server,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, UpstreamError>;
}

/// Default upstream client over hyper's pooled legacy client.
pub struct HttpUpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpUpstreamClient {
    /// Creates a client with hyper's default connection pool settings.
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    fn build_uri(server: &Server, request: &GatewayRequest) -> Result<Uri, UpstreamError> {
        let uri = format!("{}{}", server.base_uri(), request.path_and_query());
        uri.parse().map_err(|e| {
            UpstreamError::new(
                UpstreamErrorKind::Protocol,
                format!("invalid upstream uri {}: {}", uri, e),
            )
        })
    }

    fn classify(e: &hyper_util::client::legacy::Error) -> UpstreamErrorKind {
        if e.is_connect() {
            return UpstreamErrorKind::Connect;
        }
        let text = e.to_string().to_lowercase();
        if text.contains("timeout") || text.contains("timed out") {
            UpstreamErrorKind::Timeout
        } else if text.contains("reset") || text.contains("broken pipe") {
            UpstreamErrorKind::Reset
        } else {
            UpstreamErrorKind::Protocol
        }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(
        &self,
        server: &Server,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, UpstreamError> {
        let uri = Self::build_uri(server, request)?;
        debug!(uri = %uri, method = %request.method(), "sending upstream request");

        let mut builder = Request::builder().method(request.method().clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers().clone();
            headers.remove(http::header::HOST);
        }

        let outbound = builder
            .body(Full::new(request.body().clone()))
            .map_err(|e| UpstreamError::new(UpstreamErrorKind::Protocol, e.to_string()))?;

        let response = self
            .client
            .request(outbound)
            .await
            .map_err(|e| UpstreamError::new(Self::classify(&e), e.to_string()))?;

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| UpstreamError::new(UpstreamErrorKind::Reset, e.to_string()))?
            .to_bytes();

        Ok(GatewayResponse::new(parts.status, parts.headers, bytes))
    }
}
