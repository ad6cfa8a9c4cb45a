//! Tower service adapter for embedding the gateway in an HTTP server.
//!
//! The gateway core consumes buffered [`GatewayRequest`]s; this adapter
//! sits at the transport seam, collecting each hyper request body into a
//! replayable buffer before handing the exchange to the engine.

use crate::engine::Gateway;
use crate::exchange::{GatewayRequest, GatewayResponse};
use http::{header, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::warn;

/// `tower::Service` wrapper around a [`Gateway`].
///
/// Clone-cheap; every clone shares the same engine.
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    /// Creates a service over the given gateway.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Buffers an inbound hyper request into a replayable gateway request.
    async fn buffer_request(req: Request<Incoming>) -> Result<GatewayRequest, hyper::Error> {
        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.host().map(str::to_string));

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let bytes = body.collect().await?.to_bytes();

        Ok(GatewayRequest::new(
            parts.method,
            path_and_query,
            host,
            parts.headers,
            bytes,
        ))
    }

    /// Converts a gateway response into a hyper-compatible response.
    fn into_http(response: GatewayResponse) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            *headers = response.headers().clone();
        }
        let body = Full::new(response.body().clone())
            .map_err(|never| match never {})
            .boxed();
        builder.body(body).unwrap_or_else(|_| {
            Response::new(
                Full::new(Bytes::new())
                    .map_err(|never| match never {})
                    .boxed(),
            )
        })
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        Box::pin(async move {
            let response = match Self::buffer_request(req).await {
                Ok(request) => gateway.handle(request).await,
                Err(e) => {
                    warn!(error = %e, "failed to buffer request body");
                    GatewayResponse::with_status(StatusCode::BAD_REQUEST, "invalid request body")
                }
            };
            Ok(Self::into_http(response))
        })
    }
}
