//! Gateway engine: the top-level orchestrator.
//!
//! Matches an inbound request against the published route table, runs that
//! route's filter chain with the retry coordinator as the terminal step,
//! and translates terminal errors into HTTP failure responses. The caller
//! always receives a well-formed response; retry attempts are visible only
//! through latency and the final status.

use crate::client::UpstreamClient;
use crate::error::{GatewayError, Result};
use crate::exchange::{Exchange, GatewayRequest, GatewayResponse};
use crate::filter::{ChainTerminal, FilterChain};
use crate::retry::RetryCoordinator;
use crate::route::{Route, RouteTable};
use crate::upstream::ServerRegistry;
use http::StatusCode;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

/// The gateway engine.
///
/// The route table is an immutable snapshot behind a lock: `reload`
/// publishes a whole new table, so in-flight exchanges keep the consistent
/// view they started with. Everything per-request lives on the exchange.
pub struct Gateway {
    routes: RwLock<Arc<RouteTable>>,
    registry: Arc<ServerRegistry>,
    coordinator: RetryCoordinator,
}

impl Gateway {
    /// Creates a gateway with an empty route table.
    pub fn new(registry: Arc<ServerRegistry>, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            routes: RwLock::new(RouteTable::publish(Vec::new())),
            registry: Arc::clone(&registry),
            coordinator: RetryCoordinator::new(registry, client),
        }
    }

    /// Publishes a new route table snapshot, replacing the previous one
    /// wholesale.
    pub fn reload(&self, routes: Vec<Route>) {
        let table = RouteTable::publish(routes);
        info!(routes = table.len(), "publishing route table");
        *self.routes.write() = table;
    }

    /// Returns the current route table snapshot.
    pub fn route_table(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes.read())
    }

    /// Returns the server registry backing logical-service targets.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Handles one inbound request end to end.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let table = self.route_table();
        let route = match table.find(request.host(), request.path()) {
            Some(route) => route,
            None => {
                return Self::failure_response(GatewayError::NoRouteMatched {
                    host: request.host().map(str::to_string),
                    path: request.path().to_string(),
                })
            }
        };

        let mut exchange = Exchange::new(request);
        let result = match route.timeout() {
            Some(deadline) => match timeout(deadline, self.run_chain(route, &mut exchange)).await {
                Ok(result) => result,
                // The in-flight attempt is aborted by dropping its future.
                Err(_) => Err(GatewayError::Timeout {
                    duration_ms: deadline.as_millis() as u64,
                }),
            },
            None => self.run_chain(route, &mut exchange).await,
        };

        match result {
            Ok(response) => response,
            Err(error) => Self::failure_response(error),
        }
    }

    async fn run_chain(&self, route: &Route, exchange: &mut Exchange) -> Result<GatewayResponse> {
        let chain = FilterChain::new(route.filters().to_vec());
        let terminal = UpstreamCall {
            coordinator: &self.coordinator,
            route,
        };
        chain.execute(exchange, &terminal).await
    }

    /// Maps a terminal error to an HTTP failure response.
    fn failure_response(error: GatewayError) -> GatewayResponse {
        let status = Self::failure_status(&error);
        warn!(status = status.as_u16(), error = %error, "request failed");
        GatewayResponse::with_status(status, error.to_string())
    }

    fn failure_status(error: &GatewayError) -> StatusCode {
        match error {
            GatewayError::NoRouteMatched { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Exhausted { .. } | GatewayError::UpstreamFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Filter(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Binds the retry coordinator to a route as the chain's terminal step.
struct UpstreamCall<'a> {
    coordinator: &'a RetryCoordinator,
    route: &'a Route,
}

#[async_trait::async_trait]
impl ChainTerminal for UpstreamCall<'_> {
    async fn call(&self, exchange: &mut Exchange) -> Result<GatewayResponse> {
        self.coordinator.invoke(self.route, exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{UpstreamError, UpstreamErrorKind};
    use crate::filter::{FilterAction, GatewayFilter};
    use crate::retry::RetryConfig;
    use crate::route::{HostMatch, PathMatch, RouteTarget};
    use crate::upstream::{Server, ServerPool};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedClient {
        script: Mutex<VecDeque<std::result::Result<GatewayResponse, UpstreamError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedClient {
        fn new(script: Vec<std::result::Result<GatewayResponse, UpstreamError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedClient {
        async fn send(
            &self,
            _server: &Server,
            _request: &GatewayRequest,
        ) -> std::result::Result<GatewayResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script.lock().pop_front().unwrap_or_else(|| {
                Ok(GatewayResponse::with_status(StatusCode::OK, "fallback"))
            })
        }
    }

    /// Global filter with an irrevocable side effect guarded by a marker,
    /// plus a per-attempt observer.
    struct AuditFilter {
        side_effects: AtomicUsize,
        attempts_seen: Mutex<Vec<u32>>,
    }

    impl AuditFilter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                side_effects: AtomicUsize::new(0),
                attempts_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GatewayFilter for AuditFilter {
        fn name(&self) -> &str {
            "audit"
        }

        async fn on_request(&self, exchange: &mut Exchange) -> crate::error::Result<FilterAction> {
            if exchange.attributes_mut().mark_once("audit") {
                self.side_effects.fetch_add(1, Ordering::SeqCst);
            }
            Ok(FilterAction::Continue)
        }

        async fn on_attempt(&self, _exchange: &Exchange, attempt: u32) {
            self.attempts_seen.lock().push(attempt);
        }
    }

    fn request(method: Method, host: &str, path: &str, body: &'static [u8]) -> GatewayRequest {
        GatewayRequest::new(
            method,
            path,
            Some(host.to_string()),
            HeaderMap::new(),
            Bytes::from_static(body),
        )
    }

    fn gateway_with(
        client: Arc<dyn UpstreamClient>,
        servers: Vec<Server>,
        route: Route,
    ) -> Gateway {
        let registry = Arc::new(ServerRegistry::new());
        registry.publish(ServerPool::new("badservice3", servers));
        let gateway = Gateway::new(registry, client);
        gateway.reload(vec![route]);
        gateway
    }

    fn retry_route(retries: u32) -> Route {
        Route::new("retry_with_loadbalancer", RouteTarget::parse("lb://badservice3"))
            .with_host(HostMatch::pattern("**.retrywithloadbalancer.org"))
            .with_retry(
                RetryConfig::new()
                    .with_retries(retries)
                    .with_methods(vec![Method::GET, Method::POST]),
            )
    }

    #[tokio::test]
    async fn test_retryable_failure_then_success_returns_hello_gateway() {
        let client = ScriptedClient::new(vec![
            Ok(GatewayResponse::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                "",
            )),
            Ok(GatewayResponse::with_status(StatusCode::OK, "HelloGateway")),
        ]);
        let gateway = gateway_with(
            client.clone(),
            vec![Server::new("localhost", 8080)],
            retry_route(2),
        );

        let response = gateway
            .handle(request(
                Method::POST,
                "www.retrywithloadbalancer.org",
                "/regular-post",
                b"HelloGateway",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"HelloGateway"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_global_filter_side_effect_exactly_once_across_retries() {
        let client = ScriptedClient::new(vec![
            Ok(GatewayResponse::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                "",
            )),
            Ok(GatewayResponse::with_status(StatusCode::OK, "HelloGateway")),
        ]);
        let audit = AuditFilter::new();
        let route = retry_route(2).with_filter(audit.clone());
        let gateway = gateway_with(client, vec![Server::new("localhost", 8080)], route);

        let response = gateway
            .handle(request(
                Method::GET,
                "www.retrywithloadbalancer.org",
                "/x",
                b"",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        // Side effect once per logical request; attempts 0 and 1 observed.
        assert_eq!(audit.side_effects.load(Ordering::SeqCst), 1);
        assert_eq!(*audit.attempts_seen.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_no_route_matched_is_404_with_no_upstream_call() {
        let client = ScriptedClient::new(vec![]);
        let gateway = gateway_with(
            client.clone(),
            vec![Server::new("localhost", 8080)],
            retry_route(2),
        );

        let response = gateway
            .handle(request(Method::GET, "www.other.org", "/x", b""))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_is_503_without_retries() {
        let client = ScriptedClient::new(vec![]);
        let gateway = gateway_with(client.clone(), vec![], retry_route(3));

        let response = gateway
            .handle(request(
                Method::GET,
                "www.retrywithloadbalancer.org",
                "/x",
                b"",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_transport_failures_map_to_502() {
        let failure = || {
            Err(UpstreamError::new(
                UpstreamErrorKind::Connect,
                "connection refused",
            ))
        };
        let client = ScriptedClient::new(vec![failure(), failure(), failure()]);
        let gateway = gateway_with(
            client.clone(),
            vec![Server::new("localhost", 8080)],
            retry_route(2),
        );

        let response = gateway
            .handle(request(
                Method::GET,
                "www.retrywithloadbalancer.org",
                "/x",
                b"",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_route_deadline_maps_to_504_and_aborts_attempt() {
        let client = ScriptedClient::slow(Duration::from_millis(500));
        let route = retry_route(0).with_timeout(Duration::from_millis(20));
        let gateway = gateway_with(client.clone(), vec![Server::new("localhost", 8080)], route);

        let response = gateway
            .handle(request(
                Method::GET,
                "www.retrywithloadbalancer.org",
                "/x",
                b"",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_reload_replaces_table_wholesale() {
        let client = ScriptedClient::new(vec![]);
        let gateway = gateway_with(
            client.clone(),
            vec![Server::new("localhost", 8080)],
            retry_route(0),
        );

        gateway.reload(vec![Route::new(
            "direct-only",
            RouteTarget::parse("http://127.0.0.1:1"),
        )
        .with_path(PathMatch::prefix("/direct"))]);

        // The old host route is gone after the swap.
        let response = gateway
            .handle(request(
                Method::GET,
                "www.retrywithloadbalancer.org",
                "/x",
                b"",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(gateway.route_table().len(), 1);
    }
}
