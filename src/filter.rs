//! Filter chain execution.
//!
//! A route's chain is an ordered list of [`GatewayFilter`]s resolved at
//! publish time. Request-phase hooks run in registration order before the
//! terminal upstream call; response-phase hooks run in reverse order once a
//! response is available (nested-middleware semantics). A request-phase
//! hook may short-circuit the chain by producing a response itself.
//!
//! The terminal element of every chain is the retry coordinator's upstream
//! invocation; it is supplied by the engine and is not a configurable
//! filter. Filters that need to observe individual retry attempts get the
//! [`GatewayFilter::on_attempt`] hook, which the coordinator fires once per
//! attempt; anything with irrevocable side effects must guard them with a
//! per-exchange marker so they happen at most once per logical request.

use crate::error::{GatewayError, Result};
use crate::exchange::{Exchange, GatewayResponse};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a request-phase filter hook.
pub enum FilterAction {
    /// Proceed to the next filter (or the terminal call).
    Continue,
    /// Stop here and return this response; no upstream call is made.
    ShortCircuit(GatewayResponse),
}

/// A request/response transformer composed into a route's chain.
#[async_trait]
pub trait GatewayFilter: Send + Sync {
    /// Filter name, for logs.
    fn name(&self) -> &str;

    /// Request-phase hook, run once per exchange before the upstream call.
    async fn on_request(&self, _exchange: &mut Exchange) -> Result<FilterAction> {
        Ok(FilterAction::Continue)
    }

    /// Fired by the retry coordinator at the start of every upstream
    /// attempt, including retries. Most filters ignore this.
    async fn on_attempt(&self, _exchange: &Exchange, _attempt: u32) {}

    /// Response-phase hook, run once per exchange after the terminal
    /// response is available. Chains run these in reverse order.
    async fn on_response(
        &self,
        _exchange: &mut Exchange,
        _response: &mut GatewayResponse,
    ) -> Result<()> {
        Ok(())
    }
}

/// The terminal step of a chain: the upstream invocation supplied by the
/// engine. Not a user-configurable filter.
#[async_trait]
pub trait ChainTerminal: Send + Sync {
    /// Issues the (possibly retried) upstream call for this exchange.
    async fn call(&self, exchange: &mut Exchange) -> Result<GatewayResponse>;
}

/// An ordered filter pipeline bound to a route.
pub struct FilterChain {
    filters: Vec<Arc<dyn GatewayFilter>>,
}

impl FilterChain {
    /// Creates a chain over the given filters (registration order).
    pub fn new(filters: Vec<Arc<dyn GatewayFilter>>) -> Self {
        Self { filters }
    }

    /// Executes the chain around the terminal upstream step.
    ///
    /// Request-phase hooks run in order; a short-circuit skips everything
    /// inward (including the terminal call) and unwinds through the
    /// response-phase hooks of the filters that already ran.
    pub async fn execute(
        &self,
        exchange: &mut Exchange,
        terminal: &dyn ChainTerminal,
    ) -> Result<GatewayResponse> {
        let mut entered = 0;
        for filter in &self.filters {
            match filter.on_request(exchange).await? {
                FilterAction::Continue => entered += 1,
                FilterAction::ShortCircuit(mut response) => {
                    debug!(filter = filter.name(), "filter short-circuited chain");
                    for outer in self.filters[..entered].iter().rev() {
                        outer.on_response(exchange, &mut response).await?;
                    }
                    return Ok(response);
                }
            }
        }

        let mut response = terminal.call(exchange).await?;

        for filter in self.filters.iter().rev() {
            filter.on_response(exchange, &mut response).await?;
        }
        Ok(response)
    }
}

/// Serializable filter specification, resolved to a concrete filter when a
/// route is published. This is what an external configuration loader
/// produces; the chain itself is never reconfigured per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Prepend a prefix to the request path.
    PrefixPath { prefix: String },
    /// Remove the first `parts` path segments.
    StripPrefix { parts: usize },
    /// Add a request header before forwarding.
    AddRequestHeader { name: String, value: String },
    /// Reject requests missing a header with 400, without calling upstream.
    RequireHeader { name: String },
    /// Log each inbound request exactly once per exchange.
    RequestLog,
}

impl FilterSpec {
    /// Resolves the spec into a filter instance.
    pub fn build(&self) -> Result<Arc<dyn GatewayFilter>> {
        match self {
            FilterSpec::PrefixPath { prefix } => Ok(Arc::new(PrefixPathFilter::new(prefix))),
            FilterSpec::StripPrefix { parts } => Ok(Arc::new(StripPrefixFilter::new(*parts))),
            FilterSpec::AddRequestHeader { name, value } => {
                let name: HeaderName = name
                    .parse()
                    .map_err(|_| GatewayError::Filter(format!("invalid header name {name}")))?;
                let value: HeaderValue = value
                    .parse()
                    .map_err(|_| GatewayError::Filter(format!("invalid header value for {name}")))?;
                Ok(Arc::new(AddRequestHeaderFilter::new(name, value)))
            }
            FilterSpec::RequireHeader { name } => {
                let name: HeaderName = name
                    .parse()
                    .map_err(|_| GatewayError::Filter(format!("invalid header name {name}")))?;
                Ok(Arc::new(RequireHeaderFilter::new(name)))
            }
            FilterSpec::RequestLog => Ok(Arc::new(RequestLogFilter)),
        }
    }
}

/// Builds a chain of filters from specs, in order.
pub fn build_filters(specs: &[FilterSpec]) -> Result<Vec<Arc<dyn GatewayFilter>>> {
    specs.iter().map(FilterSpec::build).collect()
}

/// Prepends a fixed prefix to the request path.
pub struct PrefixPathFilter {
    prefix: String,
}

impl PrefixPathFilter {
    /// Creates the filter; `prefix` should start with `/`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl GatewayFilter for PrefixPathFilter {
    fn name(&self) -> &str {
        "prefix_path"
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<FilterAction> {
        let prefixed = format!("{}{}", self.prefix, exchange.request().path());
        exchange.request_mut().set_path(prefixed);
        Ok(FilterAction::Continue)
    }
}

/// Removes the first `parts` segments from the request path.
pub struct StripPrefixFilter {
    parts: usize,
}

impl StripPrefixFilter {
    /// Creates the filter.
    pub fn new(parts: usize) -> Self {
        Self { parts }
    }
}

#[async_trait]
impl GatewayFilter for StripPrefixFilter {
    fn name(&self) -> &str {
        "strip_prefix"
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<FilterAction> {
        let path = exchange.request().path();
        let mut remaining: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let keep = remaining.split_off(remaining.len().min(self.parts));
        let stripped = if keep.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", keep.join("/"))
        };
        exchange.request_mut().set_path(stripped);
        Ok(FilterAction::Continue)
    }
}

/// Adds a request header before the upstream call.
pub struct AddRequestHeaderFilter {
    header: HeaderName,
    value: HeaderValue,
}

impl AddRequestHeaderFilter {
    /// Creates the filter.
    pub fn new(header: HeaderName, value: HeaderValue) -> Self {
        Self { header, value }
    }
}

#[async_trait]
impl GatewayFilter for AddRequestHeaderFilter {
    fn name(&self) -> &str {
        "add_request_header"
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<FilterAction> {
        exchange
            .request_mut()
            .headers_mut()
            .append(self.header.clone(), self.value.clone());
        Ok(FilterAction::Continue)
    }
}

/// Rejects requests missing a required header, short-circuiting with 400.
pub struct RequireHeaderFilter {
    header: HeaderName,
}

impl RequireHeaderFilter {
    /// Creates the filter.
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

#[async_trait]
impl GatewayFilter for RequireHeaderFilter {
    fn name(&self) -> &str {
        "require_header"
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<FilterAction> {
        if exchange.request().headers().contains_key(&self.header) {
            Ok(FilterAction::Continue)
        } else {
            Ok(FilterAction::ShortCircuit(GatewayResponse::with_status(
                StatusCode::BAD_REQUEST,
                format!("missing required header {}", self.header),
            )))
        }
    }
}

/// Global request-logging filter.
///
/// The log entry is an irrevocable side effect, so it is guarded by a
/// per-exchange marker: retried attempts never produce a second entry.
pub struct RequestLogFilter;

#[async_trait]
impl GatewayFilter for RequestLogFilter {
    fn name(&self) -> &str {
        "request_log"
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<FilterAction> {
        if exchange.attributes_mut().mark_once("request_log") {
            info!(
                method = %exchange.request().method(),
                path = %exchange.request().path(),
                host = exchange.request().host(),
                "inbound request"
            );
        }
        Ok(FilterAction::Continue)
    }

    async fn on_attempt(&self, exchange: &Exchange, attempt: u32) {
        debug!(
            attempt,
            path = %exchange.request().path(),
            "upstream attempt"
        );
    }
}
