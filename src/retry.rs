//! Retry policy and the per-exchange retry coordinator.
//!
//! The coordinator is the terminal step of every filter chain: it resolves
//! an upstream server, issues the call with the exchange's buffered body,
//! and re-invokes on retryable failures until success or exhaustion. Its
//! state machine per exchange is
//! `Idle -> Attempting -> (Success | Retrying -> Attempting | Exhausted | Failed)`.

use crate::client::UpstreamClient;
use crate::error::{GatewayError, Result, UpstreamErrorKind};
use crate::exchange::{Exchange, GatewayResponse};
use crate::route::Route;
use crate::upstream::{Server, ServerRegistry};
use http::Method;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Delay policy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Retry immediately.
    None,
    /// Fixed delay before every retry.
    Fixed { delay: Duration },
    /// Exponential backoff: `base * multiplier^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
        /// Scale each delay by a random factor in 0.5..1.5.
        jitter: bool,
    },
}

impl BackoffPolicy {
    /// Exponential policy with common defaults: 100ms base, x2, 10s cap.
    pub fn exponential() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
            jitter: false,
        }
    }

    /// Computes the delay before re-attempting after attempt `attempt`
    /// (zero-based). `None` means retry immediately.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            BackoffPolicy::None => None,
            BackoffPolicy::Fixed { delay } => Some(*delay),
            BackoffPolicy::Exponential {
                base,
                multiplier,
                max,
                jitter,
            } => {
                let delay_ms = base.as_millis() as f64 * multiplier.powi(attempt as i32);
                let delay_ms = delay_ms.min(max.as_millis() as f64);
                let delay_ms = if *jitter {
                    delay_ms * rand::thread_rng().gen_range(0.5..1.5)
                } else {
                    delay_ms
                };
                Some(Duration::from_millis(delay_ms as u64))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::None
    }
}

/// Retry policy attached to a route at publish time; immutable per route.
///
/// Serializable so an external configuration loader can produce it; fields
/// left out of a config document take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries, excluding the initial attempt.
    pub max_retries: u32,
    /// Exact status codes that trigger a retry.
    pub retryable_statuses: Vec<u16>,
    /// Status series that trigger a retry (5 means every 5xx).
    pub retryable_series: Vec<u8>,
    /// Methods eligible for retry. Defaults to idempotent methods only;
    /// replaying a body-bearing method must be opted in explicitly.
    #[serde(with = "method_names")]
    pub retryable_methods: Vec<Method>,
    /// Transport failure kinds that trigger a retry.
    pub retryable_errors: Vec<UpstreamErrorKind>,
    /// Delay policy between attempts.
    pub backoff: BackoffPolicy,
    /// Exclude the previously used server when selecting for a retry.
    pub avoid_previous: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retryable_statuses: Vec::new(),
            retryable_series: vec![5],
            retryable_methods: vec![Method::GET, Method::HEAD],
            retryable_errors: vec![
                UpstreamErrorKind::Connect,
                UpstreamErrorKind::Timeout,
                UpstreamErrorKind::Reset,
            ],
            backoff: BackoffPolicy::None,
            avoid_previous: false,
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the exact status codes that trigger a retry.
    pub fn with_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retryable_statuses = statuses;
        self
    }

    /// Sets the status series that trigger a retry.
    pub fn with_series(mut self, series: Vec<u8>) -> Self {
        self.retryable_series = series;
        self
    }

    /// Sets the methods eligible for retry.
    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.retryable_methods = methods;
        self
    }

    /// Sets the retryable transport failure kinds.
    pub fn with_errors(mut self, errors: Vec<UpstreamErrorKind>) -> Self {
        self.retryable_errors = errors;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Excludes the previously used server on each retry.
    pub fn with_avoid_previous(mut self, avoid: bool) -> Self {
        self.avoid_previous = avoid;
        self
    }

    /// Checks whether a response status should trigger a retry.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
            || self.retryable_series.contains(&((status / 100) as u8))
    }

    /// Checks whether the request method is eligible for retry.
    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.retryable_methods.contains(method)
    }

    /// Checks whether a transport failure kind should trigger a retry.
    pub fn is_retryable_error(&self, kind: UpstreamErrorKind) -> bool {
        self.retryable_errors.contains(&kind)
    }
}

/// Serializes HTTP methods as their names, since `http::Method` carries no
/// serde impls of its own.
mod method_names {
    use http::Method;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(methods: &[Method], serializer: S) -> Result<S::Ok, S::Error> {
        methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Method>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|name| name.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// States of a retry sequence, used for transition tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    Attempting,
    Retrying,
    Success,
    Exhausted,
    Failed,
}

/// Drives the upstream call for one exchange, retrying per the route's
/// [`RetryConfig`]. Stateless across exchanges; all mutable attempt state
/// lives on the exchange itself.
pub struct RetryCoordinator {
    registry: Arc<ServerRegistry>,
    client: Arc<dyn UpstreamClient>,
}

impl RetryCoordinator {
    /// Creates a coordinator over the given registry and client.
    pub fn new(registry: Arc<ServerRegistry>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { registry, client }
    }

    /// Executes the upstream call for `exchange`, retrying per the route's
    /// policy.
    ///
    /// Returns the terminal response: a non-retryable response (success),
    /// or the last observed retryable response once attempts are used up
    /// (exhaustion is surfaced, never hidden). Selector unavailability,
    /// non-retryable transport failures, and exhaustion on a transport
    /// failure come back as errors.
    pub async fn invoke(&self, route: &Route, exchange: &mut Exchange) -> Result<GatewayResponse> {
        let config = route.retry();
        let method_retryable = config.is_retryable_method(exchange.request().method());
        let mut excluded: HashSet<String> = HashSet::new();

        loop {
            let attempt = exchange.begin_attempt();
            trace!(route = %route.id(), attempt, state = ?RetryState::Attempting, "upstream attempt");
            debug!("setting new iteration in attr {}", attempt);
            for filter in route.filters() {
                filter.on_attempt(exchange, attempt).await;
            }

            let server = self.registry.resolve(route.target(), &excluded).map_err(|e| {
                trace!(route = %route.id(), state = ?RetryState::Failed, "no server available");
                e
            })?;

            match self.client.send(&server, exchange.request()).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !config.is_retryable_status(status) || !method_retryable {
                        trace!(route = %route.id(), status, state = ?RetryState::Success, "terminal response");
                        return Ok(response);
                    }
                    if attempt >= config.max_retries {
                        warn!(
                            route = %route.id(),
                            attempts = exchange.attempts_started(),
                            status,
                            state = ?RetryState::Exhausted,
                            "retries exhausted, returning last response"
                        );
                        return Ok(response);
                    }
                    warn!(
                        route = %route.id(),
                        server = %server,
                        status,
                        attempt,
                        "retryable response status"
                    );
                    self.pause_before_retry(config, attempt, &server, &mut excluded)
                        .await;
                }
                Err(e) => {
                    if !config.is_retryable_error(e.kind) || !method_retryable {
                        trace!(route = %route.id(), state = ?RetryState::Failed, "non-retryable failure");
                        return Err(GatewayError::UpstreamFailed(e));
                    }
                    if attempt >= config.max_retries {
                        warn!(
                            route = %route.id(),
                            attempts = exchange.attempts_started(),
                            error = %e,
                            state = ?RetryState::Exhausted,
                            "retries exhausted"
                        );
                        return Err(GatewayError::Exhausted {
                            attempts: exchange.attempts_started(),
                            source: e,
                        });
                    }
                    warn!(
                        route = %route.id(),
                        server = %server,
                        error = %e,
                        attempt,
                        "retryable transport failure"
                    );
                    self.pause_before_retry(config, attempt, &server, &mut excluded)
                        .await;
                }
            }
        }
    }

    /// Applies the retry transition: optionally exclude the failed server,
    /// then suspend this exchange's task for the configured backoff.
    async fn pause_before_retry(
        &self,
        config: &RetryConfig,
        attempt: u32,
        server: &Server,
        excluded: &mut HashSet<String>,
    ) {
        trace!(attempt, state = ?RetryState::Retrying, "scheduling retry");
        if config.avoid_previous {
            excluded.insert(server.id());
        }
        if let Some(delay) = config.backoff.delay_for(attempt) {
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }
}
