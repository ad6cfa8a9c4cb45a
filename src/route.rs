//! Route definitions and the published route table.
//!
//! Routes are matched on host pattern and path; the most specific route
//! wins (exact path, then longest prefix), with ties broken by registration
//! order so matching stays deterministic. A [`RouteTable`] is an immutable
//! snapshot: reconfiguration publishes a whole new table rather than
//! mutating routes in place.

use crate::filter::GatewayFilter;
use crate::retry::RetryConfig;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Global regex cache so host patterns compile once per pattern.
static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or compiles a regex, caching the result.
fn get_or_compile_regex(pattern: &str) -> Option<Arc<Regex>> {
    {
        let cache = REGEX_CACHE.read();
        if let Some(regex) = cache.get(pattern) {
            return Some(Arc::clone(regex));
        }
    }

    match Regex::new(pattern) {
        Ok(regex) => {
            let regex = Arc::new(regex);
            let mut cache = REGEX_CACHE.write();
            cache.insert(pattern.to_string(), Arc::clone(&regex));
            Some(regex)
        }
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid regex pattern");
            None
        }
    }
}

/// Condition for matching the request host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMatch {
    /// Host must be exactly this value.
    Exact { host: String },
    /// Host must match a glob-style pattern, e.g. `**.example.org`.
    /// `**` matches any number of labels, `*` matches within one label.
    Pattern { pattern: String },
}

impl HostMatch {
    /// Creates an exact host match.
    pub fn exact(host: impl Into<String>) -> Self {
        Self::Exact { host: host.into() }
    }

    /// Creates a glob-style host pattern match.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
        }
    }

    /// Checks whether the given host matches, ignoring any `:port` suffix.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.split(':').next().unwrap_or(host);
        match self {
            HostMatch::Exact { host: expected } => host.eq_ignore_ascii_case(expected),
            HostMatch::Pattern { pattern } => {
                if let Some(regex) = get_or_compile_regex(&glob_to_regex(pattern)) {
                    regex.is_match(&host.to_ascii_lowercase())
                } else {
                    false
                }
            }
        }
    }
}

/// Translates a host glob (`**.example.org`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let lowered = pattern.to_ascii_lowercase();
    let mut chars = lowered.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^.]*");
                }
            }
            '.' => out.push_str("\\."),
            c if c.is_ascii_alphanumeric() || c == '-' => out.push(c),
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out.push('$');
    out
}

/// Condition for matching the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatch {
    /// Path must be exactly this value.
    Exact { path: String },
    /// Path must start with this prefix.
    Prefix { prefix: String },
}

impl PathMatch {
    /// Creates an exact path match.
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact { path: path.into() }
    }

    /// Creates a prefix path match.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix {
            prefix: prefix.into(),
        }
    }

    /// Checks if the path matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact { path: expected } => path == expected,
            PathMatch::Prefix { prefix } => path.starts_with(prefix.as_str()),
        }
    }

    /// Specificity rank: exact beats prefix, longer prefixes beat shorter.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PathMatch::Exact { path } => (2, path.len()),
            PathMatch::Prefix { prefix } => (1, prefix.len()),
        }
    }
}

/// The matching criteria attached to a route.
///
/// An absent condition matches everything, so a route may match on host
/// alone, path alone, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePredicate {
    /// Host condition, if any.
    pub host: Option<HostMatch>,
    /// Path condition, if any.
    pub path: Option<PathMatch>,
}

impl RoutePredicate {
    /// Checks whether the predicate matches the given host and path.
    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        if let Some(host_match) = &self.host {
            match host {
                Some(h) if host_match.matches(h) => {}
                _ => return false,
            }
        }
        if let Some(path_match) = &self.path {
            if !path_match.matches(path) {
                return false;
            }
        }
        true
    }

    fn specificity(&self) -> (u8, usize) {
        self.path.as_ref().map_or((0, 0), PathMatch::specificity)
    }
}

/// Where a route sends matched traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    /// A concrete endpoint, e.g. `http://127.0.0.1:8080`.
    Direct { uri: String },
    /// A logical service resolved through the server registry (`lb://name`).
    LoadBalanced { service: String },
}

impl RouteTarget {
    /// Parses a target URI string. `lb://name` becomes a load-balanced
    /// target; anything else is treated as a direct endpoint.
    pub fn parse(uri: &str) -> Self {
        match uri.strip_prefix("lb://") {
            Some(service) => RouteTarget::LoadBalanced {
                service: service.to_string(),
            },
            None => RouteTarget::Direct {
                uri: uri.to_string(),
            },
        }
    }
}

/// A single gateway route: predicate, filter chain, target, retry policy.
///
/// Immutable once published into a [`RouteTable`].
#[derive(Clone)]
pub struct Route {
    id: String,
    predicate: RoutePredicate,
    filters: Vec<Arc<dyn GatewayFilter>>,
    target: RouteTarget,
    retry: RetryConfig,
    timeout: Option<Duration>,
}

impl Route {
    /// Creates a route with the given id and target; matches everything
    /// until a predicate is attached.
    pub fn new(id: impl Into<String>, target: RouteTarget) -> Self {
        Self {
            id: id.into(),
            predicate: RoutePredicate::default(),
            filters: Vec::new(),
            target,
            retry: RetryConfig::default(),
            timeout: None,
        }
    }

    /// Sets the host condition.
    pub fn with_host(mut self, host: HostMatch) -> Self {
        self.predicate.host = Some(host);
        self
    }

    /// Sets the path condition.
    pub fn with_path(mut self, path: PathMatch) -> Self {
        self.predicate.path = Some(path);
        self
    }

    /// Appends a filter to the chain. Filters run in the order added.
    pub fn with_filter(mut self, filter: Arc<dyn GatewayFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the retry policy for this route.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets an overall deadline for requests on this route.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the route id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the route predicate.
    pub fn predicate(&self) -> &RoutePredicate {
        &self.predicate
    }

    /// Returns the ordered filter chain.
    pub fn filters(&self) -> &[Arc<dyn GatewayFilter>] {
        &self.filters
    }

    /// Returns the route target.
    pub fn target(&self) -> &RouteTarget {
        &self.target
    }

    /// Returns the retry policy.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the per-route deadline, if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("predicate", &self.predicate)
            .field("filters", &self.filters.len())
            .field("target", &self.target)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An immutable snapshot of published routes, ordered by specificity.
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds a table from routes, sorting by specificity (exact path,
    /// then longest prefix) with registration order breaking ties.
    pub fn publish(routes: Vec<Route>) -> Arc<Self> {
        let mut indexed: Vec<(usize, Route)> = routes.into_iter().enumerate().collect();
        indexed.sort_by(|(ai, a), (bi, b)| {
            b.predicate
                .specificity()
                .cmp(&a.predicate.specificity())
                .then(ai.cmp(bi))
        });
        Arc::new(Self {
            routes: indexed.into_iter().map(|(_, r)| r).collect(),
        })
    }

    /// Finds the most specific route matching the request.
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<&Route> {
        for route in &self.routes {
            if route.predicate.matches(host, path) {
                debug!(route = %route.id, path = %path, "matched route");
                return Some(route);
            }
        }
        debug!(path = %path, "no matching route found");
        None
    }

    /// Returns all routes in evaluation order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Returns the number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if there are no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
