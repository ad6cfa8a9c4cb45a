//! Upstream server pools and selection.
//!
//! A [`ServerPool`] is a named collection of candidate endpoints for a
//! logical service. The [`ServerRegistry`] maps service names to pools and
//! resolves route targets to concrete servers, honoring a per-exchange
//! exclusion set so retries can avoid servers that already failed.
//!
//! Pools are replaced wholesale on publish; in-flight exchanges keep the
//! snapshot they started with.

use crate::error::{GatewayError, Result};
use crate::route::RouteTarget;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A concrete network endpoint belonging to a service pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    /// URI scheme, e.g. `http`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl Server {
    /// Creates an `http` server endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
        }
    }

    /// Creates a server with an explicit scheme.
    pub fn with_scheme(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses a direct endpoint URI such as `http://127.0.0.1:8080`.
    pub fn parse_uri(uri: &str) -> Option<Self> {
        let parsed: http::Uri = uri.parse().ok()?;
        let scheme = parsed.scheme_str().unwrap_or("http").to_string();
        let host = parsed.host()?.to_string();
        let port = parsed
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        Some(Self { scheme, host, port })
    }

    /// Stable identifier used for exclusion sets, `host:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URI for requests to this server, e.g. `http://host:port`.
    pub fn base_uri(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_uri())
    }
}

/// Selection strategy over the eligible servers of a pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle through eligible servers in order.
    #[default]
    RoundRobin,
    /// Pick an eligible server at random.
    Random,
}

/// A named, ordered collection of candidate servers for one service.
#[derive(Debug)]
pub struct ServerPool {
    name: String,
    servers: Vec<Arc<Server>>,
    strategy: SelectionStrategy,
    next_index: AtomicUsize,
}

impl ServerPool {
    /// Creates a pool with the default round-robin strategy.
    pub fn new(name: impl Into<String>, servers: Vec<Server>) -> Self {
        Self::with_strategy(name, servers, SelectionStrategy::default())
    }

    /// Creates a pool with an explicit selection strategy.
    pub fn with_strategy(
        name: impl Into<String>,
        servers: Vec<Server>,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            servers: servers.into_iter().map(Arc::new).collect(),
            strategy,
            next_index: AtomicUsize::new(0),
        }
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all servers in the pool.
    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// Selects one server not present in `exclude`, or `None` when the
    /// pool is empty or every entry is excluded.
    pub fn select(&self, exclude: &HashSet<String>) -> Option<Arc<Server>> {
        let eligible: Vec<&Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| !exclude.contains(&s.id()))
            .collect();

        if eligible.is_empty() {
            warn!(pool = %self.name, "no eligible servers");
            return None;
        }

        let idx = match self.strategy {
            SelectionStrategy::RoundRobin => {
                self.next_index.fetch_add(1, Ordering::Relaxed) % eligible.len()
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..eligible.len()),
        };

        Some(Arc::clone(eligible[idx]))
    }
}

/// Registry of server pools keyed by service name.
///
/// Discovery publishes whole-pool snapshots; `changes()` exposes a watch
/// channel that ticks on every publish so embedders can react to refreshes.
pub struct ServerRegistry {
    pools: DashMap<String, Arc<ServerPool>>,
    version_tx: watch::Sender<u64>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            pools: DashMap::new(),
            version_tx,
        }
    }

    /// Publishes (or replaces) the pool for a service.
    pub fn publish(&self, pool: ServerPool) {
        debug!(pool = %pool.name(), servers = pool.servers().len(), "publishing server pool");
        self.pools.insert(pool.name().to_string(), Arc::new(pool));
        self.version_tx.send_modify(|v| *v += 1);
    }

    /// Removes the pool for a service.
    pub fn remove(&self, name: &str) -> Option<Arc<ServerPool>> {
        let removed = self.pools.remove(name).map(|(_, pool)| pool);
        if removed.is_some() {
            self.version_tx.send_modify(|v| *v += 1);
        }
        removed
    }

    /// Returns the current pool snapshot for a service.
    pub fn pool(&self, name: &str) -> Option<Arc<ServerPool>> {
        self.pools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Subscribes to pool refreshes; the value ticks on every publish.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Resolves a route target to a concrete server.
    ///
    /// Direct targets resolve as identity. Load-balanced targets consult
    /// the named pool, skipping anything in `exclude`. An empty or fully
    /// excluded pool is `Unavailable`, which callers must treat as distinct
    /// from an upstream HTTP failure.
    pub fn resolve(&self, target: &RouteTarget, exclude: &HashSet<String>) -> Result<Arc<Server>> {
        match target {
            RouteTarget::Direct { uri } => {
                Server::parse_uri(uri)
                    .map(Arc::new)
                    .ok_or_else(|| GatewayError::Unavailable {
                        service: uri.clone(),
                    })
            }
            RouteTarget::LoadBalanced { service } => self
                .pool(service)
                .and_then(|pool| pool.select(exclude))
                .ok_or_else(|| GatewayError::Unavailable {
                    service: service.clone(),
                }),
        }
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
