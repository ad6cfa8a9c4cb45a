//! HTTP gateway core: routing, filter chains, and retry over
//! load-balanced upstream pools.
//!
//! Requests are matched against a published route table, flow through the
//! route's filter chain, and terminate in a retry coordinator that selects
//! an upstream server and replays the buffered request body on retryable
//! failures. Transport (server and client) stays at the edges: embed the
//! engine behind [`service::GatewayService`] and point it at an
//! [`client::UpstreamClient`].

pub mod client;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod retry;
pub mod route;
pub mod service;
pub mod upstream;
