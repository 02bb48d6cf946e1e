//! simlb balancer
//!
//! A prioritized load balancer that sits in front of a fleet of
//! interchangeable JSON-RPC execution backends and dispatches client
//! requests to them under three levers: request priority, per-node
//! concurrency, and node health.
//!
//! # Architecture
//!
//! Two tightly coupled subsystems make up the core:
//!
//! 1. **[`PrioQueue`]**: a three-class FIFO (fast-track, high-prio,
//!    low-prio) with a configurable interleaving policy between the top
//!    two classes, blocking pop semantics, and bounded capacities. It is
//!    the single source of truth for pending work.
//! 2. **[`NodePool`]**: a set of [`Node`]s, each running a configurable
//!    number of worker tasks that pop from the shared queue and proxy one
//!    request at a time to their backend. Periodic health checks stop a
//!    failing node's workers and restart them on recovery, so nodes can
//!    be added, drained, and removed without losing in-flight requests.
//!
//! Data flow: ingress → [`PrioQueue::push`] → some node's worker pops →
//! worker proxies to the backend → worker delivers a [`SimResponse`]
//! through the request's single-shot channel → ingress replies to the
//! client, re-pushing retryable failures up to a cap.
//!
//! The HTTP edge ([`HttpServer`]) is deliberately thin: it classifies
//! priority from headers, treats the JSON-RPC body as opaque bytes, and
//! maps failure kinds onto client-visible status codes.

pub mod config;
pub mod error;
pub mod http_server;
pub mod node;
pub mod pool;
pub mod queue;
pub mod request;

pub use config::{BalancerConfig, DEFAULT_HEALTH_PROBE};
pub use error::{ProxyStage, Result, SimError};
pub use http_server::HttpServer;
pub use node::{Node, NodeStatus};
pub use pool::NodePool;
pub use queue::{PrioQueue, QueueStats};
pub use request::{RequestClass, SimRequest, SimResponse};
