//! # simlb CLI Entry Point
//!
//! Starts the prioritized JSON-RPC load balancer: one shared three-class
//! queue, a worker set per backend node, periodic health checks, and the
//! HTTP ingress.
//!
//! ## Usage
//!
//! ```bash
//! # Balance across two backends, four workers each
//! simlb -b 0.0.0.0:8080 -n http://127.0.0.1:8545 -n http://127.0.0.1:8546
//!
//! # Bounded queues with a 2:1 fast-track/high-prio interleave
//! simlb -n http://127.0.0.1:8545 \
//!   --max-fast-track 100 --max-high-prio 500 --max-low-prio 1000 \
//!   --high-prio-per-fast-track 2
//! ```
//!
//! Clients POST opaque JSON-RPC bodies to `/`; the `x-fast-track` and
//! `x-high-priority` headers select the priority class.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;

use simlb_balancer::{BalancerConfig, HttpServer, NodePool, DEFAULT_HEALTH_PROBE};

/// Validates that a URL string starts with http:// or https://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[derive(FromArgs)]
/// simlb - prioritized load balancer for JSON-RPC execution backends
struct Cli {
    /// address to bind the balancer's HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// backend node URI to proxy to (repeatable)
    ///
    /// Must include the http:// or https:// prefix
    /// (e.g., http://127.0.0.1:8545).
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// worker tasks per node
    ///
    /// Each worker proxies one request at a time, so this is the per-node
    /// concurrency limit. Defaults to 4.
    #[argh(option, long = "num-workers", default = "4")]
    num_workers: usize,

    /// fast-track queue capacity; 0 means unbounded
    #[argh(option, long = "max-fast-track", default = "0")]
    max_fast_track: usize,

    /// high-prio queue capacity; 0 means unbounded
    #[argh(option, long = "max-high-prio", default = "0")]
    max_high_prio: usize,

    /// low-prio queue capacity; 0 means unbounded
    #[argh(option, long = "max-low-prio", default = "0")]
    max_low_prio: usize,

    /// interleaving ratio between fast-track and high-prio pops
    ///
    /// With 1 the queue alternates fast-track and high-prio; with 2 it
    /// serves two fast-track requests per high-prio one. Defaults to 1.
    #[argh(option, long = "high-prio-per-fast-track", default = "1")]
    high_prio_per_fast_track: u64,

    /// fully drain fast-track before considering high-prio
    #[argh(switch, long = "drain-fast-track-first")]
    drain_fast_track_first: bool,

    /// maximum age in milliseconds a request may reach in the queue
    ///
    /// Requests older than this are discarded by workers unexecuted.
    /// Defaults to 10000ms.
    #[argh(option, long = "request-timeout-ms", default = "10000")]
    request_timeout_ms: u64,

    /// timeout in milliseconds for one outbound backend call
    ///
    /// Defaults to 10000ms.
    #[argh(option, long = "proxy-timeout-ms", default = "10000")]
    proxy_timeout_ms: u64,

    /// re-pushes allowed for a retryable failure
    ///
    /// Total attempts per request are this plus one. Defaults to 3.
    #[argh(option, long = "max-retries", default = "3")]
    max_retries: u32,

    /// interval between health checks in seconds
    ///
    /// Defaults to 5 seconds.
    #[argh(option, long = "health-check-interval", default = "5")]
    health_check_interval_secs: u64,

    /// timeout for each health check in milliseconds
    ///
    /// Defaults to 5000ms.
    #[argh(option, long = "health-check-timeout-ms", default = "5000")]
    health_check_timeout_ms: u64,

    /// consecutive health check failures before a node's workers stop
    ///
    /// The node stays registered and its workers restart when the probe
    /// succeeds again. Defaults to 3.
    #[argh(option, long = "health-check-failure-threshold", default = "3")]
    health_check_failure_threshold: u32,

    /// JSON-RPC payload used as the health probe
    ///
    /// Defaults to a net_version call.
    #[argh(option, long = "health-probe")]
    health_probe: Option<String>,
}

impl Cli {
    fn balancer_config(&self) -> BalancerConfig {
        BalancerConfig {
            num_workers: self.num_workers,
            max_fast_track: self.max_fast_track,
            max_high_prio: self.max_high_prio,
            max_low_prio: self.max_low_prio,
            high_prio_per_fast_track: self.high_prio_per_fast_track,
            fast_track_drain_first: self.drain_fast_track_first,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            proxy_request_timeout: Duration::from_millis(self.proxy_timeout_ms),
            max_retries: self.max_retries,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            health_check_failure_threshold: self.health_check_failure_threshold,
            health_probe: self
                .health_probe
                .clone()
                .unwrap_or_else(|| DEFAULT_HEALTH_PROBE.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    for node_uri in &cli.nodes {
        validate_http_url(node_uri, "node address")?;
    }
    if cli.nodes.is_empty() {
        tracing::warn!("No nodes specified! Use --node <uri> to add nodes.");
    }

    let addr: SocketAddr = cli
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", cli.bind, e))?;

    tracing::info!("Starting simlb balancer");
    tracing::info!("Binding to: {}", cli.bind);
    tracing::info!("Nodes: {:?}", cli.nodes);

    let pool = Arc::new(NodePool::new(cli.balancer_config()));
    for node_uri in &cli.nodes {
        if let Err(e) = pool.add_node(node_uri).await {
            tracing::error!("Failed to register node {}: {}", node_uri, e);
        }
    }

    let _health_checker_handle = pool.clone().spawn_health_checker();
    tracing::info!("Balancer created with {} nodes", pool.node_count().await);

    let server = HttpServer::new(pool.clone());
    tokio::select! {
        result = server.run(addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, draining queue and workers");
            pool.shutdown().await;
        }
    }

    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_defaults() {
        let cli: Cli = Cli::from_args(&["simlb"], &[]).unwrap();
        assert_eq!(cli.bind, "0.0.0.0:8080");
        assert!(cli.nodes.is_empty());
        assert_eq!(cli.num_workers, 4);
        assert_eq!(cli.max_fast_track, 0);
        assert_eq!(cli.high_prio_per_fast_track, 1);
        assert!(!cli.drain_fast_track_first);
        assert_eq!(cli.request_timeout_ms, 10000);
        assert_eq!(cli.proxy_timeout_ms, 10000);
        assert_eq!(cli.max_retries, 3);
        assert_eq!(cli.health_check_interval_secs, 5);
        assert!(cli.health_probe.is_none());
    }

    #[test]
    fn test_cli_parse_multiple_nodes() {
        let cli: Cli = Cli::from_args(
            &["simlb"],
            &[
                "--node",
                "http://127.0.0.1:8545",
                "--node",
                "http://127.0.0.1:8546",
            ],
        )
        .unwrap();
        assert_eq!(
            cli.nodes,
            vec![
                "http://127.0.0.1:8545".to_string(),
                "http://127.0.0.1:8546".to_string(),
            ]
        );
    }

    #[test]
    fn test_cli_parse_queue_options() {
        let cli: Cli = Cli::from_args(
            &["simlb"],
            &[
                "-n",
                "http://127.0.0.1:8545",
                "--max-fast-track",
                "100",
                "--max-high-prio",
                "500",
                "--max-low-prio",
                "1000",
                "--high-prio-per-fast-track",
                "2",
                "--drain-fast-track-first",
            ],
        )
        .unwrap();

        let config = cli.balancer_config();
        assert_eq!(config.max_fast_track, 100);
        assert_eq!(config.max_high_prio, 500);
        assert_eq!(config.max_low_prio, 1000);
        assert_eq!(config.high_prio_per_fast_track, 2);
        assert!(config.fast_track_drain_first);
    }

    #[test]
    fn test_cli_parse_timeouts() {
        let cli: Cli = Cli::from_args(
            &["simlb"],
            &[
                "--request-timeout-ms",
                "2500",
                "--proxy-timeout-ms",
                "1500",
                "--health-check-interval",
                "10",
                "--health-check-timeout-ms",
                "2000",
                "--health-check-failure-threshold",
                "5",
            ],
        )
        .unwrap();

        let config = cli.balancer_config();
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.proxy_request_timeout, Duration::from_millis(1500));
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.health_check_timeout, Duration::from_millis(2000));
        assert_eq!(config.health_check_failure_threshold, 5);
    }

    #[test]
    fn test_cli_parse_custom_probe() {
        let probe = r#"{"jsonrpc":"2.0","method":"web3_clientVersion","params":[],"id":1}"#;
        let cli: Cli = Cli::from_args(&["simlb"], &["--health-probe", probe]).unwrap();
        assert_eq!(cli.balancer_config().health_probe, probe);
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:8545", "node address").is_ok());
        assert!(validate_http_url("https://rpc.example.com", "node address").is_ok());
        assert!(validate_http_url("127.0.0.1:8545", "node address").is_err());
        assert!(validate_http_url("ws://127.0.0.1:8545", "node address").is_err());
    }
}
