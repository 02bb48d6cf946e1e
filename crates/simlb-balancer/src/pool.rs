use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BalancerConfig;
use crate::error::Result;
use crate::node::{Node, NodeStatus};
use crate::queue::PrioQueue;

/// Owns the single shared queue and the set of backend nodes, and runs
/// the periodic health checks that gate each node's worker set.
pub struct NodePool {
    queue: Arc<PrioQueue>,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    config: BalancerConfig,
    shutdown: CancellationToken,
}

impl NodePool {
    pub fn new(config: BalancerConfig) -> Self {
        let queue = Arc::new(PrioQueue::new(
            config.max_fast_track,
            config.max_high_prio,
            config.max_low_prio,
            config.high_prio_per_fast_track,
            config.fast_track_drain_first,
        ));
        Self {
            queue,
            nodes: RwLock::new(HashMap::new()),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> Arc<PrioQueue> {
        self.queue.clone()
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Registers a backend and probes it once: a healthy node gets its
    /// workers started immediately, an unhealthy one stays registered
    /// with workers held until the health loop sees it recover.
    /// Duplicate URIs are ignored.
    pub async fn add_node(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        {
            let nodes = self.nodes.read().await;
            if nodes.contains_key(&uri) {
                warn!(%uri, "node already registered, ignoring");
                return Ok(());
            }
        }

        let node = Arc::new(Node::new(&uri, &self.config)?);
        match node.health_check().await {
            Ok(()) => {
                info!(%uri, "node healthy, starting workers");
                node.clone().start_workers(self.queue.clone()).await;
            }
            Err(err) => {
                warn!(%uri, %err, "node joins pool unhealthy, holding workers until it recovers");
                node.record_probe_failure();
            }
        }

        self.nodes.write().await.insert(uri, node);
        Ok(())
    }

    /// Stops the node's workers, waits for in-flight requests to finish,
    /// and removes it. Returns false if the URI is unknown.
    pub async fn remove_node(&self, uri: &str) -> bool {
        let removed = self.nodes.write().await.remove(uri);
        match removed {
            Some(node) => {
                info!(%uri, "draining node before removal");
                node.stop_workers_and_wait().await;
                true
            }
            None => false,
        }
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn node_uris(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    pub async fn node_statuses(&self) -> Vec<NodeStatus> {
        self.nodes
            .read()
            .await
            .values()
            .map(|node| node.status())
            .collect()
    }

    /// Starts the background health-check loop.
    pub fn spawn_health_checker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.health_check_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = interval.tick() => self.check_all_nodes().await,
                }
            }
        })
    }

    /// Probes every node in parallel and starts or stops worker sets
    /// based on the results.
    async fn check_all_nodes(&self) {
        let nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();

        let checks = nodes.iter().map(|node| {
            let node = node.clone();
            async move {
                let result = node.health_check().await;
                (node, result)
            }
        });
        let results = futures::future::join_all(checks).await;

        for (node, result) in results {
            match result {
                Ok(()) => {
                    node.reset_probe_failures();
                    if node.cur_workers() == 0 {
                        info!(uri = %node.uri(), "node recovered, starting workers");
                        node.clone().start_workers(self.queue.clone()).await;
                    }
                }
                Err(err) => {
                    let failures = node.record_probe_failure();
                    if failures >= self.config.health_check_failure_threshold
                        && node.cur_workers() > 0
                    {
                        warn!(
                            uri = %node.uri(),
                            failures,
                            %err,
                            "node failed health checks, stopping workers"
                        );
                        node.stop_workers().await;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: stop the health loop, refuse new pushes, drain
    /// the queue, then stop every node's workers and wait for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.close_and_wait().await;
        let nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();
        for node in nodes {
            node.stop_workers_and_wait().await;
        }
        info!("node pool drained and stopped");
    }
}
