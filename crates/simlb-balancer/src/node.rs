use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use reqwest::header;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BalancerConfig;
use crate::error::{ProxyStage, Result, SimError};
use crate::queue::PrioQueue;
use crate::request::{SimRequest, SimResponse};

/// How often `stop_workers_and_wait` re-checks the live worker counter.
const WORKER_DRAIN_POLL: Duration = Duration::from_millis(100);

/// One backend URI served by a set of worker tasks.
///
/// Workers pop from a shared queue that is injected at start time; the
/// node itself only owns the outbound HTTP client, the worker
/// cancellation handle, and its counters. The client is shared across
/// the node's workers and is safe for concurrent use.
pub struct Node {
    uri: String,
    added_at: SystemTime,
    num_workers: usize,
    cur_workers: Arc<AtomicUsize>,
    consecutive_failures: AtomicU32,
    workers: Mutex<Option<CancellationToken>>,
    client: reqwest::Client,
    request_timeout: Duration,
    proxy_request_timeout: Duration,
    health_check_timeout: Duration,
    health_probe: Bytes,
}

/// Snapshot of a node's state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub uri: String,
    pub num_workers: usize,
    pub cur_workers: usize,
    pub consecutive_failures: u32,
}

impl Node {
    pub fn new(uri: impl Into<String>, config: &BalancerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SimError::Transport(e.to_string()))?;
        Ok(Self {
            uri: uri.into(),
            added_at: SystemTime::now(),
            num_workers: config.num_workers,
            cur_workers: Arc::new(AtomicUsize::new(0)),
            consecutive_failures: AtomicU32::new(0),
            workers: Mutex::new(None),
            client,
            request_timeout: config.request_timeout,
            proxy_request_timeout: config.proxy_request_timeout,
            health_check_timeout: config.health_check_timeout,
            health_probe: Bytes::from(config.health_probe.clone()),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn added_at(&self) -> SystemTime {
        self.added_at
    }

    pub fn cur_workers(&self) -> usize {
        self.cur_workers.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            uri: self.uri.clone(),
            num_workers: self.num_workers,
            cur_workers: self.cur_workers(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_probe_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_probe_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Spawns the proxy worker tasks. Workers that are already running
    /// are cancelled and replaced.
    pub async fn start_workers(self: Arc<Self>, queue: Arc<PrioQueue>) {
        let mut workers = self.workers.lock().await;
        if let Some(token) = workers.take() {
            token.cancel();
        }

        let token = CancellationToken::new();
        for id in 1..=self.num_workers {
            let node = self.clone();
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move {
                node.run_worker(id, queue, token).await;
            });
        }
        *workers = Some(token);
    }

    /// Signals cancellation to the worker set and returns immediately.
    /// Repeated calls are no-ops.
    pub async fn stop_workers(&self) {
        if let Some(token) = self.workers.lock().await.take() {
            token.cancel();
        }
    }

    /// Signals cancellation and polls the live worker counter until the
    /// last worker has exited, so the node can be removed without losing
    /// in-flight requests.
    pub async fn stop_workers_and_wait(&self) {
        self.stop_workers().await;
        while self.cur_workers() > 0 {
            tokio::time::sleep(WORKER_DRAIN_POLL).await;
        }
    }

    async fn run_worker(&self, id: usize, queue: Arc<PrioQueue>, token: CancellationToken) {
        info!(uri = %self.uri, id, "starting proxy node worker");
        self.cur_workers.fetch_add(1, Ordering::Relaxed);

        loop {
            // Cancellation is only checked between iterations: an
            // in-flight proxy call must complete or time out on its own.
            let request = tokio::select! {
                _ = token.cancelled() => break,
                popped = queue.pop() => match popped {
                    Some(request) => request,
                    None => break,
                },
            };
            self.process(request).await;
        }

        self.cur_workers.fetch_sub(1, Ordering::Relaxed);
        info!(uri = %self.uri, id, "node worker stopped");
    }

    async fn process(&self, request: SimRequest) {
        debug!(req_id = %request.id, "processing request");

        if request.is_cancelled() {
            info!(req_id = %request.id, "request was cancelled before processing");
            return;
        }

        if request.queue_age() > self.request_timeout {
            info!(req_id = %request.id, "request timed out before processing");
            request.send_response(SimResponse::failure(SimError::RequestTimeout, &self.uri));
            return;
        }

        request.bump_tries();
        let sim_at = SystemTime::now();
        let started = Instant::now();
        let result = self
            .proxy_request(
                request.cancel_token(),
                request.payload.clone(),
                self.proxy_request_timeout,
            )
            .await;
        let duration = started.elapsed();

        match result {
            Ok((payload, status_code)) => {
                debug!(req_id = %request.id, duration_us = duration.as_micros() as u64, "request processed, sending response");
                let sent = request.send_response(SimResponse::success(
                    payload, status_code, &self.uri, duration, sim_at,
                ));
                if !sent {
                    warn!(
                        req_id = %request.id,
                        sec_since_created = request.queue_age().as_secs_f64(),
                        "couldn't send node response to client"
                    );
                }
            }
            Err(err) => {
                match &err {
                    SimError::ProxyTimeout(_) | SimError::Cancelled => {
                        info!(uri = %self.uri, req_id = %request.id, %err, "node proxy request cut short")
                    }
                    _ => error!(uri = %self.uri, req_id = %request.id, %err, "node proxy request error"),
                }
                request.send_response(SimResponse::failure(err, &self.uri));
            }
        }
    }

    /// Issues the configured JSON-RPC probe; success means the node is
    /// ready to accept work.
    pub async fn health_check(&self) -> Result<()> {
        self.proxy_request(
            &CancellationToken::new(),
            self.health_probe.clone(),
            self.health_check_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Performs one outbound POST, bounded by the given timeout and by
    /// the caller's cancellation handle.
    ///
    /// The body is returned even on a ≥400 status (inside `ProxyStatus`)
    /// so the caller can forward it verbatim.
    pub async fn proxy_request(
        &self,
        cancel: &CancellationToken,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(Bytes, u16)> {
        let send = async {
            let response = self
                .client
                .post(&self.uri)
                .header(header::ACCEPT, "application/json")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, payload.len())
                .timeout(timeout)
                .body(payload)
                .send()
                .await
                .map_err(|e| classify_send_error(e, timeout))?;

            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    SimError::ProxyTimeout(timeout)
                } else {
                    SimError::ProxyTransport {
                        stage: ProxyStage::Decoding,
                        message: e.to_string(),
                    }
                }
            })?;

            if status >= 400 {
                return Err(SimError::ProxyStatus { status, body });
            }
            Ok((body, status))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(SimError::Cancelled),
            result = send => result,
        }
    }
}

fn classify_send_error(err: reqwest::Error, timeout: Duration) -> SimError {
    if err.is_timeout() {
        SimError::ProxyTimeout(timeout)
    } else if err.is_builder() {
        SimError::ProxyTransport {
            stage: ProxyStage::Creating,
            message: err.to_string(),
        }
    } else {
        SimError::ProxyTransport {
            stage: ProxyStage::Sending,
            message: err.to_string(),
        }
    }
}
