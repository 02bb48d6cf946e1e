use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SimError;

/// Priority class of a request. Fast-track dominates high-prio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    FastTrack,
    HighPrio,
    LowPrio,
}

impl std::fmt::Display for RequestClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestClass::FastTrack => write!(f, "fast-track"),
            RequestClass::HighPrio => write!(f, "high-prio"),
            RequestClass::LowPrio => write!(f, "low-prio"),
        }
    }
}

/// A single client call in flight.
///
/// Clones share the attempt counter, the cancellation flag, and the
/// response channel, so the ingress can keep one clone for cancellation
/// and re-pushes while another travels through the queue to a worker.
#[derive(Debug, Clone)]
pub struct SimRequest {
    pub id: String,
    pub payload: Bytes,
    pub is_high_prio: bool,
    pub is_fast_track: bool,
    pub created_at: Instant,
    tries: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    cancel: CancellationToken,
    response_tx: mpsc::Sender<SimResponse>,
}

impl SimRequest {
    /// Builds a request and the receiving half of its response channel.
    ///
    /// The channel has a single buffered slot: the first successful send
    /// wins and later sends are rejected without blocking.
    pub fn new(
        cancel: CancellationToken,
        id: impl Into<String>,
        payload: Bytes,
        is_high_prio: bool,
        is_fast_track: bool,
    ) -> (Self, mpsc::Receiver<SimResponse>) {
        let (response_tx, response_rx) = mpsc::channel(1);
        let request = Self {
            id: id.into(),
            payload,
            is_high_prio,
            is_fast_track,
            created_at: Instant::now(),
            tries: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel,
            response_tx,
        };
        (request, response_rx)
    }

    pub fn class(&self) -> RequestClass {
        if self.is_fast_track {
            RequestClass::FastTrack
        } else if self.is_high_prio {
            RequestClass::HighPrio
        } else {
            RequestClass::LowPrio
        }
    }

    /// Attempts a non-blocking delivery of the response.
    ///
    /// Returns false if the slot is already filled or the receiver is
    /// gone. Never blocks a worker.
    pub fn send_response(&self, response: SimResponse) -> bool {
        self.response_tx.try_send(response).is_ok()
    }

    /// Flags the request as abandoned. Workers that pop a cancelled
    /// request drop it without contacting a backend and without
    /// responding.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Cancellation handle propagated into the outbound proxy call.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Increments the attempt counter and returns the new value.
    pub fn bump_tries(&self) -> u32 {
        self.tries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tries(&self) -> u32 {
        self.tries.load(Ordering::Relaxed)
    }

    /// Time spent since the request was created, used for the queue-age
    /// timeout check. A re-pushed retry keeps its original creation time.
    pub fn queue_age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Result of one proxy attempt, delivered through the response channel.
#[derive(Debug, Clone)]
pub struct SimResponse {
    pub payload: Bytes,
    /// Backend status code; 0 when no backend response was received.
    pub status_code: u16,
    pub error: Option<SimError>,
    pub should_retry: bool,
    pub node_uri: String,
    pub sim_duration: Duration,
    pub sim_at: Option<SystemTime>,
}

impl SimResponse {
    pub fn success(
        payload: Bytes,
        status_code: u16,
        node_uri: impl Into<String>,
        sim_duration: Duration,
        sim_at: SystemTime,
    ) -> Self {
        Self {
            payload,
            status_code,
            error: None,
            should_retry: false,
            node_uri: node_uri.into(),
            sim_duration,
            sim_at: Some(sim_at),
        }
    }

    pub fn failure(error: SimError, node_uri: impl Into<String>) -> Self {
        let (status_code, payload) = match &error {
            SimError::ProxyStatus { status, body } => (*status, body.clone()),
            _ => (0, Bytes::new()),
        };
        let should_retry = error.is_retryable();
        Self {
            payload,
            status_code,
            error: Some(error),
            should_retry,
            node_uri: node_uri.into(),
            sim_duration: Duration::ZERO,
            sim_at: None,
        }
    }
}
