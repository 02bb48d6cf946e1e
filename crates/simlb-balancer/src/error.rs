use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::request::RequestClass;

/// Stage of the outbound proxy call at which a transport failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStage {
    /// Building the outbound HTTP request.
    Creating,
    /// Connecting to the backend or writing the request.
    Sending,
    /// Reading the response body.
    Decoding,
}

impl std::fmt::Display for ProxyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStage::Creating => write!(f, "creating"),
            ProxyStage::Sending => write!(f, "sending"),
            ProxyStage::Decoding => write!(f, "decoding"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SimError {
    /// The selected sub-queue is at capacity. Reported synchronously from
    /// push; everything else travels through the response channel.
    #[error("queue full: {0} queue is at capacity")]
    QueueFull(RequestClass),

    /// The request aged out in the queue before a worker picked it up.
    #[error("request timed out waiting in queue")]
    RequestTimeout,

    /// The outbound backend call exceeded its deadline.
    #[error("proxy request timed out after {0:?}")]
    ProxyTimeout(Duration),

    /// Connection, DNS, or read failure while talking to the backend.
    #[error("{stage} proxy request failed: {message}")]
    ProxyTransport { stage: ProxyStage, message: String },

    /// The backend answered with a ≥400 status. The body is carried so the
    /// caller can forward it verbatim.
    #[error("error in response - statusCode: {status} / {}", String::from_utf8_lossy(.body))]
    ProxyStatus { status: u16, body: Bytes },

    /// The request was cancelled before or during dispatch.
    #[error("request was cancelled")]
    Cancelled,

    /// Server-side transport failure (bind, accept loop).
    #[error("transport error: {0}")]
    Transport(String),
}

impl SimError {
    /// Whether re-enqueuing the same request may succeed.
    ///
    /// Transport failures and timeouts are transient; a 5xx means the
    /// backend itself is unwell and another node may do better. A 4xx is
    /// the client's problem and retrying would only repeat it.
    pub fn is_retryable(&self) -> bool {
        match self {
            SimError::ProxyTimeout(_) | SimError::ProxyTransport { .. } => true,
            SimError::ProxyStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
