//! HTTP ingress for the balancer.
//!
//! Accepts opaque JSON-RPC payloads on `POST /`, classifies their
//! priority from request headers, pushes them onto the shared queue and
//! relays the worker's response back to the client, re-pushing retryable
//! failures up to the configured cap.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SimError;
use crate::pool::NodePool;
use crate::request::SimRequest;

/// Header that puts a request in the fast-track class.
pub const FAST_TRACK_HEADER: &str = "x-fast-track";
/// Header that puts a request in the high-prio class.
pub const HIGH_PRIO_HEADER: &str = "x-high-priority";
/// Optional client-supplied correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct HttpServer {
    pool: Arc<NodePool>,
}

impl HttpServer {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Self { pool }
    }

    /// Builds the axum router. Exposed separately so tests can serve it
    /// on an ephemeral port.
    pub fn router(pool: Arc<NodePool>) -> axum::Router {
        axum::Router::new()
            .route("/", post(handle_proxy))
            .route("/__health", get(handle_health))
            .route("/__info", get(handle_info))
            .route("/__nodes", post(handle_add_node).delete(handle_remove_node))
            .layer(CorsLayer::permissive())
            .with_state(pool)
    }

    pub async fn run(self, addr: SocketAddr) -> Result<(), SimError> {
        let app = Self::router(self.pool);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SimError::Transport(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SimError::Transport(format!("failed to get local addr: {e}")))?;
        info!("balancer HTTP server listening on {local_addr}");

        axum::serve(listener, app)
            .await
            .map_err(|e| SimError::Transport(format!("server error: {e}")))?;
        Ok(())
    }
}

/// Cancels the request when the handler future is dropped, which is how
/// axum signals a client disconnect. Cancelling after a delivered
/// response is harmless.
struct DisconnectGuard {
    request: SimRequest,
    token: CancellationToken,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.request.cancel();
        self.token.cancel();
    }
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers.contains_key(name)
}

async fn handle_proxy(
    State(pool): State<Arc<NodePool>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_fast_track = header_flag(&headers, FAST_TRACK_HEADER);
    let is_high_prio = header_flag(&headers, HIGH_PRIO_HEADER);
    let id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let token = CancellationToken::new();
    let (request, mut response_rx) =
        SimRequest::new(token.clone(), id.clone(), body, is_high_prio, is_fast_track);
    let _guard = DisconnectGuard {
        request: request.clone(),
        token,
    };

    let queue = pool.queue();
    if let Err(err) = queue.push(request.clone()).await {
        return (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response();
    }

    let max_retries = pool.config().max_retries;
    loop {
        let Some(response) = response_rx.recv().await else {
            return (
                StatusCode::BAD_GATEWAY,
                "response channel closed".to_string(),
            )
                .into_response();
        };

        let Some(error) = response.error else {
            debug!(req_id = %id, node = %response.node_uri, duration_us = response.sim_duration.as_micros() as u64, "request served");
            let status = StatusCode::from_u16(response.status_code)
                .unwrap_or(StatusCode::OK);
            return (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                response.payload,
            )
                .into_response();
        };

        if response.should_retry && request.tries() <= max_retries {
            debug!(req_id = %id, tries = request.tries(), %error, "retrying request");
            match queue.push(request.clone()).await {
                Ok(()) => continue,
                Err(err) => {
                    warn!(req_id = %id, %err, "re-push failed, queue full");
                    return (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response();
                }
            }
        }

        return error_response(&id, error, response.payload);
    }
}

/// Maps a terminal failure onto the client-visible status code.
fn error_response(id: &str, error: SimError, payload: Bytes) -> Response {
    match error {
        SimError::ProxyStatus { status, .. } => {
            // backend status and body are forwarded verbatim
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, payload).into_response()
        }
        SimError::RequestTimeout | SimError::ProxyTimeout(_) => {
            (StatusCode::GATEWAY_TIMEOUT, error.to_string()).into_response()
        }
        SimError::QueueFull(_) => {
            (StatusCode::TOO_MANY_REQUESTS, error.to_string()).into_response()
        }
        other => {
            warn!(req_id = %id, %other, "request failed");
            (StatusCode::BAD_GATEWAY, other.to_string()).into_response()
        }
    }
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_info(State(pool): State<Arc<NodePool>>) -> impl IntoResponse {
    let queue = pool.queue();
    Json(json!({
        "server_type": "balancer",
        "queue": queue.stats().await,
        "nodes": pool.node_statuses().await,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct NodeSpec {
    uri: String,
}

async fn handle_add_node(
    State(pool): State<Arc<NodePool>>,
    Json(spec): Json<NodeSpec>,
) -> Response {
    match pool.add_node(&spec.uri).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn handle_remove_node(
    State(pool): State<Arc<NodePool>>,
    Query(spec): Query<NodeSpec>,
) -> Response {
    if pool.remove_node(&spec.uri).await {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown node").into_response()
    }
}
