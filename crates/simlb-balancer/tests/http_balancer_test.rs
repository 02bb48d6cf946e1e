//! Socket-level integration tests for the balancer.
//!
//! A mock execution backend and the balancer itself are served on
//! ephemeral ports and driven with a real HTTP client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::json;

use simlb_balancer::{BalancerConfig, HttpServer, NodePool};

// ============================================================================
// Mock Backend
// ============================================================================

/// A scripted execution backend: answers every POST with the configured
/// status and echoes the request body, optionally failing the first N
/// requests.
#[derive(Clone)]
struct MockBackend {
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    fail_first: Arc<AtomicUsize>,
}

async fn backend_handler(State(backend): State<MockBackend>, body: Bytes) -> impl IntoResponse {
    backend.hits.fetch_add(1, Ordering::SeqCst);

    if backend
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"overloaded"));
    }

    let status = StatusCode::from_u16(backend.status.load(Ordering::SeqCst)).unwrap();
    (status, body)
}

async fn spawn_backend() -> (String, MockBackend) {
    let backend = MockBackend {
        status: Arc::new(AtomicU16::new(200)),
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/", post(backend_handler))
        .with_state(backend.clone());
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), backend)
}

// ============================================================================
// Test Helpers
// ============================================================================

async fn spawn_balancer(config: BalancerConfig, node_uris: &[String]) -> (String, Arc<NodePool>) {
    let pool = Arc::new(NodePool::new(config));
    for uri in node_uris {
        pool.add_node(uri).await.unwrap();
    }
    let _checker = pool.clone().spawn_health_checker();

    let app = HttpServer::router(pool.clone());
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), pool)
}

fn test_config() -> BalancerConfig {
    BalancerConfig {
        num_workers: 2,
        max_retries: 2,
        request_timeout: Duration::from_secs(2),
        proxy_request_timeout: Duration::from_secs(2),
        health_check_interval: Duration::from_millis(200),
        health_check_timeout: Duration::from_millis(500),
        health_check_failure_threshold: 1,
        ..Default::default()
    }
}

fn rpc_body() -> String {
    json!({"jsonrpc": "2.0", "method": "eth_call", "params": [], "id": 1}).to_string()
}

// ============================================================================
// Proxy Round-Trip Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_roundtrip() {
    let (node_uri, backend) = spawn_backend().await;
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&balancer_uri)
        .body(rpc_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), rpc_body());
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_with_priority_headers() {
    let (node_uri, _backend) = spawn_backend().await;
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri]).await;

    let client = reqwest::Client::new();
    for header in ["x-fast-track", "x-high-priority"] {
        let response = client
            .post(&balancer_uri)
            .header(header, "1")
            .header("x-request-id", "prio-test")
            .body(rpc_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_transient_failure() {
    let (node_uri, backend) = spawn_backend().await;
    backend.fail_first.store(2, Ordering::SeqCst);
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&balancer_uri)
        .body(rpc_body())
        .send()
        .await
        .unwrap();

    // two 503s, then success within the retry cap
    assert_eq!(response.status(), 200);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_cap_exhausted() {
    let (node_uri, backend) = spawn_backend().await;
    backend.status.store(503, Ordering::SeqCst);
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&balancer_uri)
        .body(rpc_body())
        .send()
        .await
        .unwrap();

    // terminal failure forwards the backend status and body verbatim
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), rpc_body());
    // max_retries = 2 means three attempts in total
    assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_error_is_not_retried() {
    let (node_uri, backend) = spawn_backend().await;
    backend.status.store(400, Ordering::SeqCst);
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&balancer_uri)
        .body("not even json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "not even json");
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Queue Capacity Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_full_returns_429() {
    // no nodes, so pushed requests sit in the queue
    let config = BalancerConfig {
        max_low_prio: 1,
        ..test_config()
    };
    let (balancer_uri, _pool) = spawn_balancer(config, &[]).await;

    let client = reqwest::Client::new();

    // first request occupies the single low-prio slot
    let uri = balancer_uri.clone();
    let first_client = client.clone();
    let first = tokio::spawn(async move {
        first_client
            .post(&uri)
            .timeout(Duration::from_millis(500))
            .body("{}")
            .send()
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = client
        .post(&balancer_uri)
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);

    // the parked first request only ever times out client-side
    assert!(first.await.unwrap().is_err());
}

// ============================================================================
// Health / Admin Endpoint Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_endpoint() {
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[]).await;
    let response = reqwest::get(format!("{balancer_uri}__health"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_info_endpoint() {
    let (node_uri, _backend) = spawn_backend().await;
    let (balancer_uri, _pool) = spawn_balancer(test_config(), &[node_uri.clone()]).await;

    let info: serde_json::Value = reqwest::get(format!("{balancer_uri}__info"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(info["server_type"], "balancer");
    assert_eq!(info["queue"]["fast_track"], 0);
    assert_eq!(info["nodes"][0]["uri"], node_uri);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_registration_endpoints() {
    let (node_uri, _backend) = spawn_backend().await;
    let (balancer_uri, pool) = spawn_balancer(test_config(), &[]).await;
    assert_eq!(pool.node_count().await, 0);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{balancer_uri}__nodes"))
        .json(&json!({"uri": node_uri}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(pool.node_count().await, 1);

    let response = client
        .delete(format!("{balancer_uri}__nodes"))
        .query(&[("uri", node_uri.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(pool.node_count().await, 0);

    let response = client
        .delete(format!("{balancer_uri}__nodes"))
        .query(&[("uri", "http://nowhere/")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// ============================================================================
// Health Gating Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_node_recovers_when_backend_appears() {
    // register a node whose backend is not up yet
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let node_uri = format!("http://{addr}/");
    drop(listener);

    let (_balancer_uri, pool) = spawn_balancer(test_config(), &[node_uri]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.node_statuses().await[0].cur_workers, 0);

    // bring the backend up on the reserved address
    let app = Router::new().route("/", post(|body: Bytes| async move { body }));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // the health loop starts the workers once the probe succeeds
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(pool.node_statuses().await[0].cur_workers, 2);
}
