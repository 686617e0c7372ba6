//! HTTP API: pod admission, node state, health checks and Prometheus metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pinning_lib::{
    devicemanager::Device,
    health::{components, HealthRegistry},
    NodeResourceManager, NodeSnapshot, Pod,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub node: Arc<NodeResourceManager>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, node: Arc<NodeResourceManager>) -> Self {
        Self {
            health_registry,
            node,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: NodeSnapshot,
}

/// Marks the checkpoint component degraded and reports the error.
async fn checkpoint_failed(state: &AppState, err: &(dyn std::fmt::Display + Sync)) -> Response {
    let message = err.to_string();
    state
        .health_registry
        .set_degraded(components::CHECKPOINT, message.clone())
        .await;
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody { error: message }),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %err, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Run a synchronous node operation off the async workers; admission and
/// removal hold manager locks across checkpoint fsyncs.
async fn run_blocking<T, F>(state: &AppState, op: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&NodeResourceManager) -> T + Send + 'static,
{
    let node = state.node.clone();
    tokio::task::spawn_blocking(move || op(&node))
        .await
        .map_err(|err| {
            error!(error = %err, "Node operation panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        })
}

/// Admit a pod: 200 when admitted, 403 with the rejection reason otherwise
async fn admit(State(state): State<Arc<AppState>>, Json(pod): Json<Pod>) -> Response {
    let result = match run_blocking(&state, move |node| node.admit(&pod)).await {
        Ok(result) => result,
        Err(response) => return response,
    };

    if result.checkpoint_failed {
        state
            .health_registry
            .set_degraded(components::CHECKPOINT, "Failed to persist admission state")
            .await;
    }

    let status_code = if result.admit {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    (status_code, Json(result)).into_response()
}

async fn remove_pod(State(state): State<Arc<AppState>>, Path(uid): Path<String>) -> Response {
    match run_blocking(&state, move |node| node.remove_pod(&uid)).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err)) => checkpoint_failed(&state, &err).await,
        Err(response) => response,
    }
}

async fn node_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    Json(StateResponse {
        generated_at: Utc::now(),
        snapshot: state.node.snapshot(),
    })
}

/// Register (or replace) the devices of one extended resource
async fn register_devices(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
    Json(devices): Json<Vec<Device>>,
) -> Response {
    let registered =
        run_blocking(&state, move |node| node.register_devices(&resource, devices, None)).await;
    match registered {
        Ok(Ok(())) => {
            state.health_registry.set_healthy(components::CHECKPOINT).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Err(err)) => checkpoint_failed(&state, &err).await,
        Err(response) => response,
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/admit", post(admit))
        .route("/v1/pods/:uid", delete(remove_pod))
        .route("/v1/state", get(node_state))
        .route("/v1/devices/:resource", post(register_devices))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use pinning_lib::checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpointStore};
    use pinning_lib::topology::{CpuInfo, CpuTopology};
    use pinning_lib::topologymanager::PodAdmitResult;
    use pinning_lib::NodeResourceConfig;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    /// In-memory store whose writes can be switched to fail.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryCheckpointStore,
        fail_saves: AtomicBool,
    }

    impl CheckpointStore for FailingStore {
        fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, data: &[u8]) -> Result<(), CheckpointError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(CheckpointError::Io {
                    path: key.into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(key, data)
        }

        fn remove(&self, key: &str) -> Result<(), CheckpointError> {
            self.inner.remove(key)
        }
    }

    /// 2 sockets, 2 cores each, 2 threads per core, one NUMA node per socket.
    fn topology() -> CpuTopology {
        let cpus: BTreeMap<usize, CpuInfo> = (0..8)
            .map(|cpu| (cpu, CpuInfo::new(cpu % 2, cpu % 4, cpu % 2)))
            .collect();
        CpuTopology::new(cpus).unwrap()
    }

    async fn setup_test_app() -> (Router, Arc<AppState>) {
        setup_with_store(Arc::new(MemoryCheckpointStore::new())).await
    }

    async fn setup_with_store(store: Arc<dyn CheckpointStore>) -> (Router, Arc<AppState>) {
        let health_registry = HealthRegistry::new();
        for name in components::ALL {
            health_registry.register(name).await;
        }
        health_registry.set_ready(true).await;

        let node = NodeResourceManager::new(
            Arc::new(topology()),
            NodeResourceConfig::default(),
            store,
        )
        .unwrap();

        let state = Arc::new(AppState::new(health_registry, Arc::new(node)));
        (create_router(state.clone()), state)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn guaranteed_pod(uid: &str, cpus: &str) -> serde_json::Value {
        json!({
            "uid": uid,
            "name": format!("pod-{uid}"),
            "namespace": "default",
            "containers": [{
                "name": "app",
                "resources": {
                    "requests": {"cpu": cpus, "memory": "1Gi"},
                    "limits": {"cpu": cpus, "memory": "1Gi"}
                }
            }]
        })
    }

    #[tokio::test]
    async fn test_healthz_returns_ok_when_degraded() {
        let (app, state) = setup_test_app().await;
        state
            .health_registry
            .set_degraded(components::CHECKPOINT, "write failed")
            .await;

        let response = app.oneshot(get_request("/healthz")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = body_json(response).await;
        assert_eq!(health["status"], "degraded");
    }

    #[tokio::test]
    async fn test_healthz_returns_503_when_unhealthy() {
        let (app, state) = setup_test_app().await;
        state
            .health_registry
            .set_unhealthy(components::CPU_MANAGER, "invalid state")
            .await;

        let response = app.oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_before_restore() {
        let (app, state) = setup_test_app().await;
        state.health_registry.set_ready(false).await;

        let response = app.oneshot(get_request("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _state) = setup_test_app().await;

        let response = app.oneshot(get_request("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pinning_agent_shared_pool_cpus"));
    }

    #[tokio::test]
    async fn test_admit_and_remove_pod() {
        let (app, _state) = setup_test_app().await;

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/v1/admit", guaranteed_pod("p1", "2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: PodAdmitResult = body_json(response).await;
        assert!(result.admit);

        let response = app.clone().oneshot(get_request("/v1/state")).await.unwrap();
        let snapshot: serde_json::Value = body_json(response).await;
        assert!(snapshot["cpu_assignments"]["p1/app"].is_string());
        assert!(snapshot["generated_at"].is_string());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/v1/pods/p1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get_request("/v1/state")).await.unwrap();
        let snapshot: serde_json::Value = body_json(response).await;
        assert_eq!(snapshot["cpu_assignments"], json!({}));
    }

    #[tokio::test]
    async fn test_rejected_pod_returns_403() {
        let (app, _state) = setup_test_app().await;

        // Resource names carry a slash, so it is percent-encoded in the path.
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/v1/devices/vendor.com%2Fnic",
                json!([{"id": "nic0", "topology": [0]}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let mut pod = guaranteed_pod("p2", "1");
        pod["containers"][0]["resources"]["limits"]["vendor.com/nic"] = json!("2");
        let response = app
            .oneshot(json_request(Method::POST, "/v1/admit", pod))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let result: PodAdmitResult = body_json(response).await;
        assert!(!result.admit);
        assert_eq!(result.reason.as_deref(), Some("UnexpectedAdmissionError"));
    }

    #[tokio::test]
    async fn test_admission_checkpoint_failure_degrades_health() {
        let store = Arc::new(FailingStore::default());
        let (app, state) = setup_with_store(store.clone()).await;
        store.fail_saves.store(true, Ordering::SeqCst);

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/v1/admit", guaranteed_pod("p3", "2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let result: PodAdmitResult = body_json(response).await;
        assert_eq!(result.reason.as_deref(), Some("UnexpectedAdmissionError"));

        let health = state.health_registry.health().await;
        assert_eq!(
            health.components[components::CHECKPOINT].status,
            pinning_lib::health::ComponentStatus::Degraded
        );

        let response = app.oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
