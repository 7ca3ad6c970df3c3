//! REST API handlers

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use egs_core::{
    Cluster, CreateGprRequest, Credential, EgsError, GprSnapshot, GprTemplate,
    GprTemplateBinding, InventoryEvent, InventoryUsage, ReleaseOutcome, WorkloadSignal,
};
use egs_scheduler::{GprScheduler, SchedulerStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<GprScheduler>,
    /// Inventory feed channel; events are applied inline when unset
    pub inventory_feed: Option<mpsc::Sender<InventoryEvent>>,
}

/// Create the API router
pub fn create_router(scheduler: Arc<GprScheduler>) -> Router {
    router(AppState {
        scheduler,
        inventory_feed: None,
    })
}

/// Create the API router, forwarding pushed inventory events to the feed loop
pub fn create_router_with_feed(
    scheduler: Arc<GprScheduler>,
    inventory_feed: mpsc::Sender<InventoryEvent>,
) -> Router {
    router(AppState {
        scheduler,
        inventory_feed: Some(inventory_feed),
    })
}

fn router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/v1/gprs", post(create_gpr))
        .route("/api/v1/gprs/:id", get(get_gpr))
        .route("/api/v1/gprs/:id/release", post(release_gpr))
        .route("/api/v1/gprs/:id/cancel", post(cancel_gpr))
        .route("/api/v1/gprs/:id/signal", post(workload_signal))
        .route("/api/v1/gprs/:id/priority", put(update_gpr_priority))
        .route("/api/v1/gprs/:id/name", put(update_gpr_name))
        .route("/api/v1/workspaces/:workspace/gprs", get(list_gprs))
        .route(
            "/api/v1/workspaces/:workspace/clusters",
            put(update_workspace_clusters),
        )
        .route(
            "/api/v1/workspaces/:workspace/inventory",
            get(workspace_inventory),
        )
        .route(
            "/api/v1/gpr-templates",
            get(list_templates).post(create_template),
        )
        .route(
            "/api/v1/gpr-templates/:name",
            get(get_template)
                .put(update_template)
                .delete(delete_template),
        )
        .route(
            "/api/v1/gpr-template-bindings",
            get(list_bindings).post(create_binding),
        )
        .route(
            "/api/v1/gpr-template-bindings/:workspace",
            get(get_binding).put(update_binding).delete(delete_binding),
        )
        .route("/api/v1/inventory", get(get_inventory).post(post_inventory))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: EgsError) -> (StatusCode, String) {
    let status = match e {
        EgsError::BadParameters(_) => StatusCode::BAD_REQUEST,
        EgsError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
        EgsError::InsufficientCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        EgsError::NoTemplateAvailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EgsError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Opaque caller credential from `x-api-key` or a bearer token
fn credential(headers: &HeaderMap) -> ApiResult<Credential> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Ok(Credential::new(key));
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(Credential::new)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                "missing API key or bearer token".to_string(),
            )
        })
}

/// Response for a created GPR
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGprResponse {
    pub id: Uuid,
}

/// Create a GPR and queue it for admission
async fn create_gpr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGprRequest>,
) -> ApiResult<(StatusCode, Json<CreateGprResponse>)> {
    let credential = credential(&headers)?;
    info!(
        workspace = %req.workspace_name,
        name = %req.request_name,
        "Creating GPR"
    );

    let id = state
        .scheduler
        .create_gpr(&credential, req)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(CreateGprResponse { id })))
}

async fn get_gpr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<GprSnapshot>> {
    let gpr = state.scheduler.get_gpr(id).await.map_err(error_response)?;
    Ok(Json(gpr))
}

/// List GPRs of a workspace
async fn list_gprs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workspace): Path<String>,
) -> ApiResult<Json<Vec<GprSnapshot>>> {
    let credential = credential(&headers)?;
    let gprs = state
        .scheduler
        .list_gprs(&credential, &workspace)
        .await
        .map_err(error_response)?;
    Ok(Json(gprs))
}

/// Cluster membership of a workspace
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceClusters {
    pub clusters: Vec<String>,
}

async fn update_workspace_clusters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workspace): Path<String>,
    Json(body): Json<WorkspaceClusters>,
) -> ApiResult<Json<WorkspaceClusters>> {
    let credential = credential(&headers)?;
    info!(workspace = %workspace, clusters = body.clusters.len(), "Updating workspace clusters");
    let clusters = state
        .scheduler
        .update_workspace_clusters(&credential, &workspace, body.clusters)
        .await
        .map_err(error_response)?;
    Ok(Json(WorkspaceClusters { clusters }))
}

/// Response for a release
#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub id: Uuid,
    pub outcome: ReleaseOutcome,
}

/// Release a GPR's capacity
async fn release_gpr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReleaseResponse>> {
    info!(gpr_id = %id, "Releasing GPR");

    let outcome = state
        .scheduler
        .release_gpr(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ReleaseResponse { id, outcome }))
}

async fn cancel_gpr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<GprSnapshot>> {
    info!(gpr_id = %id, "Cancelling GPR");

    let gpr = state
        .scheduler
        .cancel_gpr(id)
        .await
        .map_err(error_response)?;
    Ok(Json(gpr))
}

/// Workload status reported by the orchestration layer
async fn workload_signal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(signal): Json<WorkloadSignal>,
) -> ApiResult<Json<GprSnapshot>> {
    let gpr = state
        .scheduler
        .workload_signal(id, signal)
        .await
        .map_err(error_response)?;
    Ok(Json(gpr))
}

/// Request to change a queued GPR's priority
#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: u32,
}

async fn update_gpr_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PriorityRequest>,
) -> ApiResult<Json<GprSnapshot>> {
    info!(gpr_id = %id, priority = req.priority, "Updating GPR priority");

    let gpr = state
        .scheduler
        .update_gpr_priority(id, req.priority)
        .await
        .map_err(error_response)?;
    Ok(Json(gpr))
}

/// Request to rename a GPR
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub request_name: String,
}

async fn update_gpr_name(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<GprSnapshot>> {
    let gpr = state
        .scheduler
        .update_gpr_name(id, &req.request_name)
        .await
        .map_err(error_response)?;
    Ok(Json(gpr))
}

// Templates

async fn list_templates(State(state): State<Arc<AppState>>) -> Json<Vec<GprTemplate>> {
    Json(state.scheduler.list_templates().await)
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(template): Json<GprTemplate>,
) -> ApiResult<(StatusCode, Json<GprTemplate>)> {
    let template = state
        .scheduler
        .create_template(template)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<GprTemplate>> {
    let template = state
        .scheduler
        .get_template(&name)
        .await
        .map_err(error_response)?;
    Ok(Json(template))
}

async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(template): Json<GprTemplate>,
) -> ApiResult<Json<GprTemplate>> {
    if template.name != name {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("template name '{}' does not match path '{}'", template.name, name),
        ));
    }
    let template = state
        .scheduler
        .update_template(template)
        .await
        .map_err(error_response)?;
    Ok(Json(template))
}

async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .scheduler
        .delete_template(&name)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// Template bindings

async fn list_bindings(State(state): State<Arc<AppState>>) -> Json<Vec<GprTemplateBinding>> {
    Json(state.scheduler.list_template_bindings().await)
}

async fn create_binding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(binding): Json<GprTemplateBinding>,
) -> ApiResult<(StatusCode, Json<GprTemplateBinding>)> {
    let credential = credential(&headers)?;
    let binding = state
        .scheduler
        .create_template_binding(&credential, binding)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn get_binding(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> ApiResult<Json<GprTemplateBinding>> {
    let binding = state
        .scheduler
        .get_template_binding(&workspace)
        .await
        .map_err(error_response)?;
    Ok(Json(binding))
}

async fn update_binding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workspace): Path<String>,
    Json(binding): Json<GprTemplateBinding>,
) -> ApiResult<Json<GprTemplateBinding>> {
    let credential = credential(&headers)?;
    if binding.workspace_name != workspace {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "binding workspace '{}' does not match path '{}'",
                binding.workspace_name, workspace
            ),
        ));
    }
    let binding = state
        .scheduler
        .update_template_binding(&credential, binding)
        .await
        .map_err(error_response)?;
    Ok(Json(binding))
}

async fn delete_binding(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .scheduler
        .delete_template_binding(&workspace)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// Inventory

async fn get_inventory(State(state): State<Arc<AppState>>) -> Json<Vec<Cluster>> {
    Json(state.scheduler.inventory().await)
}

/// Feed entry point for collectors that push over HTTP
async fn post_inventory(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InventoryEvent>,
) -> ApiResult<StatusCode> {
    match &state.inventory_feed {
        Some(feed) => feed.send(event).await.map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "inventory feed is closed".to_string(),
            )
        })?,
        None => state.scheduler.apply_inventory(event).await,
    }
    Ok(StatusCode::ACCEPTED)
}

async fn workspace_inventory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workspace): Path<String>,
) -> ApiResult<Json<Vec<InventoryUsage>>> {
    let credential = credential(&headers)?;
    let usage = state
        .scheduler
        .workspace_inventory(&credential, &workspace)
        .await
        .map_err(error_response)?;
    Ok(Json(usage))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler: state.scheduler.status().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use egs_core::{GprState, RawInventoryItem, SchedulerConfig, WorkspaceConfig};
    use egs_scheduler::StaticRegistry;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn test_scheduler() -> Arc<GprScheduler> {
        let registry = StaticRegistry::from_config(&[WorkspaceConfig {
            name: "team-a".to_string(),
            clusters: vec!["worker-1".to_string()],
        }]);
        let scheduler = Arc::new(GprScheduler::new(
            SchedulerConfig::default(),
            Arc::new(registry),
        ));
        scheduler
            .inventory_index()
            .seed(&[RawInventoryItem {
                gpu_node_name: "node-1".to_string(),
                cluster_name: "worker-1".to_string(),
                gpu_shape: "A100".to_string(),
                gpu_model_name: "NVIDIA A100-SXM4-40GB".to_string(),
                instance_type: "a2-highgpu-2g".to_string(),
                memory: 80,
                gpu_count: 2,
                available_gpu_count: None,
                node_health: "Healthy".to_string(),
                gpu_node_status: String::new(),
                cloud_provider: "gcp".to_string(),
                region: "us-east1".to_string(),
            }])
            .await;
        scheduler
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", "token");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body() -> Value {
        json!({
            "requestName": "train",
            "workspaceName": "team-a",
            "nodeCount": 1,
            "gpuPerNodeCount": 1,
            "memoryPerGpu": 40,
            "exitDuration": "1h",
            "priority": 100
        })
    }

    #[tokio::test]
    async fn test_create_router() {
        let scheduler = test_scheduler().await;
        let _router = create_router(scheduler);
    }

    #[tokio::test]
    async fn test_create_and_get_gpr() {
        let scheduler = test_scheduler().await;
        let router = create_router(scheduler.clone());

        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gprs", Some(create_body())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: CreateGprResponse =
            serde_json::from_value(body_json(response).await).unwrap();

        scheduler.dispatch_once().await;

        let response = router
            .oneshot(request("GET", &format!("/api/v1/gprs/{}", created.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let gpr = body_json(response).await;
        assert_eq!(gpr["state"], json!(GprState::Provisioning));
        assert_eq!(gpr["cluster"], "worker-1");
        assert_eq!(gpr["numGpusAllocated"], 1);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let router = create_router(test_scheduler().await);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/gprs")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let router = create_router(test_scheduler().await);

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/v1/gprs/{}", Uuid::new_v4()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut body = create_body();
        body["gpuPerNodeCount"] = json!(8);
        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gprs", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let mut body = create_body();
        body["exitDuration"] = json!("0m");
        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gprs", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut body = create_body();
        body["nodeCount"] = json!(1 << 20);
        body["gpuPerNodeCount"] = json!(1 << 13);
        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gprs", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Rejected while decoding the body
        let mut body = create_body();
        body["exitDuration"] = json!("100000000d");
        let response = router
            .oneshot(request("POST", "/api/v1/gprs", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_list_gprs_unknown_workspace() {
        let router = create_router(test_scheduler().await);

        let response = router
            .clone()
            .oneshot(request("GET", "/api/v1/workspaces/team-a/gprs", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));

        let response = router
            .oneshot(request("GET", "/api/v1/workspaces/team-z/gprs", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_workspace_clusters() {
        let router = create_router(test_scheduler().await);

        let response = router
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/workspaces/team-b/clusters",
                Some(json!({"clusters": ["worker-1"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["clusters"], json!(["worker-1"]));

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                "/api/v1/workspaces/team-b/inventory",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await[0]["totalGpus"], 2);

        let response = router
            .clone()
            .oneshot(request(
                "PUT",
                "/api/v1/workspaces/team-b/clusters",
                Some(json!({"clusters": [""]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/workspaces/team-b/clusters")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"clusters": []}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_release_and_cancel() {
        let scheduler = test_scheduler().await;
        let router = create_router(scheduler.clone());

        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gprs", Some(create_body())))
            .await
            .unwrap();
        let created: CreateGprResponse =
            serde_json::from_value(body_json(response).await).unwrap();

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/v1/gprs/{}/cancel", created.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(request(
                "POST",
                &format!("/api/v1/gprs/{}/release", created.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let released: ReleaseResponse =
            serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(released.outcome, ReleaseOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_template_routes() {
        let router = create_router(test_scheduler().await);
        let template = json!({
            "name": "a100-small",
            "clusterName": "worker-1",
            "gpuPerNodeCount": 1,
            "numGpuNodes": 1,
            "memoryPerGpu": 40,
            "gpuShape": "A100",
            "instanceType": "a2-highgpu-2g",
            "exitDuration": "1h",
            "priority": 201
        });

        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gpr-templates", Some(template.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(request("POST", "/api/v1/gpr-templates", Some(template.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .clone()
            .oneshot(request("PUT", "/api/v1/gpr-templates/other", Some(template)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(request("GET", "/api/v1/gpr-templates", None))
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list.as_array().map(|a| a.len()), Some(1));

        let response = router
            .oneshot(request("DELETE", "/api/v1/gpr-templates/a100-small", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_inventory_routes() {
        let router = create_router(test_scheduler().await);

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                "/api/v1/workspaces/team-a/inventory",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let usage = body_json(response).await;
        assert_eq!(usage[0]["totalGpus"], 2);

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/inventory",
                Some(json!({"type": "clusterRemoved", "clusterName": "worker-1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .oneshot(request("GET", "/api/v1/status", None))
            .await
            .unwrap();
        let status = body_json(response).await;
        assert_eq!(status["clusters"], 0);
        assert_eq!(status["queuedByWorkspace"], json!({}));
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_inventory_forwarded_to_feed() {
        let (tx, mut rx) = mpsc::channel(4);
        let router = create_router_with_feed(test_scheduler().await, tx);

        let response = router
            .oneshot(request(
                "POST",
                "/api/v1/inventory",
                Some(json!({"type": "clusterRemoved", "clusterName": "worker-1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.recv().await,
            Some(InventoryEvent::ClusterRemoved { cluster_name }) if cluster_name == "worker-1"
        ));
    }
}
