//! OSB-style HTTP surface.
//!
//! Handlers translate requests into pending records plus a `queue.add`; they
//! never invoke the engine directly. Status is read back from the store by
//! the last-operation endpoint.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use stratus_core::{
    Operation, OperationPayload, OperationState, Orchestration, OrchestrationFilter,
    OrchestrationKind, OrchestrationParameters, OrchestrationState, PlanId,
    ProvisioningParameters, StrategySpec, TargetSelector,
};
use stratus_engine::ProcessingQueue;
use stratus_storage::{OperationStore, OrchestrationStore, StoreError};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub operations: Arc<dyn OperationStore>,
    pub orchestrations: Arc<dyn OrchestrationStore>,
    pub provision_queue: Arc<ProcessingQueue>,
    pub deprovision_queue: Arc<ProcessingQueue>,
    pub update_queue: Option<Arc<ProcessingQueue>>,
    pub upgrade_runtime_queue: Arc<ProcessingQueue>,
    pub upgrade_cluster_queue: Arc<ProcessingQueue>,
    pub development_mode: bool,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v2/catalog", get(catalog))
        .route(
            "/v2/service_instances/{instance_id}",
            put(provision).delete(deprovision).patch(update),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(last_operation),
        )
        .route("/upgrade/runtimes", post(create_upgrade_runtime))
        .route("/upgrade/clusters", post(create_upgrade_cluster))
        .route("/orchestrations", get(list_orchestrations))
        .route("/orchestrations/{orchestration_id}", get(get_orchestration))
        .route(
            "/orchestrations/{orchestration_id}/cancel",
            put(cancel_orchestration),
        )
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn store_error(error: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    match error {
        StoreError::OperationNotFound(_)
        | StoreError::OrchestrationNotFound(_)
        | StoreError::InstanceNotFound(_) => error_response(StatusCode::NOT_FOUND, error.to_string()),
        StoreError::Conflict { .. } | StoreError::AlreadyExists(_) => {
            error_response(StatusCode::CONFLICT, error.to_string())
        }
        StoreError::Database(_) | StoreError::Serialization(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}

async fn catalog() -> Json<serde_json::Value> {
    let plans: Vec<serde_json::Value> = PlanId::ALL
        .iter()
        .map(|plan| {
            json!({
                "id": plan.as_str(),
                "name": plan.as_str(),
                "description": match plan {
                    PlanId::Standard => "Production-grade managed runtime",
                    PlanId::Lite => "Small managed runtime for evaluation workloads",
                    PlanId::Trial => "Free time-limited managed runtime",
                },
            })
        })
        .collect();

    Json(json!({
        "services": [{
            "id": "managed-runtime",
            "name": "managed-runtime",
            "description": "Managed runtimes on hyperscaler-backed clusters",
            "bindable": false,
            "plans": plans,
        }]
    }))
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    plan_id: String,
    region: String,
    #[serde(default)]
    platform_region: Option<String>,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OperationAccepted {
    operation: Uuid,
}

async fn provision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(request): Json<ProvisionRequest>,
) -> impl IntoResponse {
    let plan: PlanId = match request.plan_id.parse() {
        Ok(plan) => plan,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let operation = Operation::new_provision(
        &instance_id,
        ProvisioningParameters {
            plan,
            region: request.region,
            platform_region: request.platform_region,
            parameters: request.parameters,
        },
    );
    let operation_id = operation.id;

    if let Err(e) = state.operations.insert(operation).await {
        return store_error(e).into_response();
    }
    state.provision_queue.add(operation_id);
    info!(%instance_id, %operation_id, "provisioning accepted");

    (
        StatusCode::ACCEPTED,
        Json(OperationAccepted {
            operation: operation_id,
        }),
    )
        .into_response()
}

/// Plan and runtime id carried over from the instance's previous operation.
fn instance_details(last: &Operation) -> (PlanId, Option<String>) {
    match &last.payload {
        OperationPayload::Provision(payload) => (last.plan(), payload.runtime_id.clone()),
        OperationPayload::Deprovision(payload) => (last.plan(), payload.runtime_id.clone()),
        _ => (last.plan(), None),
    }
}

async fn deprovision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    let last = match state.operations.get_last_by_instance(&instance_id).await {
        Ok(last) => last,
        Err(StoreError::InstanceNotFound(_)) => {
            return error_response(StatusCode::GONE, "instance unknown").into_response()
        }
        Err(e) => return store_error(e).into_response(),
    };

    let (plan, runtime_id) = instance_details(&last);
    let operation = Operation::new_deprovision(&instance_id, plan, runtime_id);
    let operation_id = operation.id;

    if let Err(e) = state.operations.insert(operation).await {
        return store_error(e).into_response();
    }
    state.deprovision_queue.add(operation_id);
    info!(%instance_id, %operation_id, "deprovisioning accepted");

    (
        StatusCode::ACCEPTED,
        Json(OperationAccepted {
            operation: operation_id,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    parameters: serde_json::Value,
}

async fn update(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> impl IntoResponse {
    let Some(update_queue) = &state.update_queue else {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "update processing is disabled",
        )
        .into_response();
    };

    let last = match state.operations.get_last_by_instance(&instance_id).await {
        Ok(last) => last,
        Err(StoreError::InstanceNotFound(_)) => {
            return error_response(StatusCode::GONE, "instance unknown").into_response()
        }
        Err(e) => return store_error(e).into_response(),
    };

    let operation = Operation::new_update(&instance_id, last.plan(), request.parameters);
    let operation_id = operation.id;

    if let Err(e) = state.operations.insert(operation).await {
        return store_error(e).into_response();
    }
    update_queue.add(operation_id);

    (
        StatusCode::ACCEPTED,
        Json(OperationAccepted {
            operation: operation_id,
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct LastOperationResponse {
    state: &'static str,
    description: String,
}

async fn last_operation(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    let operation = match state.operations.get_last_by_instance(&instance_id).await {
        Ok(operation) => operation,
        Err(e) => return store_error(e).into_response(),
    };

    let osb_state = match operation.state {
        OperationState::Pending | OperationState::InProgress => "in progress",
        OperationState::Succeeded => "succeeded",
        OperationState::Failed | OperationState::Canceled => "failed",
    };

    // Raw failure reasons may leak backend internals; only development
    // deployments return them.
    let description = if operation.state == OperationState::Failed && !state.development_mode {
        "operation failed".to_string()
    } else {
        operation.description.clone()
    };

    Json(LastOperationResponse {
        state: osb_state,
        description,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct CreateOrchestrationRequest {
    #[serde(default)]
    targets: TargetSelector,
    #[serde(default)]
    strategy: StrategySpec,
    #[serde(default)]
    target_version: Option<String>,
}

#[derive(Debug, Serialize)]
struct OrchestrationAccepted {
    orchestration_id: Uuid,
}

async fn create_orchestration(
    state: &ApiState,
    kind: OrchestrationKind,
    request: CreateOrchestrationRequest,
) -> axum::response::Response {
    let orchestration = Orchestration::new(
        kind,
        OrchestrationParameters {
            targets: request.targets,
            strategy: request.strategy,
            target_version: request.target_version,
        },
    );
    let orchestration_id = orchestration.id;

    if let Err(e) = state.orchestrations.insert(orchestration).await {
        return store_error(e).into_response();
    }
    let queue = match kind {
        OrchestrationKind::UpgradeRuntime => &state.upgrade_runtime_queue,
        OrchestrationKind::UpgradeCluster => &state.upgrade_cluster_queue,
    };
    queue.add(orchestration_id);
    info!(%orchestration_id, %kind, "orchestration accepted");

    (
        StatusCode::ACCEPTED,
        Json(OrchestrationAccepted { orchestration_id }),
    )
        .into_response()
}

async fn create_upgrade_runtime(
    State(state): State<ApiState>,
    Json(request): Json<CreateOrchestrationRequest>,
) -> impl IntoResponse {
    create_orchestration(&state, OrchestrationKind::UpgradeRuntime, request).await
}

async fn create_upgrade_cluster(
    State(state): State<ApiState>,
    Json(request): Json<CreateOrchestrationRequest>,
) -> impl IntoResponse {
    create_orchestration(&state, OrchestrationKind::UpgradeCluster, request).await
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

async fn list_orchestrations(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let states = match params.state.as_deref() {
        None => vec![],
        Some(value) => match value.parse::<OrchestrationState>() {
            Ok(parsed) => vec![parsed],
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
        },
    };

    let filter = OrchestrationFilter {
        states,
        page: params.page,
        page_size: params.page_size,
        ..OrchestrationFilter::default()
    };
    match state.orchestrations.list(filter).await {
        Ok(orchestrations) => Json(json!({ "data": orchestrations })).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

async fn get_orchestration(
    State(state): State<ApiState>,
    Path(orchestration_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.orchestrations.get(orchestration_id).await {
        Ok(orchestration) => Json(orchestration).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

async fn cancel_orchestration(
    State(state): State<ApiState>,
    Path(orchestration_id): Path<Uuid>,
) -> impl IntoResponse {
    let mut orchestration = match state.orchestrations.get(orchestration_id).await {
        Ok(orchestration) => orchestration,
        Err(e) => return store_error(e).into_response(),
    };

    if orchestration.state.is_terminal() {
        return error_response(StatusCode::CONFLICT, "orchestration already settled")
            .into_response();
    }

    let kind = orchestration.kind;
    if orchestration.state != OrchestrationState::Canceling {
        orchestration.state = OrchestrationState::Canceling;
        orchestration.description = "cancellation requested".to_string();
        orchestration.updated_at = chrono::Utc::now();
        if let Err(e) = state.orchestrations.update(orchestration).await {
            return store_error(e).into_response();
        }
    }

    let queue = match kind {
        OrchestrationKind::UpgradeRuntime => &state.upgrade_runtime_queue,
        OrchestrationKind::UpgradeCluster => &state.upgrade_cluster_queue,
    };
    queue.add(orchestration_id);
    info!(%orchestration_id, "orchestration cancellation accepted");

    Json(OrchestrationAccepted { orchestration_id }).into_response()
}

async fn render_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized")
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use stratus_engine::{EngineError, Executor};
    use stratus_storage::InMemoryStore;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        async fn execute(&self, _id: Uuid) -> Result<Option<Duration>, EngineError> {
            Ok(None)
        }
    }

    fn idle_queue(name: &str) -> Arc<ProcessingQueue> {
        Arc::new(ProcessingQueue::new(name, Arc::new(NoopExecutor), 1))
    }

    fn test_state(development_mode: bool) -> (ApiState, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let state = ApiState {
            operations: store.clone(),
            orchestrations: store.clone(),
            provision_queue: idle_queue("provisioning"),
            deprovision_queue: idle_queue("deprovisioning"),
            update_queue: None,
            upgrade_runtime_queue: idle_queue("upgrade-runtime"),
            upgrade_cluster_queue: idle_queue("upgrade-cluster"),
            development_mode,
            metrics: None,
        };
        (state, store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_catalog_lists_every_plan() {
        let (state, _) = test_state(false);
        let response = router(state)
            .oneshot(Request::builder().uri("/v2/catalog").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let plans = body["services"][0]["plans"].as_array().unwrap();
        assert_eq!(plans.len(), PlanId::ALL.len());
    }

    #[tokio::test]
    async fn test_provision_writes_a_pending_operation() {
        let (state, store) = test_state(false);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v2/service_instances/inst-1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "plan_id": "standard",
                            "region": "westeurope",
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let stored = store.get_last_by_instance("inst-1").await.unwrap();
        assert_eq!(stored.state, OperationState::Pending);

        // The last-operation endpoint reports it.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v2/service_instances/inst-1/last_operation")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "in progress");
    }

    #[tokio::test]
    async fn test_unknown_plan_is_rejected() {
        let (state, _) = test_state(false);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v2/service_instances/inst-1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "plan_id": "platinum",
                            "region": "westeurope",
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deprovision_of_unknown_instance_is_gone() {
        let (state, _) = test_state(false);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v2/service_instances/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_failed_operations_hide_details_outside_development_mode() {
        let (state, _store) = test_state(false);

        let mut operation = Operation::new_provision(
            "inst-1",
            ProvisioningParameters {
                plan: PlanId::Standard,
                region: "westeurope".into(),
                platform_region: None,
                parameters: json!({}),
            },
        );
        operation.state = OperationState::Failed;
        operation.description = "account pool rejected the request: 403".into();
        state.operations.insert(operation).await.unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/v2/service_instances/inst-1/last_operation")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["state"], "failed");
        assert_eq!(body["description"], "operation failed");
    }

    #[tokio::test]
    async fn test_development_mode_returns_raw_description() {
        let (state, _store) = test_state(true);

        let mut operation = Operation::new_provision(
            "inst-1",
            ProvisioningParameters {
                plan: PlanId::Standard,
                region: "westeurope".into(),
                platform_region: None,
                parameters: json!({}),
            },
        );
        operation.state = OperationState::Failed;
        operation.description = "quota exceeded in westeurope".into();
        state.operations.insert(operation).await.unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/v2/service_instances/inst-1/last_operation")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["description"], "quota exceeded in westeurope");
    }

    #[tokio::test]
    async fn test_cancel_marks_the_orchestration_canceling() {
        let (state, store) = test_state(false);

        let orchestration = Orchestration::new(
            OrchestrationKind::UpgradeRuntime,
            OrchestrationParameters::default(),
        );
        let id = orchestration.id;
        OrchestrationStore::insert(store.as_ref(), orchestration)
            .await
            .unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/orchestrations/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = OrchestrationStore::get(store.as_ref(), id).await.unwrap();
        assert_eq!(stored.state, OrchestrationState::Canceling);
    }

    #[tokio::test]
    async fn test_update_is_rejected_when_disabled() {
        let (state, _) = test_state(false);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/v2/service_instances/inst-1")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&json!({})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
