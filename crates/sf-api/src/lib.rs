// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane surface for the run engine (spec.md §4.J, §6.1).
//!
//! Authentication, tenant extraction, rate limiting, and OpenAPI shaping are
//! deliberately thin here (spec.md §1 Non-goals) — this crate is a
//! controller layer over [`sf_orchestrator::Orchestrator`], not a security
//! boundary. Tenant identity is read from the `X-Tenant-Id` header.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sf_envelope::{Artifact, Run, StepStatus, StepsSummary};
use sf_orchestrator::{CacheAnalysisEntry, Orchestrator, OrchestratorError};
use sf_store::StoreError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Shared state handed to every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The engine driving runs; also consulted directly for reads.
    pub orchestrator: Arc<Orchestrator>,
}

/// A tenant identity extracted from the `X-Tenant-Id` request header.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

const TENANT_HEADER: &str = "x-tenant-id";

/// Extracts [`TenantId`] from the request header, rejecting with a
/// `VALIDATION_ERROR` when it's missing or empty.
pub async fn tenant_middleware(mut req: Request, next: Next) -> Response {
    let tenant = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match tenant {
        Some(tenant) => {
            req.extensions_mut().insert(TenantId(tenant.to_string()));
            next.run(req).await
        }
        None => ApiError::validation("missing X-Tenant-Id header", None).into_response(),
    }
}

/// Logs method, path, status, and duration for every request, mirroring the
/// scoped-span style the rest of the engine uses.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

/// Tags every response with a fresh `X-Request-Id` header.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// A uniform error envelope: `{code, message, details}` (spec.md §6.1).
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self { status, code, message: message.into(), details }
    }

    fn validation(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, details)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message, None)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
            "details": self.details,
        }));
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::UnknownWorkflow(name) => {
                Self::validation(format!("unknown workflow '{name}'"), None)
            }
            OrchestratorError::Planner(e) => Self::validation(e.to_string(), None),
            OrchestratorError::Store(StoreError::RunNotFound { .. } | StoreError::StepNotFound { .. }) => {
                Self::not_found(err.to_string())
            }
            OrchestratorError::Store(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string(), None),
            OrchestratorError::Queue(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string(), None),
            OrchestratorError::Skill(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string(), None),
        }
    }
}

/// Build the Axum router with every route and the tenant/logging/request-id
/// middleware stack (spec.md §4.J, §6.1).
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(trigger_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/steps", get(list_steps))
        .route("/runs/{run_id}/artifacts", get(list_artifacts))
        .route("/runs/{run_id}/cache-analysis", get(cache_analysis))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .layer(middleware::from_fn(tenant_middleware))
        .layer(middleware::from_fn(request_logger))
        .layer(middleware::from_fn(request_id_middleware))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TriggerRunRequest {
    #[serde(rename = "workflowName")]
    workflow_name: String,
    /// Accepted for forward compatibility with spec.md §6.1's request shape;
    /// the planner always uses a workflow's registered version since this
    /// engine carries exactly one version per workflow name.
    #[serde(rename = "workflowVersion", default)]
    #[allow(dead_code)]
    workflow_version: Option<String>,
    #[serde(rename = "triggerPayload")]
    trigger_payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerRunResponse {
    #[serde(rename = "runId")]
    run_id: Uuid,
    status: sf_envelope::RunStatus,
    message: String,
}

async fn trigger_run(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRunRequest>,
) -> Result<Json<TriggerRunResponse>, ApiError> {
    let run = state.orchestrator.trigger_run(&tenant.0, &req.workflow_name, req.trigger_payload).await?;
    Ok(Json(TriggerRunResponse { run_id: run.id, status: run.status, message: "accepted".to_string() }))
}

#[derive(Debug, Serialize)]
struct RunResponse {
    #[serde(flatten)]
    run: Run,
    #[serde(rename = "stepsSummary")]
    steps_summary: StepsSummary,
}

async fn get_run(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    AxPath(run_id): AxPath<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.orchestrator.get_run(&tenant.0, run_id).await?;
    let steps = state.orchestrator.list_steps(&tenant.0, run_id, None).await?;
    let steps_summary = StepsSummary::from_steps(steps.iter());
    Ok(Json(RunResponse { run, steps_summary }))
}

#[derive(Debug, Deserialize)]
struct ListStepsQuery {
    status: Option<StepStatus>,
}

async fn list_steps(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    AxPath(run_id): AxPath<Uuid>,
    Query(q): Query<ListStepsQuery>,
) -> Result<Json<Vec<sf_envelope::RunStep>>, ApiError> {
    Ok(Json(state.orchestrator.list_steps(&tenant.0, run_id, q.status).await?))
}

#[derive(Debug, Deserialize)]
struct ListArtifactsQuery {
    #[serde(rename = "stepId")]
    step_id: Option<String>,
}

async fn list_artifacts(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    AxPath(run_id): AxPath<Uuid>,
    Query(q): Query<ListArtifactsQuery>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    Ok(Json(state.orchestrator.list_artifacts(&tenant.0, run_id, q.step_id.as_deref()).await?))
}

async fn cache_analysis(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    AxPath(run_id): AxPath<Uuid>,
) -> Result<Json<BTreeMap<String, CacheAnalysisEntry>>, ApiError> {
    Ok(Json(state.orchestrator.cache_analysis(&tenant.0, run_id).await?))
}

async fn cancel_run(
    axum::Extension(tenant): axum::Extension<TenantId>,
    State(state): State<Arc<AppState>>,
    AxPath(run_id): AxPath<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.orchestrator.cancel_run(&tenant.0, run_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use sf_artifact_store::ArtifactStore;
    use sf_cache::StepCache;
    use sf_config::EngineConfig;
    use sf_context::ContextFactory;
    use sf_handlers::{EchoHandler, HandlerRegistry};
    use sf_planner::Planner;
    use sf_queue::RunOrchestrationQueue;
    use sf_registry::SkillRegistry;
    use sf_store::RunStore;
    use tower::ServiceExt;

    async fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.yaml"),
            "- skill_id: game_config_from_template\n  version: 1.0.0\n  title: t\n  tags: []\n  status: active\n",
        )
        .unwrap();
        let descriptor = sf_envelope::SkillDescriptor {
            skill_id: "game_config_from_template".to_string(),
            version: semver::Version::new(1, 0, 0),
            title: "t".to_string(),
            description: String::new(),
            tags: vec![],
            status: sf_envelope::SkillStatus::Active,
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
            implementation: sf_envelope::Implementation { kind: sf_envelope::ImplementationType::Function, handler: "echo".to_string() },
            policy: sf_envelope::SkillPolicy { max_runtime_sec: 5, network: sf_envelope::NetworkAccess::None, allowed_hosts: vec![] },
            volatile_fields: vec![],
        };
        std::fs::write(dir.path().join("game_config_from_template.yaml"), serde_yaml::to_string(&descriptor).unwrap()).unwrap();
        let registry = SkillRegistry::from_catalog_dir(dir.path()).unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Arc::new(EchoHandler));

        let mut planner = Planner::new();
        planner.register(sf_planner::builtin::campaign_build_minimal());

        let store = Arc::new(RunStore::open(dir.path().join("runs")).await.unwrap());
        let artifacts = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let cache = Arc::new(StepCache::new());
        let queue = Arc::new(RunOrchestrationQueue::new());
        let contexts = Arc::new(ContextFactory::new(dir.path().join("workspaces"), "artifact://store"));

        let orchestrator = Orchestrator::new(
            store,
            artifacts,
            cache,
            queue,
            Arc::new(registry),
            Arc::new(handlers),
            Arc::new(planner),
            contexts,
            EngineConfig::default(),
        );
        let state = Arc::new(AppState { orchestrator });
        (build_app(state), dir)
    }

    fn minimal_payload() -> serde_json::Value {
        serde_json::json!({"template_id": "tpl-1", "theme": "space", "difficulty": "easy"})
    }

    #[tokio::test]
    async fn trigger_run_without_tenant_header_is_rejected() {
        let (app, _dir) = test_app().await;
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/runs")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&json!({
                    "workflowName": "campaign.build.minimal",
                    "triggerPayload": minimal_payload(),
                }))
                .unwrap(),
            ))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_run_then_get_run_round_trips() {
        let (app, _dir) = test_app().await;
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/runs")
            .header("content-type", "application/json")
            .header("x-tenant-id", "acme")
            .body(axum::body::Body::from(
                serde_json::to_vec(&json!({
                    "workflowName": "campaign.build.minimal",
                    "triggerPayload": minimal_payload(),
                }))
                .unwrap(),
            ))
            .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: TriggerRunResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.status, sf_envelope::RunStatus::Queued);

        let req = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/runs/{}", parsed.run_id))
            .header("x-tenant-id", "acme")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_run_for_unknown_id_is_404() {
        let (app, _dir) = test_app().await;
        let req = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/runs/{}", Uuid::new_v4()))
            .header("x-tenant-id", "acme")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_run_rejects_unknown_workflow_with_validation_error() {
        let (app, _dir) = test_app().await;
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/runs")
            .header("content-type", "application/json")
            .header("x-tenant-id", "acme")
            .body(axum::body::Body::from(serde_json::to_vec(&json!({"workflowName": "nope", "triggerPayload": {}})).unwrap()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "VALIDATION_ERROR");
    }
}
