mod middleware;
mod submissions;
mod workspaces;

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use tower::ServiceBuilder;

use crate::{
    error::ServiceError, languages::LanguageSummary, metrics::MetricsRegistry,
    service::ExecutionService, workspace::WorkspaceStore,
};

#[derive(Clone)]
pub struct AppState {
    pub service: ExecutionService,
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub metrics: Arc<MetricsRegistry>,
    /// API key to tenant id.
    pub api_keys: Arc<HashMap<String, String>>,
    pub default_language: String,
}

pub fn routes(state: AppState, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/languages", get(languages))
        .route("/submissions", post(submissions::submit))
        .route(
            "/submissions/{id}",
            get(submissions::get_submission).delete(submissions::cancel),
        )
        .route("/workspaces", post(workspaces::create))
        .route(
            "/workspaces/{id}",
            get(workspaces::get_workspace).delete(workspaces::delete_workspace),
        )
        .route(
            "/workspaces/{id}/files",
            get(workspaces::list_files).post(workspaces::add_file),
        )
        .route(
            "/workspaces/{id}/files/{name}",
            get(workspaces::get_file)
                .patch(workspaces::update_file)
                .delete(workspaces::delete_file),
        )
        .route("/workspaces/{id}/runs", post(workspaces::run))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_context))
                .layer(DefaultBodyLimit::max(max_request_bytes)),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn languages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<LanguageSummary>>, ServiceError> {
    authenticate(&state, &headers)?;
    Ok(Json(state.service.registry().summaries()))
}

/// Resolves the tenant behind the `x-api-key` header.
pub(crate) fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ServiceError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ServiceError::Unauthorized)?;
    let mut tenant = None;
    // no early exit, so timing does not reveal which key matched
    for (candidate_key, tenant_id) in state.api_keys.iter() {
        if constant_time_eq(key.as_bytes(), candidate_key.as_bytes()) {
            tenant = Some(tenant_id.clone());
        }
    }
    tenant.ok_or(ServiceError::Unauthorized)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (l, r) in a.iter().zip(b.iter()) {
        out |= l ^ r;
    }
    out == 0
}
