//! Loopback introspection API (default port 48484).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde_json::json;

use application::reconciler::ContainerManager;
use domain::log::LogFilter;
use infrastructure::logging::LocalLogBackend;

pub struct ApiState {
    pub uuid: String,
    pub agent_version: String,
    pub manager: Arc<ContainerManager>,
    pub local_logs: Arc<LocalLogBackend>,
    pub started: Instant,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/healthy", get(healthy))
        .route("/v2/device", get(get_device))
        .route("/v2/applications/state", get(get_applications_state))
        .route("/v2/logs", get(get_logs))
        .with_state(state)
}

async fn healthy() -> impl IntoResponse {
    "OK"
}

async fn get_device(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "uuid": state.uuid,
        "agentVersion": state.agent_version,
        "uptimeSecs": state.started.elapsed().as_secs(),
    }))
}

async fn get_applications_state(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.manager.current_state().await {
        Ok(current) => Json(json!(current)).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_logs(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<LogFilter>,
) -> impl IntoResponse {
    Json(json!(state.local_logs.query(&filter)))
}
