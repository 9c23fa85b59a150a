use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::supervisor::error::KernelError;

const DEFAULT_OUTPUT_COUNT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// GET /api/kernel/status
pub async fn status_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, KernelError> {
    let status = state.supervisor.status().await?;
    Ok(Json(status))
}

/// POST /api/kernel/start, body is the full kernel config tree
pub async fn start_handler(
    State(state): State<IPCServer>,
    Json(tree): Json<Value>,
) -> Result<impl IntoResponse, KernelError> {
    let connection_id = state.supervisor.start_connection(tree).await?;
    Ok(Json(json!({
        "success": true,
        "connection_id": connection_id,
    })))
}

/// POST /api/kernel/stop
pub async fn stop_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, KernelError> {
    state.supervisor.stop_connection().await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/kernel/validate
pub async fn validate_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, KernelError> {
    let version = state.supervisor.validate_kernel().await?;
    Ok(Json(json!({
        "success": true,
        "version": version,
    })))
}

/// GET /api/kernel/tags: tag map of the running connection
pub async fn tags_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, KernelError> {
    match state.supervisor.tag_map().await? {
        Some(map) => {
            let tags: Vec<Value> = map
                .iter()
                .map(|(direction, tag, protocol)| json!({ "direction": direction, "tag": tag, "protocol": protocol }))
                .collect();
            Ok((StatusCode::OK, Json(json!({ "tags": tags }))))
        }
        None => Ok((StatusCode::CONFLICT, Json(json!({ "error": "Kernel is not running" })))),
    }
}

/// GET /api/kernel/output?since=<id>&count=<n>
pub async fn output_handler(State(state): State<IPCServer>, Query(query): Query<OutputQuery>) -> impl IntoResponse {
    let lines = match query.since {
        Some(since) => state.supervisor.output_since(since).await,
        None => {
            state
                .supervisor
                .recent_output(query.count.unwrap_or(DEFAULT_OUTPUT_COUNT))
                .await
        }
    };
    Json(json!({ "lines": lines }))
}
