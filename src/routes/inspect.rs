//! Transaction Inspector endpoints: HAR export and buffer reset.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use crate::AppState;

/// GET /v1/inspect — export every captured transaction as a HAR 1.2 document.
pub async fn export_har(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.inspector.to_har())
}

/// DELETE /v1/inspect — clear the ring buffer.
pub async fn clear(State(state): State<Arc<AppState>>) -> StatusCode {
    state.inspector.clear();
    StatusCode::NO_CONTENT
}
