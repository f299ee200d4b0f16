//! Free-model catalog endpoints: flat (OpenAI-shaped) and grouped listings.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// GET /v1/models?refresh=true
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, GatewayError> {
    let models = state
        .scanner
        .list_flat(query.refresh)
        .await
        .map_err(|e| GatewayError::InternalError { message: e.to_string() })?;
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": m.discovered_at.timestamp(),
                "owned_by": m.source,
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}

/// GET /v1/models/grouped
pub async fn list_models_grouped(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, GatewayError> {
    let groups = state
        .scanner
        .list_grouped(query.refresh)
        .await
        .map_err(|e| GatewayError::InternalError { message: e.to_string() })?;
    Ok(Json(json!({ "models": groups })))
}
