//! Runtime settings endpoints: provider credentials and spending caps.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::settings::SettingsStatus;
use crate::spending::SpendingStatus;
use crate::AppState;

/// GET /api/settings
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsStatus> {
    Json(state.settings.status())
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub openrouter_api_key: Option<String>,
    pub opencode_zen_api_key: Option<String>,
}

/// PUT /api/settings
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateSettingsRequest>,
) -> Json<SettingsStatus> {
    state.settings.update(body.openrouter_api_key, body.opencode_zen_api_key).await;
    Json(state.settings.status())
}

/// GET /api/settings/spending
pub async fn get_spending(State(state): State<Arc<AppState>>) -> Result<Json<SpendingStatus>, GatewayError> {
    Ok(Json(state.spending.status()?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSpendingRequest {
    pub daily_cap: Option<f64>,
    pub monthly_cap: Option<f64>,
    pub warn_at_percent: Option<u8>,
}

/// POST /api/settings/spending
pub async fn post_spending(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateSpendingRequest>,
) -> Result<Json<SpendingStatus>, GatewayError> {
    state.spending.configure(body.daily_cap, body.monthly_cap, body.warn_at_percent)?;
    Ok(Json(state.spending.status()?))
}
