//! Proxy service handlers

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::SwivelError;
use crate::models::ProxyStartRequest;

/// POST /api/v1/proxy/start
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<ProxyStartRequest>,
) -> Result<impl IntoResponse, SwivelError> {
    state.manager.start_proxy(request).await?;
    Ok(Json(json!({ "status": "Proxy service started" })))
}

/// POST /api/v1/proxy/stop
pub async fn stop(State(state): State<AppState>) -> Result<impl IntoResponse, SwivelError> {
    state.manager.stop_proxy().await?;
    Ok(Json(json!({ "status": "Proxy service stopped" })))
}

/// POST /api/v1/proxy/rotate
pub async fn rotate(State(state): State<AppState>) -> Result<impl IntoResponse, SwivelError> {
    state.manager.rotate_proxy().await?;
    Ok(Json(json!({ "status": "Rotate signal sent" })))
}

/// GET /api/v1/proxy/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": state.manager.proxy_status() }))
}

/// GET /api/v1/proxy/details
pub async fn details(State(state): State<AppState>) -> Result<impl IntoResponse, SwivelError> {
    let details = state.manager.proxy_details()?;
    Ok(Json(details))
}
