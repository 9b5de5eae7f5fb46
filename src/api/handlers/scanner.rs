//! Cloudflare scanner handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::SwivelError;
use crate::jobs::scanner::ranges_or_fallback;
use crate::models::{ScanResult, ScannerRequest};

/// POST /api/v1/scanner/cf/start
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<ScannerRequest>,
) -> Result<impl IntoResponse, SwivelError> {
    state.manager.start_scanner(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "Scanner started" })),
    ))
}

/// POST /api/v1/scanner/cf/stop
pub async fn stop(State(state): State<AppState>) -> Result<impl IntoResponse, SwivelError> {
    state.manager.stop_scanner().await?;
    Ok(Json(json!({ "status": "Scanner stopped" })))
}

/// GET /api/v1/scanner/cf/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "is_scanning": state.manager.is_scanning() }))
}

/// GET /api/v1/scanner/cf/history
///
/// A damaged or missing history yields an empty list rather than an error.
pub async fn history(State(state): State<AppState>) -> impl IntoResponse {
    let results: Vec<ScanResult> = state.histories.cf_scan.load().await.unwrap_or_default();
    Json(results)
}

/// POST /api/v1/scanner/cf/clear_history
pub async fn clear_history(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, SwivelError> {
    state.histories.cf_scan.clear().await?;
    Ok(Json(json!({ "status": "History cleared" })))
}

/// GET /api/v1/scanner/cf/ranges
pub async fn ranges() -> impl IntoResponse {
    let ranges = ranges_or_fallback().await;
    Json(json!({ "ranges": ranges }))
}
