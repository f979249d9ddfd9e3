use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::SharedAdminState;

pub async fn stats(State(state): State<SharedAdminState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .logger
        .get_stats()
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
    Ok(Json(json!({
        "total": stats.total,
        "success": stats.success,
        "failed": stats.failed,
        "avgDuration": stats.avg_duration,
    })))
}

/// No build-time version-embedding crate is in the dependency stack, so
/// `date` reflects request time rather than build time.
pub async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "date": chrono::Utc::now().to_rfc3339(),
        "features": ["proxy", "websocket-hub", "leader-election", "sqlite-logging", "prometheus-metrics"],
    }))
}

pub async fn metrics(State(state): State<SharedAdminState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
        .into_response()
}
