use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use ccrelay_store::model::b64_decode;
use ccrelay_store::{LogFilter, RequestLog};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::SharedAdminState;

#[derive(Debug, Deserialize, Default)]
pub struct LogsQuery {
    #[serde(rename = "providerId")]
    pub provider_id: Option<String>,
    pub method: Option<String>,
    #[serde(rename = "pathPattern")]
    pub path_pattern: Option<String>,
    #[serde(rename = "minDuration")]
    pub min_duration: Option<f64>,
    #[serde(rename = "maxDuration")]
    pub max_duration: Option<f64>,
    #[serde(rename = "hasError")]
    pub has_error: Option<bool>,
    #[serde(rename = "startTime")]
    pub start_time: Option<i64>,
    #[serde(rename = "endTime")]
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl From<LogsQuery> for LogFilter {
    fn from(q: LogsQuery) -> Self {
        let mut filter = LogFilter::new();
        filter.provider_id = q.provider_id;
        filter.method = q.method;
        filter.path_pattern = q.path_pattern;
        filter.min_duration = q.min_duration;
        filter.max_duration = q.max_duration;
        filter.has_error = q.has_error;
        filter.start_time = q.start_time;
        filter.end_time = q.end_time;
        if let Some(limit) = q.limit {
            filter.limit = limit;
        }
        if let Some(offset) = q.offset {
            filter.offset = offset;
        }
        filter
    }
}

/// Summary view omitting request/response bodies, used for the list
/// endpoint so large payloads don't round-trip on every page.
fn list_view(log: &RequestLog) -> Value {
    json!({
        "id": log.id,
        "timestamp": log.timestamp,
        "providerId": log.provider_id,
        "providerName": log.provider_name,
        "method": log.method,
        "path": log.path,
        "targetUrl": log.target_url,
        "statusCode": log.status_code,
        "duration": log.duration,
        "success": log.success,
        "errorMessage": log.error_message,
        "status": log.status.as_str(),
        "routeType": log.route_type.as_str(),
        "model": log.model,
    })
}

fn detail_view(log: &RequestLog) -> Value {
    json!({
        "id": log.id,
        "timestamp": log.timestamp,
        "providerId": log.provider_id,
        "providerName": log.provider_name,
        "method": log.method,
        "path": log.path,
        "targetUrl": log.target_url,
        "requestBody": log.request_body.as_deref().map(b64_decode),
        "responseBody": log.response_body.as_deref().map(b64_decode),
        "originalRequestBody": log.original_request_body.as_deref().map(b64_decode),
        "originalResponseBody": log.original_response_body.as_deref().map(b64_decode),
        "statusCode": log.status_code,
        "duration": log.duration,
        "success": log.success,
        "errorMessage": log.error_message,
        "status": log.status.as_str(),
        "routeType": log.route_type.as_str(),
        "model": log.model,
    })
}

pub async fn list_logs(State(state): State<SharedAdminState>, Query(query): Query<LogsQuery>) -> Result<Json<Value>, ApiError> {
    let (logs, total) = state
        .logger
        .query_logs(query.into())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
    let logs: Vec<Value> = logs.iter().map(list_view).collect();
    Ok(Json(json!({ "logs": logs, "total": total })))
}

pub async fn get_log(State(state): State<SharedAdminState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let log = state
        .logger
        .get_log_by_id(id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
    match log {
        Some(log) => Ok(Json(detail_view(&log))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, json!({ "error": "Log not found" }).to_string())),
    }
}

#[derive(Deserialize, Default)]
struct DeleteLogsBody {
    #[serde(default)]
    ids: Vec<String>,
}

/// Accepts `{"ids": [...]}` to delete specific rows, or an empty/absent
/// body to mean "delete everything".
pub async fn delete_logs(State(state): State<SharedAdminState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let parsed: DeleteLogsBody = if body.is_empty() {
        DeleteLogsBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| {
            ApiError::new(StatusCode::BAD_REQUEST, json!({ "error": "Invalid JSON in request body" }).to_string())
        })?
    };

    if parsed.ids.is_empty() {
        state
            .logger
            .clear_all_logs()
            .await
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
        Ok(Json(json!({ "status": "ok", "deleted": "all" })))
    } else {
        let deleted = state
            .logger
            .delete_logs(parsed.ids)
            .await
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
        Ok(Json(json!({ "status": "ok", "deleted": deleted })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_maps_camel_case_fields_into_filter() {
        let query = LogsQuery { provider_id: Some("official".into()), min_duration: Some(5.0), ..Default::default() };
        let filter: LogFilter = query.into();
        assert_eq!(filter.provider_id.as_deref(), Some("official"));
        assert_eq!(filter.min_duration, Some(5.0));
        assert_eq!(filter.limit, 100);
    }
}
