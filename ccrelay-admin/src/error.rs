use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ccrelay_core::error::CcrelayError;

/// A pre-rendered JSON error response for a management handler. Plain
/// `{"error": "..."}` bodies for most failures, with room for a richer
/// payload (e.g. `/switch`'s `available` id list) when constructed
/// directly rather than via `From<CcrelayError>`.
pub struct ApiError {
    status: StatusCode,
    body: String,
}

impl ApiError {
    pub fn new(status: StatusCode, body: String) -> Self {
        Self { status, body }
    }
}

impl From<CcrelayError> for ApiError {
    fn from(err: CcrelayError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(err.to_json_body()).unwrap_or_else(|_| "{\"error\":\"internal error\"}".to_string());
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, [("content-type", "application/json")], self.body).into_response()
    }
}
