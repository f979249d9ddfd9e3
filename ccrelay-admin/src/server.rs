//! Route table for the management API (mounted at `/ccrelay/api` by the
//! caller). CORS is wide open by design: this is a local admin surface,
//! not a public one, mirroring how the gateway's dashboard assets are
//! served without auth of their own. The same policy also covers the
//! dataplane (§4.L) — `cors_layer` is public so the binary can apply it
//! to the outer router that owns the proxy fallback, not just this
//! nested sub-router.

use axum::http::{header, Method, StatusCode};
use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use ccrelay_core::error::CcrelayError;
use tower_http::cors::{Any, CorsLayer};

use crate::handlers::{logs, misc, providers, queue, status};
use crate::state::SharedAdminState;

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::HeaderName::from_static("x-api-key")])
}

pub fn build_router(state: SharedAdminState) -> AxumRouter {
    AxumRouter::new()
        .route("/status", get(status::status))
        .route("/providers", get(providers::list_providers).post(providers::upsert_provider))
        .route("/providers/{id}", delete(providers::delete_provider))
        .route("/switch", post(providers::switch_provider))
        .route("/reload", post(providers::reload_config))
        .route("/logs", get(logs::list_logs).delete(logs::delete_logs))
        .route("/logs/{id}", get(logs::get_log))
        .route("/queue", get(queue::queue_stats).delete(queue::clear_queue))
        .route("/stats", get(misc::stats))
        .route("/version", get(misc::version))
        .route("/metrics", get(misc::metrics))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/json")],
        String::from_utf8(CcrelayError::ApiNotFound.to_json_body()).unwrap_or_default(),
    )
}
