//! The request pipeline (§4.K): block-check, provider resolution, body
//! translation, queue submission, and the two-phase response path that lets
//! an `text/event-stream` upstream reply start streaming to the client
//! before the whole exchange (and its log row) is finished.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use ccrelay_concurrency::ConcurrencyManager;
use ccrelay_core::error::CcrelayError;
use ccrelay_core::model_map::apply_model_mapping;
use ccrelay_core::task::{ProxyResult, RequestTask};
use ccrelay_observability::MetricsCollector;
use ccrelay_router::Router;
use ccrelay_store::model::b64_encode;
use ccrelay_store::{CompletedUpdate, LogStatus, Logger, RequestLog, RouteType};
use futures_util::stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::executor::{ProxyExecutor, SseSink};

pub struct PipelineState {
    pub router: Arc<Router>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub executor: Arc<ProxyExecutor>,
    pub logger: Logger,
    pub metrics: Arc<MetricsCollector>,
}

impl PipelineState {
    pub fn new(
        router: Arc<Router>,
        concurrency: Arc<ConcurrencyManager>,
        executor: Arc<ProxyExecutor>,
        logger: Logger,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self { router, concurrency, executor, logger, metrics })
    }
}

/// Guards against a client dropping the response body mid-stream:
/// `run_task` marks `finished` once the upstream channel closes on its
/// own, so the normal path's `Drop` is a no-op; a premature `Body` drop
/// (the client disconnecting) instead fires `mark_disconnected`, which
/// cancels the in-flight upstream call via `task.abort` (§4.K step 7).
struct DisconnectGuard {
    task: Arc<RequestTask>,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.task.mark_disconnected();
        }
    }
}

/// The single entry point a server-side axum handler calls per incoming
/// request (§4.K). Dataplane `OPTIONS` requests are answered locally
/// (§4.L) rather than forwarded upstream; the CORS layer on the outer
/// router fills in the `Access-Control-Allow-*` headers.
pub async fn handle_request(state: Arc<PipelineState>, method: Method, path: String, headers: Vec<(String, String)>, body: Bytes) -> Response {
    if method == Method::OPTIONS {
        return Response::builder().status(StatusCode::OK).body(Body::empty()).unwrap_or_else(|_| plain_response(200, String::new()));
    }

    if let Some(decision) = state.router.should_block(&path) {
        log_blocked(&state.logger, &method, &path, decision.code, &body);
        return plain_response(decision.code, decision.response);
    }

    let provider = state.router.get_target_provider(&path);
    let is_openai = provider.is_openai();
    let route_type = if state.router.should_route(&path) { RouteType::Router } else { RouteType::Passthrough };
    let prepared_headers = state.router.prepare_headers(&headers, &provider);

    let mapped_body = apply_model_mapping(&provider, &body);
    let original_model = extract_model(&body);

    let (target_url, final_body) = if is_openai {
        let value: Value = match serde_json::from_slice(&mapped_body) {
            Ok(v) => v,
            Err(_) => return error_response(CcrelayError::InvalidJson),
        };
        let target_model = value.get("model").and_then(Value::as_str).unwrap_or("").to_string();
        let translated = ccrelay_convert::translate_request(&value, &target_model);
        let url = ccrelay_convert::request::translate_path(&path, &provider.base_url);
        (url, serde_json::to_vec(&translated).unwrap_or_default())
    } else {
        (state.router.get_target_url(&path, &provider), mapped_body)
    };

    let task = Arc::new(RequestTask::new(
        RequestTask::generate_id(),
        method.as_str().to_string(),
        target_url.clone(),
        path.clone(),
        prepared_headers,
        final_body,
        provider.clone(),
        is_openai,
        original_model.clone(),
    ));

    state.logger.insert_log_pending(RequestLog {
        id: task.id.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        provider_id: provider.id.clone(),
        provider_name: provider.name.clone(),
        method: method.as_str().to_string(),
        path: path.clone(),
        target_url: Some(target_url),
        request_body: Some(b64_encode(&String::from_utf8_lossy(&body))),
        response_body: None,
        original_request_body: Some(b64_encode(&String::from_utf8_lossy(&body))),
        original_response_body: None,
        status_code: None,
        duration: 0.0,
        success: false,
        error_message: None,
        client_id: task.id.clone(),
        status: LogStatus::Pending,
        route_type,
        model: original_model,
    });

    run_task(state, method, path, task).await
}

async fn run_task(state: Arc<PipelineState>, method: Method, path: String, task: Arc<RequestTask>) -> Response {
    let (headers_tx, headers_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(64);
    let sink = SseSink::new(headers_tx, chunk_tx);

    let executor = state.executor.clone();
    let concurrency = state.concurrency.clone();
    let submit_task = task.clone();

    let join = tokio::spawn(async move {
        concurrency.submit(&path, submit_task, |t| async move { executor.execute(t, Some(sink)).await }).await
    });

    match headers_rx.await {
        Ok((status, headers)) => {
            let guard = DisconnectGuard { task: task.clone(), finished: false };
            let body = Body::from_stream(stream::unfold((chunk_rx, guard), |(mut rx, mut guard)| async move {
                match rx.recv().await {
                    Some(bytes) => Some((Ok::<Bytes, std::io::Error>(bytes), (rx, guard))),
                    None => {
                        guard.finished = true;
                        None
                    }
                }
            }));
            let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (name, value) in headers {
                builder = builder.header(name, value);
            }

            let logger = state.logger.clone();
            let metrics = state.metrics.clone();
            let id = task.id.clone();
            let route = path.clone();
            let method_label = method.as_str().to_string();
            tokio::spawn(async move {
                if let Ok(result) = join.await {
                    match &result {
                        Ok(r) => metrics.record_request(&route, &method_label, r.status_code, r.duration_ms / 1000.0),
                        Err(e) => metrics.record_request(&route, &method_label, e.status_code(), 0.0),
                    }
                    log_resolution(&logger, &id, result);
                }
            });

            builder.body(body).unwrap_or_else(|_| plain_response(502, "failed to build response".to_string()))
        }
        Err(_) => match join.await {
            Ok(Ok(result)) => {
                state.metrics.record_request(&path, method.as_str(), result.status_code, result.duration_ms / 1000.0);
                log_resolution(&state.logger, &task.id, Ok(result.clone()));
                result_to_response(result)
            }
            Ok(Err(e)) => {
                state.metrics.record_request(&path, method.as_str(), e.status_code(), 0.0);
                log_rejection(&state.logger, &task.id, &e);
                error_response(e)
            }
            Err(_) => plain_response(500, "internal error".to_string()),
        },
    }
}

fn result_to_response(result: ProxyResult) -> Response {
    let mut builder = Response::builder().status(StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &result.headers {
        builder = builder.header(name, value);
    }
    let body = result.body.unwrap_or_default();
    builder.body(Body::from(body)).unwrap_or_else(|_| plain_response(502, "failed to build response".to_string()))
}

fn error_response(error: CcrelayError) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "application/json")
        .body(Body::from(error.to_anthropic_json_body()))
        .unwrap_or_else(|_| plain_response(500, "internal error".to_string()))
}

fn plain_response(code: u16, body: String) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST))
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn extract_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body).ok().and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
}

fn log_blocked(logger: &Logger, method: &Method, path: &str, code: u16, body: &[u8]) {
    logger.insert_log(RequestLog {
        id: RequestTask::generate_id(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        provider_id: String::new(),
        provider_name: String::new(),
        method: method.as_str().to_string(),
        path: path.to_string(),
        target_url: None,
        request_body: Some(b64_encode(&String::from_utf8_lossy(body))),
        response_body: None,
        original_request_body: None,
        original_response_body: None,
        status_code: Some(code),
        duration: 0.0,
        success: code < 400,
        error_message: None,
        client_id: String::new(),
        status: LogStatus::Completed,
        route_type: RouteType::Block,
        model: None,
    });
}

fn log_resolution(logger: &Logger, id: &str, result: Result<ProxyResult, CcrelayError>) {
    match result {
        Ok(result) => log_completion(logger, id, &result),
        Err(e) => log_rejection(logger, id, &e),
    }
}

fn log_completion(logger: &Logger, id: &str, result: &ProxyResult) {
    match result.status_code {
        499 => logger.update_log_status(id.to_string(), LogStatus::Cancelled, Some(499), result.duration_ms, result.error_message.clone()),
        504 => logger.update_log_status(id.to_string(), LogStatus::Timeout, Some(504), result.duration_ms, result.error_message.clone()),
        _ => logger.update_log_completed(
            id.to_string(),
            CompletedUpdate {
                status_code: result.status_code,
                response_body: result.body.as_ref().map(|b| b64_encode(&String::from_utf8_lossy(b))),
                duration: result.duration_ms,
                success: result.is_success(),
                error_message: result.error_message.clone(),
                original_response_body: result.original_response_body.clone(),
            },
        ),
    }
}

fn log_rejection(logger: &Logger, id: &str, error: &CcrelayError) {
    let status = match error {
        CcrelayError::QueueTimeout => LogStatus::Timeout,
        CcrelayError::ClientDisconnected => LogStatus::Cancelled,
        _ => LogStatus::Completed,
    };
    logger.update_log_status(id.to_string(), status, Some(error.status_code()), 0.0, Some(error.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_concurrency::ConcurrencyManager;
    use ccrelay_core::config::RoutingConfig;
    use ccrelay_core::provider::{Provider, ProviderMode, ProviderType};
    use ccrelay_store::open_backend;
    use std::collections::HashMap;

    fn provider() -> Provider {
        Provider {
            id: "official".into(),
            name: "Official".into(),
            base_url: "http://127.0.0.1:1".into(),
            mode: ProviderMode::Passthrough,
            provider_type: ProviderType::Anthropic,
            api_key: None,
            auth_header: "authorization".into(),
            model_map: vec![],
            vl_model_map: vec![],
            headers: Default::default(),
            enabled: true,
        }
    }

    fn test_state() -> Arc<PipelineState> {
        let mut providers = HashMap::new();
        providers.insert("official".to_string(), provider());
        let router = Arc::new(Router::new(providers, RoutingConfig::default(), "official".to_string()));
        let concurrency = Arc::new(ConcurrencyManager::new(None, &[]));
        let executor = Arc::new(ProxyExecutor::new());
        let logger = Logger::start(None);
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        PipelineState::new(router, concurrency, executor, logger, metrics)
    }

    #[tokio::test]
    async fn blocked_path_short_circuits_with_configured_code() {
        let mut providers = HashMap::new();
        providers.insert("official".to_string(), {
            let mut p = provider();
            p.mode = ProviderMode::Inject;
            p
        });
        let routing = RoutingConfig {
            block: vec![ccrelay_core::config::BlockRule { path: "/blocked".into(), response: "nope".into(), code: 403 }],
            ..Default::default()
        };
        let router = Arc::new(Router::new(providers, routing, "official".to_string()));
        let state = PipelineState::new(
            router,
            Arc::new(ConcurrencyManager::new(None, &[])),
            Arc::new(ProxyExecutor::new()),
            Logger::start(None),
            Arc::new(MetricsCollector::new().unwrap()),
        );

        let response = handle_request(state, Method::POST, "/blocked".to_string(), vec![], Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn options_request_is_answered_locally_without_touching_the_router() {
        let state = test_state();
        let response = handle_request(state, Method::OPTIONS, "/v1/messages".to_string(), vec![], Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_upstream_resolves_to_bad_gateway() {
        let state = test_state();
        let body = Bytes::from_static(br#"{"model":"claude-3-opus","messages":[]}"#);
        let response = handle_request(state, Method::POST, "/v1/messages".to_string(), vec![], body).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn open_backend_smoke() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_backend(dir.path().join("logs.ndjson").to_str().unwrap()).is_ok());
    }
}
