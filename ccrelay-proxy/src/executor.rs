//! The HTTP proxy executor (§4.L): sends one `RequestTask` upstream, with
//! retry on connection-phase errors, response translation, and SSE relay.

use std::error::Error as StdError;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ccrelay_core::task::{ProxyResult, RequestTask};
use flate2::read::GzDecoder;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_PROXY_DEADLINE: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 2;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["content-encoding", "content-length", "transfer-encoding", "connection", "keep-alive"];

/// Delivers a streamed upstream response to whoever is holding the client
/// connection: headers arrive once, chunks follow as they're read.
pub struct SseSink {
    headers_tx: Option<oneshot::Sender<(u16, Vec<(String, String)>)>>,
    chunk_tx: mpsc::Sender<Bytes>,
}

impl SseSink {
    pub fn new(headers_tx: oneshot::Sender<(u16, Vec<(String, String)>)>, chunk_tx: mpsc::Sender<Bytes>) -> Self {
        Self { headers_tx: Some(headers_tx), chunk_tx }
    }
}

pub struct ProxyExecutor {
    client: reqwest::Client,
}

impl Default for ProxyExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyExecutor {
    pub fn new() -> Self {
        Self::with_deadline(DEFAULT_PROXY_DEADLINE)
    }

    pub fn with_deadline(deadline: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(deadline).build().expect("reqwest client must build");
        Self { client }
    }

    /// Runs the executor for one task. `sink` is `Some` only when the
    /// caller is prepared to relay an `text/event-stream` response as it
    /// arrives (§4.L); otherwise every response shape is buffered.
    pub async fn execute(&self, task: Arc<RequestTask>, sink: Option<SseSink>) -> ProxyResult {
        if task.is_cancelled() {
            return ProxyResult::disconnected();
        }
        self.attempt(task, sink, 1).await
    }

    fn build_request(&self, task: &RequestTask) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_bytes(task.method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let mut builder = self.client.request(method, &task.target_url);
        for (name, value) in &task.headers {
            if name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header("accept-encoding", "identity");
        if !task.body.is_empty() {
            builder = builder.body(task.body.clone());
        }
        builder
    }

    fn attempt<'a>(
        &'a self,
        task: Arc<RequestTask>,
        sink: Option<SseSink>,
        attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ProxyResult> + Send + 'a>> {
        Box::pin(async move {
            if task.is_cancelled() {
                return ProxyResult::disconnected();
            }

            let started = Instant::now();
            let request = self.build_request(&task);

            let response = tokio::select! {
                res = request.send() => res,
                _ = task.abort.cancelled() => return ProxyResult::disconnected(),
            };

            match response {
                Ok(resp) => self.handle_response(resp, &task, sink, started).await,
                Err(e) => self.handle_send_error(e, task, sink, attempt, started).await,
            }
        })
    }

    async fn handle_send_error(
        &self,
        error: reqwest::Error,
        task: Arc<RequestTask>,
        sink: Option<SseSink>,
        attempt: u32,
        started: Instant,
    ) -> ProxyResult {
        if error.is_timeout() {
            return proxy_result(504, Some("Proxy timeout".to_string()), started, None);
        }

        if attempt < MAX_ATTEMPTS && is_retryable(&error) {
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            return self.attempt(task, sink, attempt + 1).await;
        }

        proxy_result(502, Some(format!("Proxy error: {error}")), started, None)
    }

    async fn handle_response(
        &self,
        response: reqwest::Response,
        task: &RequestTask,
        sink: Option<SseSink>,
        started: Instant,
    ) -> ProxyResult {
        let status = response.status().as_u16();
        let content_type =
            response.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
        let headers = copy_response_headers(&response);

        if task.is_openai_provider && status == 200 && content_type.starts_with("application/json") {
            return self.translate_json_response(response, headers, started).await;
        }

        if content_type.starts_with("text/event-stream") {
            if let Some(sink) = sink {
                return self.relay_sse(response, status, headers, sink, task, started).await;
            }
        }

        self.buffer_response(response, status, headers, started).await
    }

    async fn translate_json_response(&self, response: reqwest::Response, headers: Vec<(String, String)>, started: Instant) -> ProxyResult {
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return proxy_result(502, Some(format!("Proxy error: {e}")), started, None),
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return translation_failure(started, Some(text)),
        };
        match ccrelay_convert::translate_response(&value) {
            Ok(translated) => ProxyResult {
                status_code: 200,
                headers,
                body: Some(serde_json::to_vec(&translated).unwrap_or_default()),
                duration_ms: elapsed_ms(started),
                streamed: false,
                error_message: None,
                original_response_body: Some(text),
            },
            Err(_) => translation_failure(started, Some(text)),
        }
    }

    async fn relay_sse(
        &self,
        mut response: reqwest::Response,
        status: u16,
        headers: Vec<(String, String)>,
        mut sink: SseSink,
        task: &RequestTask,
        started: Instant,
    ) -> ProxyResult {
        if let Some(headers_tx) = sink.headers_tx.take() {
            let _ = headers_tx.send((status, headers.clone()));
        }

        let mut captured = Vec::new();
        loop {
            tokio::select! {
                chunk = response.chunk() => match chunk {
                    Ok(Some(bytes)) => {
                        captured.extend_from_slice(&bytes);
                        if sink.chunk_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return proxy_result(502, Some(format!("Proxy error: {e}")), started, None),
                },
                _ = task.abort.cancelled() => return ProxyResult::disconnected(),
            }
        }

        ProxyResult {
            status_code: status,
            headers,
            body: Some(captured.clone()),
            duration_ms: elapsed_ms(started),
            streamed: true,
            error_message: None,
            original_response_body: Some(String::from_utf8_lossy(&captured).into_owned()),
        }
    }

    async fn buffer_response(&self, response: reqwest::Response, status: u16, headers: Vec<(String, String)>, started: Instant) -> ProxyResult {
        match response.bytes().await {
            Ok(bytes) => ProxyResult {
                status_code: status,
                headers,
                body: Some(decompress_if_gzip(bytes.to_vec())),
                duration_ms: elapsed_ms(started),
                streamed: false,
                error_message: None,
                original_response_body: None,
            },
            Err(e) => proxy_result(502, Some(format!("Proxy error: {e}")), started, None),
        }
    }
}

fn proxy_result(status_code: u16, error_message: Option<String>, started: Instant, body: Option<Vec<u8>>) -> ProxyResult {
    ProxyResult { status_code, headers: vec![], body, duration_ms: elapsed_ms(started), streamed: false, error_message, original_response_body: None }
}

fn translation_failure(started: Instant, original: Option<String>) -> ProxyResult {
    let body = ccrelay_convert::response::error_body("upstream response could not be translated");
    ProxyResult {
        status_code: 502,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Some(serde_json::to_vec(&body).unwrap_or_default()),
        duration_ms: elapsed_ms(started),
        streamed: false,
        error_message: Some("Translation failure".to_string()),
        original_response_body: original,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn copy_response_headers(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_ascii_lowercase();
            !STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str())
        })
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

fn is_retryable(error: &reqwest::Error) -> bool {
    if error.is_connect() {
        return true;
    }
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return matches!(io_err.kind(), ConnectionRefused | ConnectionReset | TimedOut | NotFound);
        }
        source = err.source();
    }
    false
}

fn decompress_if_gzip(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() >= 2 && bytes[0] == GZIP_MAGIC[0] && bytes[1] == GZIP_MAGIC[1] {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router as AxumRouter;
    use ccrelay_core::provider::{Provider, ProviderMode, ProviderType};
    use std::io::Write;

    async fn spawn_test_server(app: AxumRouter) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn test_provider() -> Arc<Provider> {
        Arc::new(Provider {
            id: "p".into(),
            name: "P".into(),
            base_url: "http://unused".into(),
            mode: ProviderMode::Passthrough,
            provider_type: ProviderType::Anthropic,
            api_key: None,
            auth_header: "authorization".into(),
            model_map: vec![],
            vl_model_map: vec![],
            headers: Default::default(),
            enabled: true,
        })
    }

    fn task(url: String, is_openai: bool) -> Arc<RequestTask> {
        Arc::new(RequestTask::new("id1".into(), "POST".into(), url, "/x".into(), vec![], vec![], test_provider(), is_openai, None))
    }

    #[tokio::test]
    async fn buffers_plain_json_response() {
        let app = AxumRouter::new().route("/echo", post(|| async { axum::Json(serde_json::json!({"ok": true})) }));
        let base = spawn_test_server(app).await;
        let result = ProxyExecutor::new().execute(task(format!("{base}/echo"), false), None).await;
        assert_eq!(result.status_code, 200);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn cancelled_task_short_circuits_without_a_network_call() {
        let t = task("http://127.0.0.1:1/nowhere".into(), false);
        t.mark_disconnected();
        let result = ProxyExecutor::new().execute(t, None).await;
        assert_eq!(result.status_code, 499);
    }

    #[tokio::test]
    async fn connection_refused_exhausts_retries_and_returns_502() {
        let result = ProxyExecutor::new().execute(task("http://127.0.0.1:1/nowhere".into(), false), None).await;
        assert_eq!(result.status_code, 502);
        assert!(result.error_message.unwrap().contains("Proxy error"));
    }

    #[tokio::test]
    async fn translates_openai_json_response_when_provider_is_openai() {
        let app = AxumRouter::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::Json(serde_json::json!({
                    "choices": [{"message": {"role":"assistant","content":"hi"}, "finish_reason":"stop"}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 2}
                }))
            }),
        );
        let base = spawn_test_server(app).await;
        let result = ProxyExecutor::new().execute(task(format!("{base}/v1/chat/completions"), true), None).await;
        assert_eq!(result.status_code, 200);
        let body: serde_json::Value = serde_json::from_slice(&result.body.unwrap()).unwrap();
        assert_eq!(body["stop_reason"], "end_turn");
        assert!(result.original_response_body.is_some());
    }

    #[test]
    fn decompresses_gzip_magic_bytes() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"hello world").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decompress_if_gzip(compressed), b"hello world");
    }

    #[test]
    fn leaves_non_gzip_bytes_untouched() {
        let plain = b"not gzip".to_vec();
        assert_eq!(decompress_if_gzip(plain.clone()), plain);
    }
}
