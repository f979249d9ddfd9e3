//! `RequestTask` and `ProxyResult` (§3): the unit of work carried through
//! router → queue → executor → logger, and its resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::provider::Provider;
use tokio::sync::Notify;

/// Why a task was cancelled. Recorded instead of the distilled spec's
/// string substring-check on the error message (§9 open question), and
/// used to decide whether a terminal log row is `cancelled` or `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    QueueTimeout,
    ClientDisconnect,
    QueueCleared,
    Explicit,
}

/// The cooperative cancellation handle carried by a `RequestTask`, standing
/// in for the distilled spec's `abortController`. No new dependency: an
/// `AtomicBool` plus a `Notify`, the same pairing the gateway uses for its
/// `config_changed` signal.
#[derive(Debug, Default)]
pub struct AbortHandle {
    cancelled: AtomicBool,
    reason: std::sync::Mutex<Option<CancelReason>>,
    notify: Notify,
}

impl AbortHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Idempotent: a second `abort` call with a different reason is ignored.
    pub fn abort(&self, reason: CancelReason) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *self.reason.lock().unwrap() = Some(reason);
        }
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap()
    }

    /// Resolves once `abort` has been called; a no-op future if already
    /// cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// The unit of work routed, queued, executed, and logged (§3). `id` is the
/// single correlation token threaded through every stage (§9).
pub struct RequestTask {
    pub id: String,
    pub method: String,
    pub target_url: String,
    pub request_path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub provider: Arc<Provider>,
    pub is_openai_provider: bool,
    pub original_model: Option<String>,
    pub created_at: Instant,
    pub started_at: std::sync::Mutex<Option<Instant>>,
    pub priority: i32,
    pub attempt: std::sync::atomic::AtomicU32,
    pub abort: Arc<AbortHandle>,
    /// Flips false once the client's connection observably closes; checked
    /// by the concurrency manager before invoking the executor (§4.F step 4).
    pub client_alive: AtomicBool,
}

impl RequestTask {
    pub fn new(
        id: String,
        method: String,
        target_url: String,
        request_path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        provider: Arc<Provider>,
        is_openai_provider: bool,
        original_model: Option<String>,
    ) -> Self {
        Self {
            id,
            method,
            target_url,
            request_path,
            headers,
            body,
            provider,
            is_openai_provider,
            original_model,
            created_at: Instant::now(),
            started_at: std::sync::Mutex::new(None),
            priority: 0,
            attempt: std::sync::atomic::AtomicU32::new(1),
            abort: AbortHandle::new(),
            client_alive: AtomicBool::new(true),
        }
    }

    /// `req-<ts>-<rand>`, unique per accepted client request (§3).
    pub fn generate_id() -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let rand = uuid::Uuid::new_v4().simple().to_string();
        format!("req-{ts}-{}", &rand[..8])
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled() || !self.client_alive.load(Ordering::SeqCst)
    }

    pub fn mark_disconnected(&self) {
        self.client_alive.store(false, Ordering::SeqCst);
        self.abort.abort(CancelReason::ClientDisconnect);
    }

    pub fn mark_started(&self) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn increment_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64() * 1000.0
    }
}

/// The resolution of an executed task (§3): what the proxy executor hands
/// back to the queue manager and, ultimately, to the client response
/// writer.
#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub duration_ms: f64,
    pub streamed: bool,
    pub error_message: Option<String>,
    /// Pre-translation upstream body text, captured for the logger when a
    /// response was translated (§4.L).
    pub original_response_body: Option<String>,
}

impl ProxyResult {
    pub fn disconnected() -> Self {
        Self {
            status_code: 499,
            headers: vec![],
            body: None,
            duration_ms: 0.0,
            streamed: false,
            error_message: Some("Client disconnected".to_string()),
            original_response_body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMode, ProviderType};

    fn provider() -> Arc<Provider> {
        Arc::new(Provider {
            id: "p".into(),
            name: "P".into(),
            base_url: "https://example.com".into(),
            mode: ProviderMode::Inject,
            provider_type: ProviderType::Anthropic,
            api_key: None,
            auth_header: "authorization".into(),
            model_map: vec![],
            vl_model_map: vec![],
            headers: Default::default(),
            enabled: true,
        })
    }

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = RequestTask::generate_id();
        let b = RequestTask::generate_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
    }

    #[test]
    fn abort_is_idempotent_and_keeps_first_reason() {
        let handle = AbortHandle::new();
        handle.abort(CancelReason::ClientDisconnect);
        handle.abort(CancelReason::QueueTimeout);
        assert_eq!(handle.reason(), Some(CancelReason::ClientDisconnect));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_if_already_aborted() {
        let handle = AbortHandle::new();
        handle.abort(CancelReason::Explicit);
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.cancelled())
            .await
            .expect("should resolve without waiting");
    }

    #[test]
    fn mark_disconnected_flips_cancelled_and_client_alive() {
        let task = RequestTask::new(
            "id1".into(),
            "POST".into(),
            "http://x".into(),
            "/v1/messages".into(),
            vec![],
            vec![],
            provider(),
            false,
            None,
        );
        assert!(!task.is_cancelled());
        task.mark_disconnected();
        assert!(task.is_cancelled());
        assert_eq!(task.abort.reason(), Some(CancelReason::ClientDisconnect));
    }

    #[test]
    fn proxy_result_disconnected_is_499() {
        let r = ProxyResult::disconnected();
        assert_eq!(r.status_code, 499);
        assert!(!r.is_success());
    }

    #[test]
    fn proxy_result_success_range() {
        let mut r = ProxyResult::disconnected();
        r.status_code = 200;
        r.error_message = None;
        assert!(r.is_success());
        r.status_code = 404;
        assert!(!r.is_success());
    }
}
