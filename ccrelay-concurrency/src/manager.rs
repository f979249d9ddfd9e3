//! Queue selection across the optional default queue and the configured
//! per-route queues (§4.F, §4.K step 6).

use std::future::Future;
use std::sync::Arc;

use ccrelay_core::config::RouteQueueConfig;
use ccrelay_core::error::CcrelayError;
use ccrelay_core::pattern::RouteQueueMatcher;
use ccrelay_core::task::{ProxyResult, RequestTask};
use ccrelay_observability::MetricsCollector;

use crate::queue::{QueueStats, WorkerQueue};

struct RouteQueue {
    matcher: RouteQueueMatcher,
    queue: WorkerQueue,
}

/// Owns zero or more named route queues plus an optional default queue,
/// and routes each task to the first matching one.
pub struct ConcurrencyManager {
    route_queues: Vec<RouteQueue>,
    default_queue: Option<WorkerQueue>,
}

impl ConcurrencyManager {
    pub fn new(default_queue: Option<WorkerQueue>, route_configs: &[RouteQueueConfig]) -> Self {
        Self::with_metrics(default_queue, route_configs, None)
    }

    pub fn with_metrics(default_queue: Option<WorkerQueue>, route_configs: &[RouteQueueConfig], metrics: Option<Arc<MetricsCollector>>) -> Self {
        let default_queue = match (default_queue, &metrics) {
            (Some(queue), Some(metrics)) => Some(queue.with_metrics(Arc::clone(metrics))),
            (queue, _) => queue,
        };
        let route_queues = route_configs
            .iter()
            .map(|cfg| {
                let queue = WorkerQueue::new(
                    cfg.name.clone().unwrap_or_else(|| cfg.pattern.clone()),
                    cfg.max_workers,
                    cfg.max_queue_size,
                    cfg.request_timeout,
                );
                let queue = match &metrics {
                    Some(metrics) => queue.with_metrics(Arc::clone(metrics)),
                    None => queue,
                };
                RouteQueue { matcher: RouteQueueMatcher::compile(&cfg.pattern), queue }
            })
            .collect();
        Self { route_queues, default_queue }
    }

    fn queue_for(&self, path: &str) -> Option<&WorkerQueue> {
        for entry in &self.route_queues {
            if entry.matcher.matches(path) {
                return Some(&entry.queue);
            }
        }
        self.default_queue.as_ref()
    }

    /// Submit `task` for `path` through the matching queue, or run the
    /// executor directly when no queue is configured at all (§4.K step 6:
    /// "or direct execution if neither is configured").
    pub async fn submit<F, Fut>(&self, path: &str, task: Arc<RequestTask>, executor: F) -> Result<ProxyResult, CcrelayError>
    where
        F: FnOnce(Arc<RequestTask>) -> Fut,
        Fut: Future<Output = ProxyResult>,
    {
        match self.queue_for(path) {
            Some(queue) => queue.submit(task, executor).await,
            None => Ok(executor(task).await),
        }
    }

    pub fn clear_all_queues(&self) -> usize {
        let mut total = 0;
        if let Some(queue) = &self.default_queue {
            total += queue.clear_queue();
        }
        for entry in &self.route_queues {
            total += entry.queue.clear_queue();
        }
        total
    }

    pub fn close_all(&self) {
        if let Some(queue) = &self.default_queue {
            queue.close();
        }
        for entry in &self.route_queues {
            entry.queue.close();
        }
    }

    pub fn stats(&self) -> Vec<(String, QueueStats)> {
        let mut out = Vec::new();
        if let Some(queue) = &self.default_queue {
            out.push(("default".to_string(), queue.stats()));
        }
        for entry in &self.route_queues {
            out.push((entry.queue.name.clone(), entry.queue.stats()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_queue_match_takes_precedence_over_default() {
        let route_cfg = RouteQueueConfig {
            pattern: r"^/v1/messages".to_string(),
            max_workers: 1,
            max_queue_size: 0,
            request_timeout: 0.0,
            name: Some("messages".to_string()),
        };
        let manager = ConcurrencyManager::new(Some(WorkerQueue::new("default", 5, 0, 0.0)), &[route_cfg]);

        let names = manager.stats();
        assert_eq!(names[0].0, "default");
        assert_eq!(names[1].0, "messages");
    }

    #[tokio::test]
    async fn no_queue_configured_runs_executor_directly() {
        let manager = ConcurrencyManager::new(None, &[]);
        use ccrelay_core::provider::{Provider, ProviderMode, ProviderType};
        let task = Arc::new(RequestTask::new(
            "id".into(),
            "POST".into(),
            "http://x".into(),
            "/v1/messages".into(),
            vec![],
            vec![],
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
            }),
            false,
            None,
        ));
        let result = manager
            .submit("/v1/messages", task, |_t| async {
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
            .unwrap();
        assert!(result.is_success());
    }
}
