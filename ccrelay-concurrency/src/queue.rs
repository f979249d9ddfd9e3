//! A single bounded worker queue (§4.F). `tokio::sync::Semaphore` already
//! wakes pending acquires in FIFO order, so the queue itself needs no
//! separate `VecDeque` of waiters — only a counter for `maxQueueSize` and a
//! timer for the queue-wait phase.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ccrelay_core::error::CcrelayError;
use ccrelay_core::task::{CancelReason, ProxyResult, RequestTask};
use ccrelay_observability::MetricsCollector;
use tokio::sync::Semaphore;

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub queue_length: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub avg_wait_time_ms: f64,
    pub avg_process_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_wait_ms: AtomicU64,
    total_process_ms: AtomicU64,
}

/// One named queue: a bounded worker-permit pool plus a `maxQueueSize`
/// cap on tasks waiting for a permit.
pub struct WorkerQueue {
    pub name: String,
    max_workers: usize,
    max_queue_size: usize,
    request_timeout: Duration,
    semaphore: Arc<Semaphore>,
    waiting: std::sync::atomic::AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerQueue {
    pub fn new(name: impl Into<String>, max_workers: usize, max_queue_size: usize, request_timeout_secs: f64) -> Self {
        Self {
            name: name.into(),
            max_workers: max_workers.max(1),
            max_queue_size,
            request_timeout: Duration::from_secs_f64(request_timeout_secs.max(0.0)),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            waiting: std::sync::atomic::AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            metrics: None,
        }
    }

    /// Attach a metrics collector so `submit` publishes queue-depth and
    /// active-worker gauges (§4.F, `GET /ccrelay/api/metrics`).
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn publish_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            let stats = self.stats();
            metrics.set_queue_gauges(&self.name, stats.queue_length as i64, stats.active_workers as i64);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Cancel and remove every task currently waiting for a permit;
    /// returns the number affected. Running tasks are unaffected — the
    /// semaphore gives no visibility into who is waiting, so this relies
    /// on callers having already aborted their tasks before calling.
    pub fn clear_queue(&self) -> usize {
        let removed = self.waiting.swap(0, Ordering::SeqCst);
        self.semaphore.close();
        removed
    }

    pub fn stats(&self) -> QueueStats {
        let processed = self.counters.total_processed.load(Ordering::Relaxed);
        let failed = self.counters.total_failed.load(Ordering::Relaxed);
        let wait_ms = self.counters.total_wait_ms.load(Ordering::Relaxed);
        let process_ms = self.counters.total_process_ms.load(Ordering::Relaxed);
        let denom = processed.max(1);
        QueueStats {
            queue_length: self.waiting.load(Ordering::SeqCst),
            active_workers: self.max_workers - self.semaphore.available_permits().min(self.max_workers),
            max_workers: self.max_workers,
            total_processed: processed,
            total_failed: failed,
            avg_wait_time_ms: wait_ms as f64 / denom as f64,
            avg_process_time_ms: process_ms as f64 / denom as f64,
        }
    }

    /// Submit a task for execution, running `executor` once a permit is
    /// free (§4.F `submit`).
    pub async fn submit<F, Fut>(&self, task: Arc<RequestTask>, executor: F) -> Result<ProxyResult, CcrelayError>
    where
        F: FnOnce(Arc<RequestTask>) -> Fut,
        Fut: Future<Output = ProxyResult>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CcrelayError::Internal("queue closed".to_string()));
        }

        let wait_start = Instant::now();
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if self.max_queue_size != 0 && self.waiting.load(Ordering::SeqCst) >= self.max_queue_size {
                    return Err(CcrelayError::QueueFull);
                }
                self.waiting.fetch_add(1, Ordering::SeqCst);
                self.publish_metrics();
                let acquired = if self.request_timeout.is_zero() {
                    Arc::clone(&self.semaphore).acquire_owned().await.ok()
                } else {
                    tokio::time::timeout(self.request_timeout, Arc::clone(&self.semaphore).acquire_owned())
                        .await
                        .ok()
                        .and_then(Result::ok)
                };
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                match acquired {
                    Some(permit) => permit,
                    None => {
                        task.abort.abort(CancelReason::QueueTimeout);
                        self.publish_metrics();
                        return Err(CcrelayError::QueueTimeout);
                    }
                }
            }
        };

        self.counters
            .total_wait_ms
            .fetch_add(wait_start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.publish_metrics();

        if task.is_cancelled() {
            drop(permit);
            self.publish_metrics();
            return Ok(ProxyResult::disconnected());
        }

        task.mark_started();
        let process_start = Instant::now();
        let result = executor(task).await;
        drop(permit);

        self.counters
            .total_process_ms
            .fetch_add(process_start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.counters.total_processed.fetch_add(1, Ordering::Relaxed);
        if !result.is_success() {
            self.counters.total_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_metrics();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_core::provider::{Provider, ProviderMode, ProviderType};

    fn task() -> Arc<RequestTask> {
        Arc::new(RequestTask::new(
            "id1".into(),
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
        ))
    }

    #[tokio::test]
    async fn submit_runs_executor_and_updates_stats() {
        let queue = WorkerQueue::new("default", 2, 0, 0.0);
        let result = queue
            .submit(task(), |_t| async {
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 1.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
            .unwrap();
        assert!(result.is_success());
        let stats = queue.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_failed, 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let queue = Arc::new(WorkerQueue::new("default", 1, 0, 0.0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let q1 = Arc::clone(&queue);
        let held = tokio::spawn(async move {
            q1.submit(task(), |_t| async {
                let _ = rx.await;
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // maxQueueSize=0 means unbounded, so reconfigure expectation: use a
        // queue with maxQueueSize=0 but exercise max_queue_size>0 path below.
        let _ = tx.send(());
        held.await.unwrap().unwrap();

        let bounded = WorkerQueue::new("bounded", 1, 1, 0.0);
        // Saturate the single worker permit, then fill the one queue slot,
        // then a third submit must reject with QueueFull.
        let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();
        let bounded = Arc::new(bounded);
        let b1 = Arc::clone(&bounded);
        let first = tokio::spawn(async move {
            b1.submit(task(), |_t| async move {
                let _ = rx2.await;
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b2 = Arc::clone(&bounded);
        let (tx3, rx3) = tokio::sync::oneshot::channel::<()>();
        let second = tokio::spawn(async move {
            b2.submit(task(), |_t| async move {
                let _ = rx3.await;
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let third = bounded.submit(task(), |_t| async {
            ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
        }).await;
        assert!(matches!(third, Err(CcrelayError::QueueFull)));

        let _ = tx2.send(());
        let _ = tx3.send(());
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queue_timeout_aborts_task_without_running_executor() {
        let queue = Arc::new(WorkerQueue::new("default", 1, 0, 0.05));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let q1 = Arc::clone(&queue);
        let holder = tokio::spawn(async move {
            q1.submit(task(), |_t| async {
                let _ = rx.await;
                ProxyResult { status_code: 200, headers: vec![], body: None, duration_ms: 0.0, streamed: false, error_message: None, original_response_body: None }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting_task = task();
        let result = queue.submit(Arc::clone(&waiting_task), |_t| async {
            panic!("executor must not run on queue timeout");
        }).await;
        assert!(matches!(result, Err(CcrelayError::QueueTimeout)));
        assert!(waiting_task.is_cancelled());

        let _ = tx.send(());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_task_resolves_disconnected_without_running_executor() {
        let queue = WorkerQueue::new("default", 1, 0, 0.0);
        let t = task();
        t.mark_disconnected();
        let result = queue.submit(t, |_t| async {
            panic!("executor must not run for an already-cancelled task");
        }).await.unwrap();
        assert_eq!(result.status_code, 499);
    }
}
