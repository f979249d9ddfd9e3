//! The dedicated writer thread and the `Logger` handle the rest of ccrelay
//! talks to (§4.G). `insertLog` is fire-and-forget and batched up to 50
//! entries or 1 second, mirroring the gateway's `VictoriaLogsExporter`
//! batch-then-flush-on-interval-or-size loop; every other operation is
//! `await`ed via a `oneshot` reply.

use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tokio::sync::oneshot;

use crate::embedded::EmbeddedFileStore;
use crate::model::{CompletedUpdate, LogFilter, LogStats, LogStatus, RequestLog};
use crate::sqlite::SqliteStore;
use crate::store::LogStore;

const BATCH_MAX: usize = 50;
const BATCH_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    InsertLog(RequestLog),
    InsertLogPending(RequestLog),
    UpdateCompleted(String, CompletedUpdate),
    UpdateStatus(String, LogStatus, Option<u16>, f64, Option<String>),
    Query(LogFilter, oneshot::Sender<anyhow::Result<(Vec<RequestLog>, usize)>>),
    GetById(String, oneshot::Sender<anyhow::Result<Option<RequestLog>>>),
    Delete(Vec<String>, oneshot::Sender<anyhow::Result<usize>>),
    ClearAll(oneshot::Sender<anyhow::Result<()>>),
    Stats(oneshot::Sender<anyhow::Result<LogStats>>),
    CleanOld(i64, i64, oneshot::Sender<anyhow::Result<usize>>),
    ForceFlush(oneshot::Sender<()>),
    Close,
}

/// Chooses the backend from `RouterConfig.logging.database`: a
/// `sqlite://`-prefixed URI selects the relational store, anything else is
/// treated as a plain filesystem path for the embedded NDJSON store.
pub fn open_backend(database: &str) -> anyhow::Result<Box<dyn LogStore>> {
    if let Some(sqlite_path) = database.strip_prefix("sqlite://") {
        Ok(Box::new(SqliteStore::open(sqlite_path)?))
    } else {
        Ok(Box::new(EmbeddedFileStore::open(database)?))
    }
}

/// The handle other crates hold. Cloneable: cloning just clones the
/// channel sender, which is how `Arc`-free fan-out to many callers works.
#[derive(Clone)]
pub struct Logger {
    tx: Sender<Command>,
    enabled: bool,
}

impl Logger {
    /// Spawn the writer thread against `backend` and return a handle.
    /// When `enabled` is false, every write is a true no-op and no thread
    /// is spawned at all, mirroring the exporter's `Option<Sender>` story.
    pub fn start(backend: Option<Box<dyn LogStore>>) -> Self {
        let Some(backend) = backend else {
            let (tx, _rx) = bounded(1);
            return Self { tx, enabled: false };
        };

        let (tx, rx) = bounded::<Command>(4096);
        std::thread::Builder::new()
            .name("ccrelay-logger".to_string())
            .spawn(move || writer_loop(backend, rx))
            .expect("failed to spawn logger writer thread");

        Self { tx, enabled: true }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn insert_log(&self, log: RequestLog) {
        if !self.enabled {
            return;
        }
        let _ = self.tx.send(Command::InsertLog(log));
    }

    pub fn insert_log_pending(&self, log: RequestLog) {
        if !self.enabled {
            return;
        }
        let _ = self.tx.send(Command::InsertLogPending(log));
    }

    pub fn update_log_completed(&self, client_id: String, update: CompletedUpdate) {
        if !self.enabled {
            return;
        }
        let _ = self.tx.send(Command::UpdateCompleted(client_id, update));
    }

    pub fn update_log_status(
        &self,
        client_id: String,
        status: LogStatus,
        status_code: Option<u16>,
        duration: f64,
        error_message: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        let _ = self.tx.send(Command::UpdateStatus(client_id, status, status_code, duration, error_message));
    }

    pub async fn query_logs(&self, filter: LogFilter) -> anyhow::Result<(Vec<RequestLog>, usize)> {
        if !self.enabled {
            return Ok((Vec::new(), 0));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::Query(filter, reply_tx)).map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn get_log_by_id(&self, id: String) -> anyhow::Result<Option<RequestLog>> {
        if !self.enabled {
            return Ok(None);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::GetById(id, reply_tx)).map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn delete_logs(&self, ids: Vec<String>) -> anyhow::Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::Delete(ids, reply_tx)).map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn clear_all_logs(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::ClearAll(reply_tx)).map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn get_stats(&self) -> anyhow::Result<LogStats> {
        if !self.enabled {
            return Ok(LogStats::default());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::Stats(reply_tx)).map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn clean_old_logs(&self, max_age_days: i64, now_ts: i64) -> anyhow::Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::CleanOld(max_age_days, now_ts, reply_tx))
            .map_err(|_| anyhow::anyhow!("logger closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("logger closed"))?
    }

    pub async fn force_flush(&self) {
        if !self.enabled {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::ForceFlush(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub fn close(&self) {
        if self.enabled {
            let _ = self.tx.send(Command::Close);
        }
    }
}

fn writer_loop(mut backend: Box<dyn LogStore>, rx: crossbeam_channel::Receiver<Command>) {
    let mut batch: Vec<RequestLog> = Vec::with_capacity(BATCH_MAX);

    loop {
        match rx.recv_timeout(BATCH_INTERVAL) {
            Ok(Command::InsertLog(log)) => {
                batch.push(log);
                if batch.len() >= BATCH_MAX {
                    flush_batch(&mut backend, &mut batch);
                }
            }
            Ok(Command::InsertLogPending(log)) => {
                if let Err(e) = backend.insert_pending(&log) {
                    tracing::warn!(error = %e, "insert_pending failed");
                }
            }
            Ok(Command::UpdateCompleted(client_id, update)) => {
                if let Err(e) = backend.update_completed(&client_id, &update) {
                    tracing::warn!(error = %e, "update_completed failed");
                }
            }
            Ok(Command::UpdateStatus(client_id, status, status_code, duration, error_message)) => {
                if let Err(e) = backend.update_status(&client_id, status, status_code, duration, error_message.as_deref()) {
                    tracing::warn!(error = %e, "update_status failed");
                }
            }
            Ok(Command::Query(filter, reply)) => {
                let _ = reply.send(backend.query(&filter));
            }
            Ok(Command::GetById(id, reply)) => {
                let _ = reply.send(backend.get_by_id(&id));
            }
            Ok(Command::Delete(ids, reply)) => {
                let _ = reply.send(backend.delete(&ids));
            }
            Ok(Command::ClearAll(reply)) => {
                let _ = reply.send(backend.clear_all());
            }
            Ok(Command::Stats(reply)) => {
                let _ = reply.send(backend.stats());
            }
            Ok(Command::CleanOld(max_age_days, now_ts, reply)) => {
                flush_batch(&mut backend, &mut batch);
                let _ = reply.send(backend.clean_old(max_age_days, now_ts));
            }
            Ok(Command::ForceFlush(reply)) => {
                flush_batch(&mut backend, &mut batch);
                let _ = reply.send(());
            }
            Ok(Command::Close) => {
                flush_batch(&mut backend, &mut batch);
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                flush_batch(&mut backend, &mut batch);
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                flush_batch(&mut backend, &mut batch);
                break;
            }
        }
    }
}

fn flush_batch(backend: &mut Box<dyn LogStore>, batch: &mut Vec<RequestLog>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = backend.write_batch(batch) {
        tracing::warn!(error = %e, count = batch.len(), "log batch flush failed");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteType;

    fn sample_log(id: &str) -> RequestLog {
        RequestLog {
            id: id.to_string(),
            timestamp: 100,
            provider_id: "official".into(),
            provider_name: "Official".into(),
            method: "POST".into(),
            path: "/v1/messages".into(),
            target_url: None,
            request_body: None,
            response_body: None,
            original_request_body: None,
            original_response_body: None,
            status_code: None,
            duration: 0.0,
            success: false,
            error_message: None,
            client_id: id.to_string(),
            status: LogStatus::Pending,
            route_type: RouteType::Router,
            model: None,
        }
    }

    #[tokio::test]
    async fn disabled_logger_is_true_no_op() {
        let logger = Logger::start(None);
        assert!(!logger.enabled());
        logger.insert_log(sample_log("req-1"));
        let (logs, total) = logger.query_logs(LogFilter::new()).await.unwrap();
        assert!(logs.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn insert_pending_then_query_sees_it_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path().join("logs.ndjson").to_str().unwrap()).unwrap();
        let logger = Logger::start(Some(backend));
        logger.insert_log_pending(sample_log("req-1"));
        logger.force_flush().await;
        let (logs, total) = logger.query_logs(LogFilter::new()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(logs[0].id, "req-1");
    }

    #[tokio::test]
    async fn batched_insert_log_flushes_on_force_flush() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path().join("logs.ndjson").to_str().unwrap()).unwrap();
        let logger = Logger::start(Some(backend));
        for i in 0..3 {
            logger.insert_log(sample_log(&format!("req-{i}")));
        }
        logger.force_flush().await;
        let (_, total) = logger.query_logs(LogFilter::new()).await.unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn open_backend_selects_sqlite_for_scheme_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.sqlite3");
        let uri = format!("sqlite://{}", path.to_str().unwrap());
        let backend = open_backend(&uri);
        assert!(backend.is_ok());
    }
}
