//! The backend-agnostic storage interface (§4.G). Every method here runs
//! synchronously on the dedicated writer thread — never on the dataplane.

use crate::model::{CompletedUpdate, LogFilter, LogStats, LogStatus, RequestLog};

pub trait LogStore: Send {
    fn insert_pending(&mut self, log: &RequestLog) -> anyhow::Result<()>;
    fn write_batch(&mut self, logs: &[RequestLog]) -> anyhow::Result<()>;
    fn update_completed(&mut self, client_id: &str, update: &CompletedUpdate) -> anyhow::Result<()>;
    fn update_status(
        &mut self,
        client_id: &str,
        status: LogStatus,
        status_code: Option<u16>,
        duration: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;
    fn query(&self, filter: &LogFilter) -> anyhow::Result<(Vec<RequestLog>, usize)>;
    fn get_by_id(&self, id: &str) -> anyhow::Result<Option<RequestLog>>;
    fn delete(&mut self, ids: &[String]) -> anyhow::Result<usize>;
    fn clear_all(&mut self) -> anyhow::Result<()>;
    fn stats(&self) -> anyhow::Result<LogStats>;
    /// Delete rows older than `max_age_days`; returns the number removed
    /// (§4.G `cleanOldLogs`).
    fn clean_old(&mut self, max_age_days: i64, now_ts: i64) -> anyhow::Result<usize>;
}
