//! An append-only, newline-delimited JSON file store with a small
//! in-memory offset index, mirroring `ando-admin::persist`'s atomic
//! tmp-file-then-rename write and `ando-store::watcher`'s single-consumer
//! access discipline (§4.G "Storage backends").

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::model::{CompletedUpdate, LogFilter, LogStats, LogStatus, RequestLog};
use crate::store::LogStore;

const MAX_AGE_DAYS_DEFAULT: i64 = 30;
const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
const TRIM_TO_ENTRIES: usize = 1000;

pub struct EmbeddedFileStore {
    path: PathBuf,
    index: HashMap<String, u64>,
    append: File,
}

impl EmbeddedFileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut index = HashMap::new();
        if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            let mut offset: u64 = 0;
            let mut line = String::new();
            loop {
                line.clear();
                let bytes_read = reader.read_line(&mut line)?;
                if bytes_read == 0 {
                    break;
                }
                if let Ok(log) = serde_json::from_str::<RequestLog>(line.trim_end()) {
                    index.insert(log.id.clone(), offset);
                } else {
                    tracing::warn!(path = %path.display(), "skipping malformed log line on load");
                }
                offset += bytes_read as u64;
            }
        }
        let append = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, index, append })
    }

    fn append_row(&mut self, log: &RequestLog) -> anyhow::Result<()> {
        let offset = self.append.metadata()?.len();
        let mut line = serde_json::to_string(log)?;
        line.push('\n');
        self.append.write_all(line.as_bytes())?;
        self.append.flush()?;
        self.index.insert(log.id.clone(), offset);
        Ok(())
    }

    fn read_row_at(path: &Path, offset: u64) -> anyhow::Result<Option<RequestLog>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(serde_json::from_str(line.trim_end()).ok())
    }

    fn load_current_rows(&self) -> anyhow::Result<Vec<RequestLog>> {
        let mut rows = Vec::with_capacity(self.index.len());
        for offset in self.index.values() {
            if let Some(log) = Self::read_row_at(&self.path, *offset)? {
                rows.push(log);
            }
        }
        Ok(rows)
    }

    /// Rewrite the file from `rows` via a sibling `.tmp` then `rename`,
    /// rebuilding the offset index in the same pass.
    fn compact_rewrite(&mut self, mut rows: Vec<RequestLog>) -> anyhow::Result<()> {
        rows.sort_by_key(|r| r.timestamp);
        let tmp_path = self.path.with_extension("ndjson.tmp");
        let mut tmp = File::create(&tmp_path)?;
        let mut index = HashMap::new();
        let mut offset: u64 = 0;
        for row in &rows {
            let mut line = serde_json::to_string(row)?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
            index.insert(row.id.clone(), offset);
            offset += line.len() as u64;
        }
        tmp.flush()?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.index = index;
        self.append = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }

    fn merge_completed(mut log: RequestLog, update: &CompletedUpdate) -> RequestLog {
        log.status_code = Some(update.status_code);
        log.response_body = update.response_body.clone();
        log.duration = update.duration;
        log.success = update.success;
        log.error_message = update.error_message.clone();
        log.original_response_body = update.original_response_body.clone();
        log.status = LogStatus::Completed;
        log
    }
}

impl LogStore for EmbeddedFileStore {
    fn insert_pending(&mut self, log: &RequestLog) -> anyhow::Result<()> {
        self.append_row(log)
    }

    fn write_batch(&mut self, logs: &[RequestLog]) -> anyhow::Result<()> {
        for log in logs {
            self.append_row(log)?;
        }
        Ok(())
    }

    fn update_completed(&mut self, client_id: &str, update: &CompletedUpdate) -> anyhow::Result<()> {
        let Some(offset) = self.index.get(client_id).copied() else {
            return Ok(());
        };
        let Some(current) = Self::read_row_at(&self.path, offset)? else {
            return Ok(());
        };
        let updated = Self::merge_completed(current, update);
        self.append_row(&updated)
    }

    fn update_status(
        &mut self,
        client_id: &str,
        status: LogStatus,
        status_code: Option<u16>,
        duration: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(offset) = self.index.get(client_id).copied() else {
            return Ok(());
        };
        let Some(mut current) = Self::read_row_at(&self.path, offset)? else {
            return Ok(());
        };
        current.status = status;
        current.status_code = status_code;
        current.duration = duration;
        current.error_message = error_message.map(str::to_string);
        self.append_row(&current)
    }

    fn query(&self, filter: &LogFilter) -> anyhow::Result<(Vec<RequestLog>, usize)> {
        let mut rows = self.load_current_rows()?;
        rows.retain(|row| filter.matches(row));
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = rows.len();
        let page = rows.into_iter().skip(filter.offset).take(filter.limit).collect();
        Ok((page, total))
    }

    fn get_by_id(&self, id: &str) -> anyhow::Result<Option<RequestLog>> {
        match self.index.get(id) {
            Some(offset) => Self::read_row_at(&self.path, *offset),
            None => Ok(None),
        }
    }

    fn delete(&mut self, ids: &[String]) -> anyhow::Result<usize> {
        let rows = self.load_current_rows()?;
        let before = rows.len();
        let remaining: Vec<RequestLog> = rows.into_iter().filter(|r| !ids.contains(&r.id)).collect();
        let removed = before - remaining.len();
        self.compact_rewrite(remaining)?;
        Ok(removed)
    }

    fn clear_all(&mut self) -> anyhow::Result<()> {
        self.compact_rewrite(Vec::new())
    }

    fn stats(&self) -> anyhow::Result<LogStats> {
        let rows = self.load_current_rows()?;
        let total = rows.len();
        let success = rows.iter().filter(|r| r.success).count();
        let avg_duration = if total == 0 {
            0.0
        } else {
            rows.iter().map(|r| r.duration).sum::<f64>() / total as f64
        };
        Ok(LogStats { total, success, failed: total - success, avg_duration })
    }

    fn clean_old(&mut self, max_age_days: i64, now_ts: i64) -> anyhow::Result<usize> {
        let max_age_days = if max_age_days <= 0 { MAX_AGE_DAYS_DEFAULT } else { max_age_days };
        let cutoff = now_ts - max_age_days * 24 * 60 * 60 * 1000;
        let mut rows = self.load_current_rows()?;
        let before = rows.len();
        rows.retain(|r| r.timestamp >= cutoff);

        if self.append.metadata()?.len() > MAX_FILE_BYTES && rows.len() > TRIM_TO_ENTRIES {
            rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            rows.truncate(TRIM_TO_ENTRIES);
        }

        let removed = before - rows.len();
        self.compact_rewrite(rows)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log(id: &str, ts: i64) -> RequestLog {
        RequestLog {
            id: id.to_string(),
            timestamp: ts,
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
            route_type: crate::model::RouteType::Router,
            model: None,
        }
    }

    #[test]
    fn insert_then_get_by_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        store.insert_pending(&sample_log("req-1", 100)).unwrap();
        let fetched = store.get_by_id("req-1").unwrap().unwrap();
        assert_eq!(fetched.timestamp, 100);
        assert_eq!(fetched.status, LogStatus::Pending);
    }

    #[test]
    fn update_completed_overwrites_latest_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        store.insert_pending(&sample_log("req-1", 100)).unwrap();
        store
            .update_completed(
                "req-1",
                &CompletedUpdate {
                    status_code: 200,
                    response_body: Some("B64:aGk=".into()),
                    duration: 42.0,
                    success: true,
                    error_message: None,
                    original_response_body: None,
                },
            )
            .unwrap();
        let fetched = store.get_by_id("req-1").unwrap().unwrap();
        assert_eq!(fetched.status, LogStatus::Completed);
        assert_eq!(fetched.status_code, Some(200));
        assert_eq!(fetched.duration, 42.0);
    }

    #[test]
    fn reopen_rebuilds_index_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.ndjson");
        {
            let mut store = EmbeddedFileStore::open(&path).unwrap();
            store.insert_pending(&sample_log("req-1", 100)).unwrap();
            store.insert_pending(&sample_log("req-2", 200)).unwrap();
        }
        let reopened = EmbeddedFileStore::open(&path).unwrap();
        assert!(reopened.get_by_id("req-1").unwrap().is_some());
        assert!(reopened.get_by_id("req-2").unwrap().is_some());
    }

    #[test]
    fn query_filters_sorts_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        for i in 0..5 {
            store.insert_pending(&sample_log(&format!("req-{i}"), 100 + i)).unwrap();
        }
        let mut filter = LogFilter::new();
        filter.limit = 2;
        let (page, total) = store.query(&filter).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "req-4");
    }

    #[test]
    fn delete_removes_only_named_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        store.insert_pending(&sample_log("req-1", 100)).unwrap();
        store.insert_pending(&sample_log("req-2", 200)).unwrap();
        let removed = store.delete(&vec!["req-1".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_by_id("req-1").unwrap().is_none());
        assert!(store.get_by_id("req-2").unwrap().is_some());
    }

    #[test]
    fn clean_old_removes_rows_past_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        let day_ms = 24 * 60 * 60 * 1000;
        store.insert_pending(&sample_log("old", 0)).unwrap();
        store.insert_pending(&sample_log("new", 40 * day_ms)).unwrap();
        let removed = store.clean_old(30, 40 * day_ms).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_by_id("old").unwrap().is_none());
        assert!(store.get_by_id("new").unwrap().is_some());
    }

    #[test]
    fn clear_all_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EmbeddedFileStore::open(dir.path().join("logs.ndjson")).unwrap();
        store.insert_pending(&sample_log("req-1", 100)).unwrap();
        store.clear_all().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 0);
    }
}
