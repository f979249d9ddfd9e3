//! A `rusqlite`-backed relational store (§4.G "Storage backends"). Opened
//! once on the dedicated writer thread — `rusqlite::Connection` is `!Sync`
//! so it cannot be shared across threads, which is exactly the single-
//! writer discipline this driver already enforces.

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{CompletedUpdate, LogFilter, LogStats, LogStatus, RequestLog, RouteType};
use crate::store::LogStore;

const MAX_AGE_DAYS_DEFAULT: i64 = 30;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                provider_id TEXT NOT NULL,
                provider_name TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                target_url TEXT,
                request_body TEXT,
                response_body TEXT,
                original_request_body TEXT,
                original_response_body TEXT,
                status_code INTEGER,
                duration REAL NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                client_id TEXT NOT NULL,
                status TEXT NOT NULL,
                route_type TEXT NOT NULL,
                model TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_request_logs_client_id ON request_logs(client_id);",
        )?;
        Ok(Self { conn })
    }

    fn upsert(&self, log: &RequestLog) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO request_logs (
                id, timestamp, provider_id, provider_name, method, path, target_url,
                request_body, response_body, original_request_body, original_response_body,
                status_code, duration, success, error_message, client_id, status, route_type, model
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
            ON CONFLICT(id) DO UPDATE SET
                status_code=excluded.status_code, response_body=excluded.response_body,
                duration=excluded.duration, success=excluded.success,
                error_message=excluded.error_message, original_response_body=excluded.original_response_body,
                status=excluded.status",
            params![
                log.id,
                log.timestamp,
                log.provider_id,
                log.provider_name,
                log.method,
                log.path,
                log.target_url,
                log.request_body,
                log.response_body,
                log.original_request_body,
                log.original_response_body,
                log.status_code,
                log.duration,
                log.success as i64,
                log.error_message,
                log.client_id,
                log.status.as_str(),
                log.route_type.as_str(),
                log.model,
            ],
        )?;
        Ok(())
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<RequestLog> {
        let status: String = row.get("status")?;
        let route_type: String = row.get("route_type")?;
        Ok(RequestLog {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            provider_id: row.get("provider_id")?,
            provider_name: row.get("provider_name")?,
            method: row.get("method")?,
            path: row.get("path")?,
            target_url: row.get("target_url")?,
            request_body: row.get("request_body")?,
            response_body: row.get("response_body")?,
            original_request_body: row.get("original_request_body")?,
            original_response_body: row.get("original_response_body")?,
            status_code: row.get("status_code")?,
            duration: row.get("duration")?,
            success: row.get::<_, i64>("success")? != 0,
            error_message: row.get("error_message")?,
            client_id: row.get("client_id")?,
            status: parse_status(&status),
            route_type: parse_route_type(&route_type),
            model: row.get("model")?,
        })
    }
}

fn parse_status(s: &str) -> LogStatus {
    match s {
        "completed" => LogStatus::Completed,
        "cancelled" => LogStatus::Cancelled,
        "timeout" => LogStatus::Timeout,
        _ => LogStatus::Pending,
    }
}

fn parse_route_type(s: &str) -> RouteType {
    match s {
        "block" => RouteType::Block,
        "passthrough" => RouteType::Passthrough,
        _ => RouteType::Router,
    }
}

impl LogStore for SqliteStore {
    fn insert_pending(&mut self, log: &RequestLog) -> anyhow::Result<()> {
        self.upsert(log)
    }

    fn write_batch(&mut self, logs: &[RequestLog]) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for log in logs {
            self.upsert(log)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_completed(&mut self, client_id: &str, update: &CompletedUpdate) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE request_logs SET status_code=?1, response_body=?2, duration=?3, success=?4,
             error_message=?5, original_response_body=?6, status='completed' WHERE client_id=?7",
            params![
                update.status_code,
                update.response_body,
                update.duration,
                update.success as i64,
                update.error_message,
                update.original_response_body,
                client_id,
            ],
        )?;
        Ok(())
    }

    fn update_status(
        &mut self,
        client_id: &str,
        status: LogStatus,
        status_code: Option<u16>,
        duration: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE request_logs SET status=?1, status_code=?2, duration=?3, error_message=?4 WHERE client_id=?5",
            params![status.as_str(), status_code, duration, error_message, client_id],
        )?;
        Ok(())
    }

    fn query(&self, filter: &LogFilter) -> anyhow::Result<(Vec<RequestLog>, usize)> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(p) = &filter.provider_id {
            clauses.push("provider_id = ?".to_string());
            values.push(Box::new(p.clone()));
        }
        if let Some(m) = &filter.method {
            clauses.push("method = ?".to_string());
            values.push(Box::new(m.clone()));
        }
        if let Some(pat) = &filter.path_pattern {
            clauses.push("path LIKE ?".to_string());
            values.push(Box::new(format!("%{pat}%")));
        }
        if let Some(min) = filter.min_duration {
            clauses.push("duration >= ?".to_string());
            values.push(Box::new(min));
        }
        if let Some(max) = filter.max_duration {
            clauses.push("duration <= ?".to_string());
            values.push(Box::new(max));
        }
        if let Some(has_error) = filter.has_error {
            clauses.push(if has_error { "error_message IS NOT NULL".to_string() } else { "error_message IS NULL".to_string() });
        }
        if let Some(start) = filter.start_time {
            clauses.push("timestamp >= ?".to_string());
            values.push(Box::new(start));
        }
        if let Some(end) = filter.end_time {
            clauses.push("timestamp <= ?".to_string());
            values.push(Box::new(end));
        }

        let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };

        let count_sql = format!("SELECT COUNT(*) FROM request_logs {where_clause}");
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let total: usize = self.conn.query_row(&count_sql, param_refs.as_slice(), |row| row.get(0))?;

        let page_sql = format!(
            "SELECT * FROM request_logs {where_clause} ORDER BY timestamp DESC LIMIT ?{} OFFSET ?{}",
            values.len() + 1,
            values.len() + 2
        );
        let mut page_values = values;
        page_values.push(Box::new(filter.limit as i64));
        page_values.push(Box::new(filter.offset as i64));
        let page_refs: Vec<&dyn rusqlite::ToSql> = page_values.iter().map(|v| v.as_ref()).collect();

        let mut stmt = self.conn.prepare(&page_sql)?;
        let rows = stmt
            .query_map(page_refs.as_slice(), Self::row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    }

    fn get_by_id(&self, id: &str) -> anyhow::Result<Option<RequestLog>> {
        let result = self
            .conn
            .query_row("SELECT * FROM request_logs WHERE id = ?1", params![id], Self::row_to_log)
            .optional()?;
        Ok(result)
    }

    fn delete(&mut self, ids: &[String]) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM request_logs WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let removed = self.conn.execute(&sql, params.as_slice())?;
        Ok(removed)
    }

    fn clear_all(&mut self) -> anyhow::Result<()> {
        self.conn.execute("DELETE FROM request_logs", [])?;
        Ok(())
    }

    fn stats(&self) -> anyhow::Result<LogStats> {
        let total: usize = self.conn.query_row("SELECT COUNT(*) FROM request_logs", [], |r| r.get(0))?;
        let success: usize = self.conn.query_row("SELECT COUNT(*) FROM request_logs WHERE success = 1", [], |r| r.get(0))?;
        let avg_duration: f64 = self
            .conn
            .query_row("SELECT COALESCE(AVG(duration), 0.0) FROM request_logs", [], |r| r.get(0))?;
        Ok(LogStats { total, success, failed: total - success, avg_duration })
    }

    fn clean_old(&mut self, max_age_days: i64, now_ts: i64) -> anyhow::Result<usize> {
        let max_age_days = if max_age_days <= 0 { MAX_AGE_DAYS_DEFAULT } else { max_age_days };
        let cutoff = now_ts - max_age_days * 24 * 60 * 60 * 1000;
        let removed = self.conn.execute("DELETE FROM request_logs WHERE timestamp < ?1", params![cutoff])?;
        Ok(removed)
    }
}
