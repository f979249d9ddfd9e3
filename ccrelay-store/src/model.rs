//! The `RequestLog` row and query filter shapes (§3, §4.G).

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Completed,
    Cancelled,
    Timeout,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Completed => "completed",
            LogStatus::Cancelled => "cancelled",
            LogStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Block,
    Passthrough,
    Router,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Block => "block",
            RouteType::Passthrough => "passthrough",
            RouteType::Router => "router",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: i64,
    pub provider_id: String,
    pub provider_name: String,
    pub method: String,
    pub path: String,
    pub target_url: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub original_request_body: Option<String>,
    pub original_response_body: Option<String>,
    pub status_code: Option<u16>,
    pub duration: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub client_id: String,
    pub status: LogStatus,
    pub route_type: RouteType,
    pub model: Option<String>,
}

/// Prefix large text fields with `B64:` + base64 of their UTF-8 bytes
/// (§4.G, §3 "Large text fields").
pub fn b64_encode(text: &str) -> String {
    format!("B64:{}", base64::engine::general_purpose::STANDARD.encode(text.as_bytes()))
}

/// Decode a `B64:`-prefixed field; a field without the prefix is returned
/// unchanged (older rows, or callers that never encoded it).
pub fn b64_decode(field: &str) -> String {
    match field.strip_prefix("B64:") {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| field.to_string()),
        None => field.to_string(),
    }
}

/// Derive a `model` field from a parsed request body (`$.model` or
/// `$.data.model`) or else from a `/models/<name>` path segment (§4.G).
pub fn derive_model(body: Option<&str>, path: &str) -> Option<String> {
    if let Some(body) = body {
        let decoded = b64_decode(body);
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&decoded) {
            if let Some(m) = value.get("model").and_then(|v| v.as_str()) {
                return Some(m.to_string());
            }
            if let Some(m) = value.get("data").and_then(|d| d.get("model")).and_then(|v| v.as_str()) {
                return Some(m.to_string());
            }
        }
    }
    path.strip_prefix("/models/").map(|name| name.trim_end_matches('/').to_string())
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub provider_id: Option<String>,
    pub method: Option<String>,
    pub path_pattern: Option<String>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub has_error: Option<bool>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl LogFilter {
    pub fn new() -> Self {
        Self { limit: 100, offset: 0, ..Default::default() }
    }

    pub fn matches(&self, log: &RequestLog) -> bool {
        if let Some(p) = &self.provider_id {
            if &log.provider_id != p {
                return false;
            }
        }
        if let Some(m) = &self.method {
            if &log.method != m {
                return false;
            }
        }
        if let Some(pat) = &self.path_pattern {
            if !log.path.contains(pat.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_duration {
            if log.duration < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration {
            if log.duration > max {
                return false;
            }
        }
        if let Some(has_error) = self.has_error {
            if log.error_message.is_some() != has_error {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if log.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if log.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub avg_duration: f64,
}

/// Fields applied by `updateLogCompleted` (§4.G).
#[derive(Debug, Clone)]
pub struct CompletedUpdate {
    pub status_code: u16,
    pub response_body: Option<String>,
    pub duration: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub original_response_body: Option<String>,
}
