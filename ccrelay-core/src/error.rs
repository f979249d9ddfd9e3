use thiserror::Error;

/// Unified error type for ccrelay.
///
/// Every HTTP-facing boundary converts into this enum before a response is
/// written, so a client never sees a Rust `Debug` representation.
#[derive(Error, Debug)]
pub enum CcrelayError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid provider id: {0}")]
    InvalidProviderId(String),

    #[error("Cannot delete the official provider")]
    CannotDeleteOfficial,

    #[error("Queue full")]
    QueueFull,

    #[error("Queue timeout")]
    QueueTimeout,

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Proxy timeout")]
    ProxyTimeout,

    #[error("Translation error: {0}")]
    TranslationError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Invalid JSON in request body")]
    InvalidJson,

    #[error("API endpoint not found")]
    ApiNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl CcrelayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            CcrelayError::UnknownProvider(_) => 404,
            CcrelayError::InvalidProviderId(_) => 400,
            CcrelayError::CannotDeleteOfficial => 400,
            CcrelayError::QueueFull | CcrelayError::QueueTimeout => 503,
            CcrelayError::ClientDisconnected => 499,
            CcrelayError::ProxyError(_) => 502,
            CcrelayError::ProxyTimeout => 504,
            CcrelayError::TranslationError(_) => 502,
            CcrelayError::InvalidJson => 400,
            CcrelayError::ApiNotFound => 404,
            _ => 500,
        }
    }

    /// Plain `{"error": "..."}` JSON body, as used by the management API.
    pub fn to_json_body(&self) -> Vec<u8> {
        let msg = self.to_string();
        match self {
            CcrelayError::QueueFull | CcrelayError::QueueTimeout => format!(
                r#"{{"error":{},"code":"QUEUE_FULL_OR_TIMEOUT"}}"#,
                serde_json::to_string(&msg).unwrap_or_else(|_| "\"error\"".to_string())
            )
            .into_bytes(),
            _ => format!(
                r#"{{"error":{}}}"#,
                serde_json::to_string(&msg).unwrap_or_else(|_| "\"error\"".to_string())
            )
            .into_bytes(),
        }
    }

    /// Anthropic-shaped error body used by the converter and proxy executor
    /// on translation/upstream failures (§4.D, §4.L).
    pub fn to_anthropic_json_body(&self) -> Vec<u8> {
        let msg = self.to_string();
        serde_json::json!({
            "type": "error",
            "error": { "type": "api_error", "message": msg }
        })
        .to_string()
        .into_bytes()
    }
}
