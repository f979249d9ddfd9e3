//! Anthropic <-> OpenAI request/response translation (§4.D).
//!
//! Bodies are handled as `serde_json::Value` trees rather than exhaustively
//! typed structs: the wire shapes below are a moving target across
//! providers, and value-level transforms keep unrecognised fields from
//! being silently dropped.

pub mod request;
pub mod response;

pub use request::translate_request;
pub use response::translate_response;

/// A translation-phase failure, turned into a 502 Anthropic-shaped error
/// by the caller (§4.D "Failure").
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}
