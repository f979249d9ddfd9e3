use serde::{Deserialize, Serialize};

/// Provider transport mode — passthrough forwards client credentials,
/// inject substitutes the provider's own configured key (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Passthrough,
    Inject,
}

/// The wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

/// One entry of an ordered model-mapping table (§4.E). `pattern` may contain
/// `*`/`?` glob wildcards; entries are tried in order, exact match first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapEntry {
    pub pattern: String,
    pub model: String,
}

/// A named upstream API endpoint with auth rules and optional per-request
/// rewrites (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub mode: ProviderMode,
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default)]
    pub model_map: Vec<ModelMapEntry>,
    #[serde(default)]
    pub vl_model_map: Vec<ModelMapEntry>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_true() -> bool {
    true
}

impl Provider {
    /// The built-in fallback provider guaranteed to exist (§4.C): points at
    /// the upstream's own canonical endpoint in passthrough mode so that
    /// `getTargetProvider` never returns nothing.
    pub fn official(base_url: impl Into<String>) -> Self {
        Self {
            id: "official".to_string(),
            name: "Official".to_string(),
            base_url: base_url.into(),
            mode: ProviderMode::Passthrough,
            provider_type: ProviderType::Anthropic,
            api_key: None,
            auth_header: default_auth_header(),
            model_map: Vec::new(),
            vl_model_map: Vec::new(),
            headers: std::collections::HashMap::new(),
            enabled: true,
        }
    }

    pub fn is_openai(&self) -> bool {
        self.provider_type == ProviderType::Openai
    }

    /// Mask an API key for display: first 4 + last 4 chars, or all
    /// asterisks if the key is 8 characters or shorter (§6 `/providers`).
    pub fn masked_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| mask_key(k))
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return "*".repeat(12);
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[len - 4..].iter().collect();
    format!("{head}...{tail}")
}
