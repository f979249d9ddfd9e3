//! `RouterConfig` (§3) and its layered loader (ambient stack, §1): a base
//! YAML file overlaid by `CCRELAY_`-prefixed, `__`-split environment
//! variables, modelled on the gateway's figment-based `AndoConfig::load`.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::provider::Provider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRule {
    pub path: String,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_block_code")]
    pub code: u16,
}

fn default_block_code() -> u16 {
    200
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub proxy: Vec<String>,
    #[serde(default)]
    pub passthrough: Vec<String>,
    #[serde(default)]
    pub block: Vec<BlockRule>,
    #[serde(default, rename = "openaiBlock")]
    pub openai_block: Vec<BlockRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub max_queue_size: usize,
    /// Seconds; 0 = unbounded queue-wait.
    #[serde(default)]
    pub request_timeout: f64,
}

fn default_max_workers() -> usize {
    10
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
            max_queue_size: 0,
            request_timeout: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteQueueConfig {
    pub pattern: String,
    pub max_workers: usize,
    #[serde(default)]
    pub max_queue_size: usize,
    #[serde(default)]
    pub request_timeout: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A filesystem path (embedded store) or `sqlite://...` URI (§4.G).
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enabled: true, database: None }
    }
}

/// Top-level configuration (§3). Providers and routing are read-only during
/// request handling; mutation only through the management API / reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub providers: HashMap<String, Provider>,
    #[serde(default = "default_provider_id")]
    pub default_provider: String,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    #[serde(default)]
    pub route_queues: Vec<RouteQueueConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_port() -> u16 {
    3742
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_provider_id() -> String {
    "official".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        let official = Provider::official("https://api.anthropic.com");
        providers.insert(official.id.clone(), official);
        Self {
            port: default_port(),
            host: default_host(),
            providers,
            default_provider: default_provider_id(),
            routing: RoutingConfig::default(),
            concurrency: Some(ConcurrencyConfig::default()),
            route_queues: vec![],
            logging: LoggingConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from a YAML file (explicit path, or the first of
    /// a few conventional locations) overlaid by `CCRELAY_`-prefixed
    /// environment variables, then expand `${VAR}` tokens in every string
    /// value against the process environment (§6).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["ccrelay.yaml", "config/ccrelay.yaml", "/etc/ccrelay/ccrelay.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("CCRELAY_").split("__"));

        let mut config: Self = figment.extract()?;
        expand_env_in_place(&mut config);
        Ok(config)
    }

    pub fn get_provider(&self, id: &str) -> Option<&Provider> {
        self.providers.get(id)
    }
}

/// Expand `${VAR}` tokens in every provider `apiKey`/`baseUrl`/header value
/// from the process environment, leaving unknown variables untouched.
fn expand_env_in_place(config: &mut RouterConfig) {
    for provider in config.providers.values_mut() {
        provider.base_url = expand_env_string(&provider.base_url);
        if let Some(key) = &provider.api_key {
            provider.api_key = Some(expand_env_string(key));
        }
        for value in provider.headers.values_mut() {
            *value = expand_env_string(value);
        }
    }
}

/// Expand `${VAR}` tokens in `input` from the process environment. A token
/// whose variable is unset is left verbatim.
pub fn expand_env_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' && input[i + 1..].starts_with('{') {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                let token_end = i + 2 + end + 1;
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&input[i..token_end]),
                }
                while chars.peek().is_some_and(|&(j, _)| j < token_end) {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}
