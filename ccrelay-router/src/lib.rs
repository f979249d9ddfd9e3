//! Block/passthrough decisions and provider selection (§4.A usage, §4.C).
//!
//! The whole routing table is swapped atomically on reload or provider
//! switch via `ArcSwap`, mirroring the gateway's `Arc<ArcSwap<Router>>`
//! pattern for worker-visible config updates without locking the hot path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use ccrelay_core::config::{BlockRule, RoutingConfig};
use ccrelay_core::error::CcrelayError;
use ccrelay_core::pattern::any_glob_matches;
use ccrelay_core::provider::{Provider, ProviderMode};

#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub response: String,
    pub code: u16,
}

struct RouterState {
    current_provider_id: String,
    providers: HashMap<String, Arc<Provider>>,
    routing: RoutingConfig,
}

/// Holds the currently selected provider plus the block/passthrough/proxy
/// path lists, and notifies registered callbacks on provider switch.
pub struct Router {
    state: ArcSwap<RouterState>,
    on_change: Mutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Router {
    pub fn new(providers: HashMap<String, Provider>, routing: RoutingConfig, current_provider_id: String) -> Self {
        let providers = providers.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        Self {
            state: ArcSwap::new(Arc::new(RouterState { current_provider_id, providers, routing })),
            on_change: Mutex::new(Vec::new()),
        }
    }

    /// Replace the whole routing table (admin reload), keeping the current
    /// provider selection if it still exists, else falling back to
    /// `"official"`.
    pub fn reload(&self, providers: HashMap<String, Provider>, routing: RoutingConfig) {
        let providers: HashMap<String, Arc<Provider>> =
            providers.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        let current = {
            let old = self.state.load();
            if providers.contains_key(&old.current_provider_id) {
                old.current_provider_id.clone()
            } else {
                "official".to_string()
            }
        };
        self.state.store(Arc::new(RouterState { current_provider_id: current, providers, routing }));
    }

    fn normalize(path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }

    /// §4.C decision 1: scan `block[]`, then `openaiBlock[]` when the
    /// current provider speaks OpenAI, only while in `inject` mode.
    pub fn should_block(&self, path: &str) -> Option<BlockDecision> {
        let path = Self::normalize(path);
        let state = self.state.load();
        let provider = self.current_provider_locked(&state);

        if provider.mode != ProviderMode::Inject {
            return None;
        }

        if let Some(decision) = first_block_match(&state.routing.block, &path) {
            return Some(decision);
        }
        if provider.is_openai() {
            if let Some(decision) = first_block_match(&state.routing.openai_block, &path) {
                return Some(decision);
            }
        }
        None
    }

    /// §4.C decision 2.
    pub fn should_route(&self, path: &str) -> bool {
        let path = Self::normalize(path);
        let state = self.state.load();
        if any_glob_matches(&state.routing.passthrough, &path) {
            return false;
        }
        if any_glob_matches(&state.routing.proxy, &path) {
            return true;
        }
        true
    }

    fn current_provider_locked(&self, state: &RouterState) -> Arc<Provider> {
        state
            .providers
            .get(&state.current_provider_id)
            .cloned()
            .or_else(|| state.providers.get("official").cloned())
            .or_else(|| state.providers.values().next().cloned())
            .unwrap_or_else(|| Arc::new(Provider::official("https://api.anthropic.com")))
    }

    /// §4.C decision 3. Never returns a missing provider.
    pub fn get_target_provider(&self, path: &str) -> Arc<Provider> {
        let state = self.state.load();
        if self.should_route(path) {
            self.current_provider_locked(&state)
        } else {
            state
                .providers
                .get("official")
                .cloned()
                .unwrap_or_else(|| self.current_provider_locked(&state))
        }
    }

    pub fn current_provider(&self) -> Arc<Provider> {
        let state = self.state.load();
        self.current_provider_locked(&state)
    }

    pub fn current_provider_id(&self) -> String {
        self.state.load().current_provider_id.clone()
    }

    pub fn list_providers(&self) -> Vec<Arc<Provider>> {
        self.state.load().providers.values().cloned().collect()
    }

    /// Copy incoming headers, rewriting auth according to provider mode
    /// (§4.C `prepareHeaders`).
    pub fn prepare_headers(&self, headers: &[(String, String)], provider: &Provider) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                lower != "host" && lower != "content-length"
            })
            .filter(|(name, _)| {
                if provider.mode != ProviderMode::Inject {
                    return true;
                }
                let lower = name.to_ascii_lowercase();
                lower != "authorization" && lower != "x-api-key"
            })
            .cloned()
            .collect();

        if provider.mode == ProviderMode::Inject {
            if let Some(key) = &provider.api_key {
                let header_name = provider.auth_header.clone();
                let value = if header_name.eq_ignore_ascii_case("authorization") {
                    format!("Bearer {key}")
                } else {
                    key.clone()
                };
                out.push((header_name, value));
            }
        }

        for (name, value) in &provider.headers {
            out.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
            out.push((name.clone(), value.clone()));
        }

        out
    }

    pub fn get_target_url(&self, path: &str, provider: &Provider) -> String {
        let path = Self::normalize(path);
        format!("{}{}", provider.base_url.trim_end_matches('/'), path)
    }

    /// §4.C `switchProvider`: validates, persists via `persist`, updates
    /// state, and notifies callbacks only on an actual change.
    pub fn switch_provider(&self, id: &str) -> Result<(), CcrelayError> {
        let state = self.state.load();
        if !state.providers.contains_key(id) {
            return Err(CcrelayError::UnknownProvider(id.to_string()));
        }
        if state.current_provider_id == id {
            return Ok(());
        }
        let new_state = RouterState {
            current_provider_id: id.to_string(),
            providers: state.providers.clone(),
            routing: state.routing.clone(),
        };
        self.state.store(Arc::new(new_state));

        for callback in self.on_change.lock().unwrap().iter() {
            callback(id);
        }
        Ok(())
    }

    /// Add a new provider or overwrite an existing one by id (§6 `POST
    /// /providers`).
    pub fn upsert_provider(&self, provider: Provider) {
        let state = self.state.load();
        let mut providers = (*state.providers).clone();
        providers.insert(provider.id.clone(), Arc::new(provider));
        self.state.store(Arc::new(RouterState {
            current_provider_id: state.current_provider_id.clone(),
            providers,
            routing: state.routing.clone(),
        }));
    }

    /// Remove a provider by id (§6 `DELETE /providers/:id`). Falls back the
    /// current selection to `"official"` if the deleted provider was active.
    pub fn remove_provider(&self, id: &str) -> Result<(), CcrelayError> {
        if id == "official" {
            return Err(CcrelayError::CannotDeleteOfficial);
        }
        let state = self.state.load();
        if !state.providers.contains_key(id) {
            return Err(CcrelayError::UnknownProvider(id.to_string()));
        }
        let mut providers = (*state.providers).clone();
        providers.remove(id);
        let current_provider_id =
            if state.current_provider_id == id { "official".to_string() } else { state.current_provider_id.clone() };
        self.state.store(Arc::new(RouterState { current_provider_id, providers, routing: state.routing.clone() }));
        Ok(())
    }

    pub fn on_provider_change<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_change.lock().unwrap().push(Box::new(callback));
    }
}

fn first_block_match(rules: &[BlockRule], path: &str) -> Option<BlockDecision> {
    for rule in rules {
        if ccrelay_core::pattern::GlobMatcher::new(&rule.path).matches(path) {
            return Some(BlockDecision { response: rule.response.clone(), code: rule.code });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_core::provider::ProviderType;

    fn provider(id: &str, mode: ProviderMode, provider_type: ProviderType, key: Option<&str>) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            base_url: "https://upstream.example.com".to_string(),
            mode,
            provider_type,
            api_key: key.map(str::to_string),
            auth_header: "authorization".to_string(),
            model_map: vec![],
            vl_model_map: vec![],
            headers: Default::default(),
            enabled: true,
        }
    }

    fn router_with(mode: ProviderMode, provider_type: ProviderType, routing: RoutingConfig) -> Router {
        let mut providers = HashMap::new();
        providers.insert("official".to_string(), Provider::official("https://api.anthropic.com"));
        providers.insert("active".to_string(), provider("active", mode, provider_type, Some("sk-key")));
        Router::new(providers, routing, "active".to_string())
    }

    #[test]
    fn block_rule_matches_only_in_inject_mode() {
        let routing = RoutingConfig { block: vec![BlockRule { path: "/blocked".into(), response: "nope".into(), code: 403 }], ..Default::default() };
        let passthrough_router = router_with(ProviderMode::Passthrough, ProviderType::Anthropic, routing.clone());
        assert!(passthrough_router.should_block("/blocked").is_none());

        let inject_router = router_with(ProviderMode::Inject, ProviderType::Anthropic, routing);
        let decision = inject_router.should_block("/blocked").unwrap();
        assert_eq!(decision.code, 403);
        assert_eq!(decision.response, "nope");
    }

    #[test]
    fn openai_block_only_applies_for_openai_providers() {
        let routing = RoutingConfig {
            openai_block: vec![BlockRule { path: "/oa".into(), response: "no-openai".into(), code: 400 }],
            ..Default::default()
        };
        let anthropic_router = router_with(ProviderMode::Inject, ProviderType::Anthropic, routing.clone());
        assert!(anthropic_router.should_block("/oa").is_none());

        let openai_router = router_with(ProviderMode::Inject, ProviderType::Openai, routing);
        assert!(openai_router.should_block("/oa").is_some());
    }

    #[test]
    fn passthrough_overrides_proxy_and_default_is_routed() {
        let routing = RoutingConfig {
            proxy: vec!["/v1/**".into()],
            passthrough: vec!["/v1/skip".into()],
            ..Default::default()
        };
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, routing);
        assert!(!router.should_route("/v1/skip"));
        assert!(router.should_route("/v1/messages"));
        assert!(router.should_route("/unlisted"));
    }

    #[test]
    fn get_target_provider_falls_back_to_official_when_not_routed() {
        let routing = RoutingConfig { passthrough: vec!["/health".into()], ..Default::default() };
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, routing);
        let provider = router.get_target_provider("/health");
        assert_eq!(provider.id, "official");
        let routed = router.get_target_provider("/v1/messages");
        assert_eq!(routed.id, "active");
    }

    #[test]
    fn prepare_headers_strips_and_injects_auth_in_inject_mode() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        let provider = router.current_provider();
        let headers = vec![
            ("Host".to_string(), "x".to_string()),
            ("Authorization".to_string(), "Bearer old".to_string()),
            ("X-Custom".to_string(), "keep".to_string()),
        ];
        let out = router.prepare_headers(&headers, &provider);
        assert!(!out.iter().any(|(n, _)| n.eq_ignore_ascii_case("host")));
        assert!(out.iter().any(|(n, v)| n == "authorization" && v == "Bearer sk-key"));
        assert!(out.iter().any(|(n, v)| n == "X-Custom" && v == "keep"));
    }

    #[test]
    fn prepare_headers_passthrough_mode_keeps_client_auth() {
        let mut providers = HashMap::new();
        providers.insert("official".to_string(), Provider::official("https://api.anthropic.com"));
        let router = Router::new(providers, RoutingConfig::default(), "official".to_string());
        let provider = router.current_provider();
        let headers = vec![("Authorization".to_string(), "Bearer client-key".to_string())];
        let out = router.prepare_headers(&headers, &provider);
        assert!(out.iter().any(|(n, v)| n == "Authorization" && v == "Bearer client-key"));
    }

    #[test]
    fn switch_provider_rejects_unknown_id() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        assert!(router.switch_provider("does-not-exist").is_err());
    }

    #[test]
    fn switch_provider_fires_callback_only_on_actual_change() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        router.on_provider_change(move |_id| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        router.switch_provider("active").unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        router.switch_provider("official").unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn upsert_provider_adds_and_overwrites() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        router.upsert_provider(provider("extra", ProviderMode::Passthrough, ProviderType::Openai, None));
        assert!(router.list_providers().iter().any(|p| p.id == "extra"));
        router.upsert_provider(provider("extra", ProviderMode::Inject, ProviderType::Openai, Some("sk-new")));
        let updated = router.list_providers().into_iter().find(|p| p.id == "extra").unwrap();
        assert_eq!(updated.mode, ProviderMode::Inject);
    }

    #[test]
    fn remove_provider_rejects_official_and_unknown() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        assert!(router.remove_provider("official").is_err());
        assert!(router.remove_provider("does-not-exist").is_err());
    }

    #[test]
    fn remove_active_provider_falls_back_to_official() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        router.remove_provider("active").unwrap();
        assert_eq!(router.current_provider_id(), "official");
        assert!(!router.list_providers().iter().any(|p| p.id == "active"));
    }

    #[test]
    fn get_target_url_joins_base_and_path() {
        let router = router_with(ProviderMode::Inject, ProviderType::Anthropic, RoutingConfig::default());
        let provider = router.current_provider();
        assert_eq!(router.get_target_url("v1/messages", &provider), "https://upstream.example.com/v1/messages");
    }
}
