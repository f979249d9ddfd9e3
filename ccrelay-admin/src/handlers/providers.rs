use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ccrelay_core::error::CcrelayError;
use ccrelay_core::provider::Provider;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::SharedAdminState;

fn valid_provider_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn provider_view(provider: &Provider) -> Value {
    json!({
        "id": provider.id,
        "name": provider.name,
        "baseUrl": provider.base_url,
        "mode": match provider.mode {
            ccrelay_core::provider::ProviderMode::Passthrough => "passthrough",
            ccrelay_core::provider::ProviderMode::Inject => "inject",
        },
        "providerType": match provider.provider_type {
            ccrelay_core::provider::ProviderType::Anthropic => "anthropic",
            ccrelay_core::provider::ProviderType::Openai => "openai",
        },
        "apiKey": provider.masked_api_key(),
        "authHeader": provider.auth_header,
        "enabled": provider.enabled,
    })
}

pub async fn list_providers(State(state): State<SharedAdminState>) -> Json<Value> {
    let providers: Vec<Value> = state.router.list_providers().iter().map(|p| provider_view(p)).collect();
    Json(json!({ "providers": providers, "current": state.router.current_provider_id() }))
}

pub async fn upsert_provider(
    State(state): State<SharedAdminState>,
    Json(provider): Json<Provider>,
) -> Result<Json<Value>, ApiError> {
    if !valid_provider_id(&provider.id) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, CcrelayError::InvalidProviderId(provider.id).to_string()));
    }
    state.router.upsert_provider(provider.clone());
    Ok(Json(provider_view(&provider)))
}

pub async fn delete_provider(
    State(state): State<SharedAdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.router.remove_provider(&id).map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SwitchRequest {
    pub provider: String,
}

pub async fn switch_provider(
    State(state): State<SharedAdminState>,
    Json(req): Json<SwitchRequest>,
) -> Result<Json<Value>, ApiError> {
    match state.router.switch_provider(&req.provider) {
        Ok(()) => {
            crate::persist::save_current_provider(state.state_file.as_deref(), &req.provider);
            Ok(Json(json!({ "status": "ok", "currentProvider": req.provider })))
        }
        Err(CcrelayError::UnknownProvider(id)) => {
            let available: Vec<String> = state.router.list_providers().iter().map(|p| p.id.clone()).collect();
            Err(ApiError::new(
                StatusCode::NOT_FOUND,
                json!({ "error": format!("Unknown provider: {id}"), "available": available }).to_string(),
            ))
        }
        Err(e) => Err(ApiError::from(e)),
    }
}

pub async fn reload_config(State(state): State<SharedAdminState>) -> Result<Json<Value>, ApiError> {
    let config = ccrelay_core::config::RouterConfig::load(state.config_path.as_deref())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }).to_string()))?;
    state.router.reload(config.providers, config.routing);
    Ok(Json(json!({ "status": "ok", "currentProvider": state.router.current_provider_id() })))
}
