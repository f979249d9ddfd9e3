use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedAdminState;

pub async fn status(State(state): State<SharedAdminState>) -> Json<Value> {
    let provider = state.router.current_provider();
    Json(json!({
        "status": "ok",
        "currentProvider": provider.id,
        "providerName": provider.name,
        "providerMode": match provider.mode {
            ccrelay_core::provider::ProviderMode::Passthrough => "passthrough",
            ccrelay_core::provider::ProviderMode::Inject => "inject",
        },
        "port": state.port,
    }))
}
