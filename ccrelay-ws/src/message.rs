//! The fan-out message schema (§4.J).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "provider_changed")]
    ProviderChanged {
        #[serde(rename = "providerId")]
        provider_id: String,
        #[serde(rename = "providerName")]
        provider_name: String,
    },
    #[serde(rename = "switch_provider")]
    SwitchProvider {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "providerId")]
        provider_id: String,
    },
    #[serde(rename = "switch_provider_ack")]
    SwitchProviderAck {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(rename = "providerId", skip_serializing_if = "Option::is_none", default)]
        provider_id: Option<String>,
        #[serde(rename = "providerName", skip_serializing_if = "Option::is_none", default)]
        provider_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename = "server_stopping")]
    ServerStopping,
}
