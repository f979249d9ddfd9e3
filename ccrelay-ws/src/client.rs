//! The client side of the fan-out channel: used by followers to watch the
//! leader's broadcasts, and as the `switch_provider` RPC's transport for
//! anything that wants to request a switch over the wire instead of the
//! leader's REST API (§4.J).
//!
//! Reconnects with the same exponential backoff shape the election probe
//! uses, up to its cap, so a follower never hammers a leader that is
//! itself mid-restart.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsProtoMessage;

use crate::message::WsMessage;

pub struct WsClient {
    url: String,
}

impl WsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connects and invokes `on_message` for every decoded frame, restarting
    /// the connection with backoff whenever it drops, until `shutdown`
    /// resolves.
    pub async fn run(&self, mut on_message: impl FnMut(WsMessage) + Send, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.try_recv().is_ok() {
                return;
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((stream, _response)) => {
                    attempt = 0;
                    let (_write, mut read) = stream.split();
                    loop {
                        tokio::select! {
                            _ = &mut shutdown => return,
                            frame = read.next() => {
                                match frame {
                                    Some(Ok(WsProtoMessage::Text(text))) => {
                                        if let Ok(parsed) = serde_json::from_str::<WsMessage>(&text) {
                                            let stopping = matches!(parsed, WsMessage::ServerStopping);
                                            on_message(parsed);
                                            if stopping {
                                                return;
                                            }
                                        }
                                    }
                                    Some(Ok(_)) => continue,
                                    _ => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %self.url, "websocket connect failed");
                }
            }

            let delay = ccrelay_ipc::backoff_sequence(attempt.min(8));
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends `switch_provider` and waits for the matching ack on a fresh
    /// connection (§4.J's client→leader RPC).
    pub async fn switch_provider(&self, provider_id: &str) -> Result<WsMessage, String> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.url).await.map_err(|e| e.to_string())?;
        let (mut write, mut read) = stream.split();

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = WsMessage::SwitchProvider { request_id: request_id.clone(), provider_id: provider_id.to_string() };
        let text = serde_json::to_string(&request).map_err(|e| e.to_string())?;
        write.send(WsProtoMessage::Text(text.into())).await.map_err(|e| e.to_string())?;

        while let Some(frame) = read.next().await {
            let Ok(WsProtoMessage::Text(text)) = frame else { break };
            let Ok(parsed) = serde_json::from_str::<WsMessage>(&text) else { continue };
            if let WsMessage::SwitchProviderAck { request_id: ref rid, .. } = parsed {
                if *rid == request_id {
                    return Ok(parsed);
                }
            }
        }
        Err("connection closed before an ack arrived".to_string())
    }
}
