//! The server-side half of the fan-out channel: an axum WebSocket handler
//! backed by a broadcast channel that mirrors every `Router` provider
//! switch to all connected clients (§4.J).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use ccrelay_router::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use crate::message::WsMessage;

/// Owns the broadcast channel and the link into the local `Router`. One
/// `Hub` per process; the leader's hub is what followers' clients dial.
pub struct Hub {
    router: Arc<Router>,
    tx: broadcast::Sender<WsMessage>,
}

impl Hub {
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        let hub = Arc::new(Self { router: Arc::clone(&router), tx });

        let callback_hub = Arc::clone(&hub);
        router.on_provider_change(move |id| {
            if let Some(provider) = callback_hub.router.list_providers().into_iter().find(|p| p.id == id) {
                let _ = callback_hub.tx.send(WsMessage::ProviderChanged {
                    provider_id: provider.id.clone(),
                    provider_name: provider.name.clone(),
                });
            }
        });

        hub
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.tx.subscribe()
    }

    pub fn announce_stopping(&self) {
        let _ = self.tx.send(WsMessage::ServerStopping);
    }

    /// Applies the switch to the router; `provider_changed` follows from
    /// the callback registered in `new`, so this only needs to build the
    /// ack.
    fn apply_switch(&self, request_id: String, provider_id: String) -> WsMessage {
        match self.router.switch_provider(&provider_id) {
            Ok(()) => {
                let provider = self.router.current_provider();
                WsMessage::SwitchProviderAck {
                    request_id,
                    success: true,
                    provider_id: Some(provider.id.clone()),
                    provider_name: Some(provider.name.clone()),
                    error: None,
                }
            }
            Err(e) => WsMessage::SwitchProviderAck {
                request_id,
                success: false,
                provider_id: None,
                provider_name: None,
                error: Some(e.to_string()),
            },
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = hub.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    let stopping = matches!(msg, WsMessage::ServerStopping);
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    if stopping {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_hub = Arc::clone(&hub);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(parsed) = serde_json::from_str::<WsMessage>(&text) else { continue };
            if let WsMessage::SwitchProvider { request_id, provider_id } = parsed {
                let ack = recv_hub.apply_switch(request_id, provider_id);
                let _ = recv_hub.tx.send(ack);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
