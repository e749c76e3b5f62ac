//! WebSocket rendezvous client

use super::{Rendezvous, SignalingSession};
use crate::error::{NetworkError, Result};
use futures::{SinkExt, StreamExt};
use meshradio_protocol::SignalMessage;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Rendezvous server reached over a WebSocket (`ws://host:port/signaling`)
#[derive(Debug, Clone)]
pub struct WebSocketRendezvous {
    url: String,
}

impl WebSocketRendezvous {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketRendezvous { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Rendezvous for WebSocketRendezvous {
    async fn connect(&self) -> Result<SignalingSession> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NetworkError::RendezvousUnavailable(format!("{}: {}", self.url, e)))?;

        info!("Connected to rendezvous server {}", self.url);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<SignalMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", message.type_name(), e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    debug!("Rendezvous write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalMessage::decode(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed rendezvous frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Rendezvous read failed: {}", e);
                        break;
                    }
                }
            }
            info!("Rendezvous session with {} ended", url);
        });

        Ok(SignalingSession { outbound, inbound })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
