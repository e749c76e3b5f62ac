//! WebSocket rendezvous server
//!
//! Accepts WebSocket sessions and plugs each of them into a shared
//! [`RendezvousHub`], which owns the room logic.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use meshradio_network::RendezvousHub;
use meshradio_protocol::SignalMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Accept sessions from `listener` until the task is dropped
pub async fn serve(listener: TcpListener, hub: Arc<RendezvousHub>) -> Result<()> {
    info!("Rendezvous server listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, hub).await {
                debug!("Rendezvous session with {} failed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<RendezvousHub>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    debug!("Rendezvous session opened from {}", addr);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (to_hub, hub_inbound) = mpsc::unbounded_channel::<SignalMessage>();
    let (hub_outbound, mut from_hub) = mpsc::unbounded_channel::<SignalMessage>();

    let session = tokio::spawn(async move { hub.serve(hub_inbound, hub_outbound).await });

    let writer = tokio::spawn(async move {
        while let Some(message) = from_hub.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {}: {}", message.type_name(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalMessage::decode(&text) {
                Ok(message) => {
                    if to_hub.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed frame from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", addr, e);
                break;
            }
        }
    }

    drop(to_hub);
    let _ = session.await;
    writer.abort();
    debug!("Rendezvous session from {} closed", addr);
    Ok(())
}
