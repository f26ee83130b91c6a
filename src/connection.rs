use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::hub::{Client, HubHandle};
use crate::messages::ClientMessage;
use crate::router::EventRouter;

/// Authenticated owner of a connection, resolved before the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Drives one websocket until either direction ends, then evicts it.
pub async fn serve(
    ws: WebSocket,
    identity: Identity,
    hub: HubHandle,
    router: Arc<EventRouter>,
    outbound_capacity: usize,
) {
    let (client, outbound) = Client::new(
        identity.user_id.clone(),
        identity.username.clone(),
        outbound_capacity,
    );
    let connection_id = client.id;
    let (ws_tx, mut ws_rx) = ws.split();

    hub.admit(client).await;

    let mut writer = tokio::spawn(write_pump(ws_tx, outbound, identity.user_id.clone()));

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        debug!("Client {} sent close", identity.user_id);
                        break;
                    }
                    if let Ok(text) = msg.to_str() {
                        handle_frame(&router, &identity, text).await;
                    } else if msg.is_binary() {
                        warn!("Dropping binary frame from {}", identity.user_id);
                    }
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {}", identity.user_id, e);
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!("Outbound flow for {} ended", identity.user_id);
                break;
            }
        }
    }

    hub.evict(&identity.user_id, connection_id).await;
    info!("Connection {} for {} closed", connection_id, identity.user_id);
}

async fn handle_frame(router: &EventRouter, identity: &Identity, text: &str) {
    let event = match ClientMessage::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping frame from {}: {}", identity.user_id, e);
            return;
        }
    };

    if let Err(e) = router.route(identity, event).await {
        warn!("Dropping event from {}: {}", identity.user_id, e);
    }
}

async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    user_id: String,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = ws_tx.send(Message::text(frame)).await {
            warn!("Failed to send WebSocket message to {}: {}", user_id, e);
            return;
        }
    }

    // Buffer closed by the hub: this connection was evicted or replaced.
    let _ = ws_tx.send(Message::close()).await;
    let _ = ws_tx.close().await;
}
