//! WebSocket event stream.
//!
//! Connected clients (the controlling server, dashboards) receive every
//! change event the file service publishes:
//! - `file:changed` after a successful mutation
//! - `backup:diff` whenever a backup closes with changes

use crate::backup::ChangeSummary;
use crate::service::{ChangeNotifier, FileChangeEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Events sent from agent to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsEvent {
    #[serde(rename = "file:changed")]
    FileChanged(FileChangeEvent),

    #[serde(rename = "backup:diff")]
    BackupDiff(ChangeSummary),
}

/// Shared WebSocket state
#[derive(Clone)]
pub struct WsState {
    /// Broadcast channel for sending events to all connected clients
    pub tx: broadcast::Sender<WsEvent>,
}

impl WsState {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Broadcast an event to all connected WebSocket clients
    pub fn broadcast(&self, event: WsEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast event to {} client(s)", count),
            // No subscribers is the normal idle state
            Err(_) => debug!("No WebSocket clients connected, event dropped"),
        }
    }

    /// Subscribe to events (for new WebSocket connections)
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }
}

impl Default for WsState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for WsState {
    fn file_changed(&self, event: &FileChangeEvent) {
        self.broadcast(WsEvent::FileChanged(event.clone()));
    }

    fn backup_diff(&self, summary: &ChangeSummary) {
        self.broadcast(WsEvent::BackupDiff(summary.clone()));
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state.ws_state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize event: {:?}", e),
            }
        }
    });

    // The stream is one-way; inbound frames only keep the connection alive
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
