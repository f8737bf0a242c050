//! WebSocket collaboration client.
//!
//! A thin connection handle: it says `Hello`, keeps presence alive
//! with a heartbeat, and surfaces everything the server fans out as
//! [`CollabEvent`]s on a channel the caller drains. A local roster
//! mirrors the presence state frames so callers can list peers
//! without waiting for events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::activity::ActivityEntry;
use crate::error::CollabError;
use crate::operations::Operation;
use crate::presence::{CursorPos, PresencePatch, PresenceRecord, PresenceStatus, SelectionRange};
use crate::protocol::{CollabMessage, MessageKind, ProtocolError};

/// Connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connected and joined the document
    Connected,
    /// Connection lost
    Disconnected,
    /// A peer's presence changed (join, cursor move, status change)
    PresenceChanged(PresenceRecord),
    /// A peer left the document
    PeerLeft(Uuid),
    /// An operation from another user
    RemoteOperation(Operation),
    /// An activity entry was broadcast
    Activity(ActivityEntry),
}

/// Seconds between presence heartbeats. Well inside the server's
/// liveness window so one dropped frame does not mark us stale.
const HEARTBEAT_SECS: u64 = 20;

/// Seconds of silence after which a Typing status falls back to
/// Editing, mirroring the server-side expiry.
const TYPING_EXPIRY_SECS: u64 = 3;

/// Client for a collaboration server.
pub struct CollabClient {
    user_id: Uuid,
    doc_id: Uuid,
    display_name: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Peers we currently believe are present, keyed by user id.
    roster: Arc<RwLock<HashMap<Uuid, PresenceRecord>>>,
    /// Counts outgoing presence patches so the server can discard
    /// reordered ones.
    patch_seq: Arc<Mutex<u64>>,
    /// Bumped on every status change; a pending typing-expiry task
    /// only fires if its generation is still current.
    typing_gen: Arc<Mutex<u64>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(doc_id: Uuid, display_name: impl Into<String>, server_url: &str) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: Uuid::new_v4(),
            doc_id,
            display_name: display_name.into(),
            server_url: server_url.to_string(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            roster: Arc::new(RwLock::new(HashMap::new())),
            patch_seq: Arc::new(Mutex::new(0)),
            typing_gen: Arc::new(Mutex::new(0)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            heartbeat: None,
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    pub async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = connect_async(&self.server_url).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        // Writer task drains the outgoing queue into the socket.
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = ws_sender.clone();
        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                let mut sender = writer.lock().await;
                if sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(outgoing_tx.clone());

        // Join the document.
        let hello = CollabMessage::hello(self.user_id, self.doc_id, &self.display_name);
        let encoded = hello.encode()?;
        outgoing_tx.send(encoded).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Reader task turns server frames into events.
        let user_id = self.user_id;
        let state = self.state.clone();
        let roster = self.roster.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Ok(msg) = CollabMessage::decode(&bytes) {
                            Self::handle_message(msg, user_id, &roster, &event_tx).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            roster.write().await.clear();
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        self.spawn_heartbeat();
        Ok(())
    }

    async fn handle_message(
        msg: CollabMessage,
        user_id: Uuid,
        roster: &Arc<RwLock<HashMap<Uuid, PresenceRecord>>>,
        event_tx: &mpsc::Sender<CollabEvent>,
    ) {
        // The server filters our own frames; the check here covers
        // roster frames sent before subscription, which carry us too.
        match msg.kind {
            MessageKind::PresenceState => {
                if let Ok(record) = msg.presence_record() {
                    if record.user_id == user_id {
                        return;
                    }
                    roster.write().await.insert(record.user_id, record.clone());
                    let _ = event_tx.send(CollabEvent::PresenceChanged(record)).await;
                }
            }
            MessageKind::Goodbye => {
                if msg.user_id == user_id {
                    return;
                }
                roster.write().await.remove(&msg.user_id);
                let _ = event_tx.send(CollabEvent::PeerLeft(msg.user_id)).await;
            }
            MessageKind::Operation => {
                if msg.user_id == user_id {
                    return;
                }
                if let Ok(op) = msg.operation_payload() {
                    let _ = event_tx.send(CollabEvent::RemoteOperation(op)).await;
                }
            }
            MessageKind::Activity => {
                if let Ok(entry) = msg.activity_entry() {
                    let _ = event_tx.send(CollabEvent::Activity(entry)).await;
                }
            }
            MessageKind::Pong => {
                log::trace!("Pong received");
            }
            other => {
                log::debug!("Unexpected message kind from server: {other:?}");
            }
        }
    }

    /// Periodic empty patch that keeps this session inside the
    /// server's liveness window.
    fn spawn_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        let user_id = self.user_id;
        let doc_id = self.doc_id;
        let state = self.state.clone();
        let patch_seq = self.patch_seq.clone();
        let outgoing = match &self.outgoing_tx {
            Some(tx) => tx.clone(),
            None => return,
        };

        self.heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let seq = {
                    let mut seq = patch_seq.lock().await;
                    *seq += 1;
                    *seq
                };
                let msg =
                    CollabMessage::presence_patch(user_id, doc_id, seq, &PresencePatch::heartbeat());
                let Ok(encoded) = msg.encode() else { continue };
                if outgoing.send(encoded).await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn send_patch(&self, patch: PresencePatch) -> Result<(), CollabError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let Some(tx) = &self.outgoing_tx else {
            return Ok(());
        };
        let seq = {
            let mut seq = self.patch_seq.lock().await;
            *seq += 1;
            *seq
        };
        let msg = CollabMessage::presence_patch(self.user_id, self.doc_id, seq, &patch);
        let encoded = msg.encode().map_err(CollabError::Protocol)?;
        tx.send(encoded)
            .await
            .map_err(|_| CollabError::Protocol(ProtocolError::ConnectionClosed))?;
        Ok(())
    }

    /// Announce a status change (viewing, editing, typing, idle).
    ///
    /// A Typing status schedules its own fallback to Editing, so a
    /// caller that stops typing without another update is not shown
    /// typing forever.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), CollabError> {
        let generation = {
            let mut generation = self.typing_gen.lock().await;
            *generation += 1;
            *generation
        };
        self.send_patch(PresencePatch::status(status)).await?;

        if status == PresenceStatus::Typing {
            let typing_gen = self.typing_gen.clone();
            let patch_seq = self.patch_seq.clone();
            let state = self.state.clone();
            let outgoing = self.outgoing_tx.clone();
            let user_id = self.user_id;
            let doc_id = self.doc_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(TYPING_EXPIRY_SECS)).await;
                if *typing_gen.lock().await != generation {
                    return;
                }
                if *state.read().await != ConnectionState::Connected {
                    return;
                }
                let Some(tx) = outgoing else { return };
                let seq = {
                    let mut seq = patch_seq.lock().await;
                    *seq += 1;
                    *seq
                };
                let patch = PresencePatch::status(PresenceStatus::Editing);
                let msg = CollabMessage::presence_patch(user_id, doc_id, seq, &patch);
                if let Ok(encoded) = msg.encode() {
                    let _ = tx.send(encoded).await;
                }
            });
        }
        Ok(())
    }

    /// Move the shared cursor.
    pub async fn move_cursor(&self, pos: CursorPos) -> Result<(), CollabError> {
        self.send_patch(PresencePatch::cursor(pos)).await
    }

    /// Announce a text selection inside the active field.
    pub async fn select(
        &self,
        field_id: Uuid,
        range: SelectionRange,
    ) -> Result<(), CollabError> {
        self.send_patch(PresencePatch {
            selection: Some(range),
            active_field_id: Some(field_id),
            ..PresencePatch::default()
        })
        .await
    }

    /// Submit an operation. The server assigns the version number and
    /// echoes it back to other subscribers.
    pub async fn submit_operation(
        &self,
        kind: impl Into<String>,
        data: serde_json::Value,
        parent_version: Option<u64>,
    ) -> Result<(), CollabError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(CollabError::Protocol(ProtocolError::ConnectionClosed));
        }
        let Some(tx) = &self.outgoing_tx else {
            return Err(CollabError::Protocol(ProtocolError::ConnectionClosed));
        };
        let op = Operation::draft(self.doc_id, self.user_id, kind, data, parent_version);
        let msg = CollabMessage::operation(self.user_id, self.doc_id, &op)
            .map_err(CollabError::Protocol)?;
        let encoded = msg.encode().map_err(CollabError::Protocol)?;
        tx.send(encoded)
            .await
            .map_err(|_| CollabError::Protocol(ProtocolError::ConnectionClosed))?;
        Ok(())
    }

    /// Send a ping.
    pub async fn ping(&self) -> Result<(), CollabError> {
        let Some(tx) = &self.outgoing_tx else {
            return Ok(());
        };
        let encoded = CollabMessage::ping(self.user_id)
            .encode()
            .map_err(CollabError::Protocol)?;
        tx.send(encoded)
            .await
            .map_err(|_| CollabError::Protocol(ProtocolError::ConnectionClosed))?;
        Ok(())
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(tx) = &self.outgoing_tx {
            let goodbye = CollabMessage::goodbye(self.user_id, self.doc_id);
            if let Ok(encoded) = goodbye.encode() {
                let _ = tx.send(encoded).await;
            }
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        self.roster.write().await.clear();
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Peers currently present, as last seen on the wire.
    pub async fn peers(&self) -> Vec<PresenceRecord> {
        let roster = self.roster.read().await;
        let mut peers: Vec<_> = roster.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.color_index
                .cmp(&b.color_index)
                .then(a.user_id.cmp(&b.user_id))
        });
        peers
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = CollabClient::new(doc_id, "Ada", "ws://localhost:9070");

        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.display_name(), "Ada");
        assert_eq!(client.server_url(), "ws://localhost:9070");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CollabClient::new(Uuid::new_v4(), "Ada", "ws://localhost:9070");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_send_offline_noop() {
        let client = CollabClient::new(Uuid::new_v4(), "Ada", "ws://localhost:9070");

        // Presence is ephemeral; sending while offline drops silently.
        client.set_status(PresenceStatus::Editing).await.unwrap();
        client.move_cursor(CursorPos { x: 1.0, y: 2.0 }).await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_send_offline_errors() {
        let client = CollabClient::new(Uuid::new_v4(), "Ada", "ws://localhost:9070");

        let result = client
            .submit_operation("field_update", serde_json::json!({"x": 1}), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = CollabClient::new(Uuid::new_v4(), "Ada", "ws://localhost:9070");

        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}
