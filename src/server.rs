//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocChannel (doc_id) ── presence / activity / ops
//! Client B ──┘          │
//!                       ├── PresenceStore (in-memory, authoritative)
//!                       └── CollabStore (RocksDB)
//!                               ├── operations, activity
//!                               └── comments, versions, follow
//! ```
//!
//! One task per connection. A client's first message is `Hello`, which
//! registers presence and subscribes the connection to its document's
//! topics. Presence updates and operations fan out through the
//! document channel; operations and activity are persisted first.
//! Channel subscribers that lag simply drop frames; there is no replay
//! on resubscribe, late joiners catch up through the operation log.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::broadcast::ChannelMap;
use crate::error::CollabError;
use crate::operations::OperationLog;
use crate::presence::PresenceStore;
use crate::protocol::{CollabMessage, MessageKind};
use crate::storage::{CollabStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document topic
    pub channel_capacity: usize,
    /// Presence sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Persistent storage path
    pub storage_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9070".to_string(),
            channel_capacity: 256,
            sweep_interval_secs: 30,
            storage_path: PathBuf::from("tandem_data"),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    store: Arc<CollabStore>,
    presence: Arc<PresenceStore>,
    channels: Arc<ChannelMap>,
    activity: Arc<ActivityLog>,
    operations: Arc<OperationLog>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server, opening the store at the configured path.
    pub fn new(config: ServerConfig) -> Result<Self, CollabError> {
        let store_config = StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        };
        let store = Arc::new(CollabStore::open(store_config)?);
        let channels = Arc::new(ChannelMap::new(config.channel_capacity));
        let activity = Arc::new(ActivityLog::new(store.clone(), channels.clone()));
        let operations = Arc::new(OperationLog::new(
            store.clone(),
            channels.clone(),
            activity.clone(),
        ));

        Ok(Self {
            config,
            store,
            presence: Arc::new(PresenceStore::new()),
            channels,
            activity,
            operations,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Accept connections until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_presence_sweeper();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let presence = self.presence.clone();
            let channels = self.channels.clone();
            let activity = self.activity.clone();
            let operations = self.operations.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, presence, channels, activity, operations, stats,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodically drop stale presence and tell subscribers about it.
    fn spawn_presence_sweeper(&self) {
        let presence = self.presence.clone();
        let channels = self.channels.clone();
        let interval_secs = self.config.sweep_interval_secs.max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                for doc_id in presence.active_documents().await {
                    let removed = presence.sweep(doc_id).await;
                    if removed.is_empty() {
                        continue;
                    }
                    log::debug!("Swept {} stale sessions from doc {doc_id}", removed.len());
                    let channel = channels.get_or_create(doc_id).await;
                    for user_id in removed {
                        let msg = CollabMessage::goodbye(user_id, doc_id);
                        if let Ok(encoded) = msg.encode() {
                            channel.publish_presence(Arc::new(encoded));
                        }
                    }
                }
            }
        });
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        presence: Arc<PresenceStore>,
        channels: Arc<ChannelMap>,
        activity: Arc<ActivityLog>,
        operations: Arc<OperationLog>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set on Hello.
        let mut session: Option<(Uuid, Uuid)> = None;
        let mut presence_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut activity_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut operations_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let msg = match CollabMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match msg.kind {
                                MessageKind::Hello => {
                                    if session.is_some() {
                                        log::warn!("Duplicate Hello from {addr}, ignoring");
                                        continue;
                                    }
                                    let user_id = msg.user_id;
                                    let doc_id = msg.doc_id;
                                    let name = msg
                                        .hello_info()
                                        .map(|h| h.display_name)
                                        .unwrap_or_else(|_| "Anonymous".to_string());

                                    let record = presence.join(doc_id, user_id, &name).await;
                                    let channel = channels.get_or_create(doc_id).await;
                                    presence_rx = Some(channel.subscribe_presence());
                                    activity_rx = Some(channel.subscribe_activity());
                                    operations_rx = Some(channel.subscribe_operations());
                                    session = Some((user_id, doc_id));

                                    // Current roster straight to the new client.
                                    for r in presence.list(doc_id).await {
                                        let state = CollabMessage::presence_state(doc_id, &r);
                                        if let Ok(encoded) = state.encode() {
                                            ws_sender.send(Message::Binary(encoded.into())).await?;
                                        }
                                    }

                                    // Everyone else learns about the join.
                                    let state = CollabMessage::presence_state(doc_id, &record);
                                    if let Ok(encoded) = state.encode() {
                                        channel.publish_presence(Arc::new(encoded));
                                    }

                                    activity
                                        .record(ActivityEntry::new(
                                            doc_id,
                                            user_id,
                                            ActivityKind::Joined,
                                            "joined the document",
                                        ))
                                        .await;
                                    log::info!("{name} ({user_id}) joined doc {doc_id}");
                                }

                                MessageKind::PresencePatch => {
                                    let Some((user_id, doc_id)) = session else { continue };
                                    let Ok(patch) = msg.presence_patch_payload() else {
                                        log::warn!("Bad presence patch from {user_id}");
                                        continue;
                                    };
                                    // Unknown sessions are dropped, not resurrected.
                                    if let Some(record) =
                                        presence.update(doc_id, user_id, &patch).await
                                    {
                                        let state = CollabMessage::presence_state(doc_id, &record);
                                        if let Ok(encoded) = state.encode() {
                                            let channel = channels.get_or_create(doc_id).await;
                                            channel.publish_presence(Arc::new(encoded));
                                        }
                                    }
                                }

                                MessageKind::Operation => {
                                    let Some((user_id, doc_id)) = session else { continue };
                                    let Ok(op) = msg.operation_payload() else {
                                        log::warn!("Bad operation payload from {user_id}");
                                        continue;
                                    };
                                    // Persist with a server-assigned version
                                    // number, then fan out.
                                    if let Err(e) = operations
                                        .submit(doc_id, user_id, op.kind, op.data, op.parent_version)
                                        .await
                                    {
                                        log::error!("Operation rejected for doc {doc_id}: {e}");
                                    }
                                }

                                MessageKind::Ping => {
                                    let pong = CollabMessage::pong(msg.user_id);
                                    let encoded = pong.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                MessageKind::Goodbye => break,

                                other => {
                                    log::debug!("Unhandled message kind {other:?} from {addr}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = recv_or_pending(&mut presence_rx) => {
                    if !forward_frame(&mut ws_sender, frame, &session).await? {
                        break;
                    }
                }
                frame = recv_or_pending(&mut activity_rx) => {
                    if !forward_frame(&mut ws_sender, frame, &session).await? {
                        break;
                    }
                }
                frame = recv_or_pending(&mut operations_rx) => {
                    if !forward_frame(&mut ws_sender, frame, &session).await? {
                        break;
                    }
                }
            }
        }

        // Cleanup: drop presence and announce the departure.
        if let Some((user_id, doc_id)) = session {
            presence.leave(doc_id, user_id).await;
            let channel = channels.get_or_create(doc_id).await;
            let goodbye = CollabMessage::goodbye(user_id, doc_id);
            if let Ok(encoded) = goodbye.encode() {
                channel.publish_presence(Arc::new(encoded));
            }
            activity
                .record(ActivityEntry::new(
                    doc_id,
                    user_id,
                    ActivityKind::Left,
                    "left the document",
                ))
                .await;
            channels.remove_if_idle(&doc_id).await;
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.presence.active_documents().await.len();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &Arc<CollabStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub fn operations(&self) -> &Arc<OperationLog> {
        &self.operations
    }
}

/// Receive from an optional topic subscription; a connection that has
/// not said Hello yet waits forever on this arm.
async fn recv_or_pending(
    rx: &mut Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>>,
) -> Result<Arc<Vec<u8>>, tokio::sync::broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forward a topic frame to the socket, skipping the session's own
/// messages. Returns false when the topic is gone.
async fn forward_frame<S>(
    ws_sender: &mut S,
    frame: Result<Arc<Vec<u8>>, tokio::sync::broadcast::error::RecvError>,
    session: &Option<(Uuid, Uuid)>,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match frame {
        Ok(data) => {
            if let Ok(msg) = CollabMessage::decode(&data) {
                if let Some((user_id, _)) = session {
                    if msg.user_id == *user_id {
                        return Ok(true);
                    }
                }
            }
            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
            Ok(true)
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
            log::warn!("Subscriber lagged by {n} frames");
            Ok(true)
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => Ok(false),
    }
}
