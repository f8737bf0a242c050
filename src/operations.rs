//! Operation broadcast log: sequenced edit notifications.
//!
//! Operations are observed, not merged ("notify, don't reconcile").
//! `submit` assigns a strictly increasing per-document version number
//! at the store, persists the row, and fans it out on the document's
//! operation topic. A submit against a stale `parent_version` still
//! succeeds — ordering is advisory, real conflict resolution belongs
//! to the editing surface, not this log.
//!
//! Subscribers receive operations from *other* users only: echoing a
//! client's own operation back would double-apply it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::broadcast::ChannelMap;
use crate::error::CollabError;
use crate::protocol::CollabMessage;
use crate::storage::{epoch_millis, CollabStore};

/// A versioned, sequenced edit notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub user_id: Uuid,
    /// Free-form operation type ("field_update", "layout_change", ...).
    pub kind: String,
    /// Opaque operation payload.
    pub data: serde_json::Value,
    /// Strictly increasing per document, assigned at insertion time.
    pub version_number: u64,
    /// The version the author observed when producing this operation.
    /// Advisory only — stale parents are accepted.
    pub parent_version: Option<u64>,
    pub created_at: i64,
}

impl Operation {
    /// Draft an operation before submission. The store assigns
    /// `version_number` on insert.
    pub fn draft(
        doc_id: Uuid,
        user_id: Uuid,
        kind: impl Into<String>,
        data: serde_json::Value,
        parent_version: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_id,
            user_id,
            kind: kind.into(),
            data,
            version_number: 0,
            parent_version,
            created_at: epoch_millis(),
        }
    }
}

/// A subscriber's view of the operation topic for one document.
///
/// Filters out the observer's own operations and lag notices.
pub struct OperationFeed {
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    observer: Uuid,
}

impl OperationFeed {
    /// Next operation authored by someone else. `None` when the topic
    /// is closed.
    pub async fn next(&mut self) -> Option<Operation> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => {
                    let Ok(msg) = CollabMessage::decode(&bytes) else {
                        continue;
                    };
                    let Ok(op) = msg.operation_payload() else {
                        continue;
                    };
                    if op.user_id == self.observer {
                        continue;
                    }
                    return Some(op);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Dropped messages are advisory edits; log and move on.
                    log::warn!("Operation feed lagged by {n} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The durable, fan-out operation log.
pub struct OperationLog {
    store: Arc<CollabStore>,
    channels: Arc<ChannelMap>,
    activity: Arc<ActivityLog>,
}

impl OperationLog {
    pub fn new(
        store: Arc<CollabStore>,
        channels: Arc<ChannelMap>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            store,
            channels,
            activity,
        }
    }

    /// Persist an operation with the next version number for its
    /// document, then publish it. An edit entry lands in the activity
    /// log as well, so the document's history shows who changed what.
    pub async fn submit(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        kind: impl Into<String>,
        data: serde_json::Value,
        parent_version: Option<u64>,
    ) -> Result<Operation, CollabError> {
        let draft = Operation::draft(doc_id, user_id, kind, data, parent_version);
        let op = self.store.append_operation(draft)?;

        let msg = CollabMessage::operation(user_id, doc_id, &op)?;
        if let Ok(encoded) = msg.encode() {
            let channel = self.channels.get_or_create(doc_id).await;
            channel.publish_operation(Arc::new(encoded));
        }

        self.activity
            .record(ActivityEntry::new(
                doc_id,
                user_id,
                ActivityKind::FieldEdited,
                format!("applied {} operation", op.kind),
            ))
            .await;
        Ok(op)
    }

    /// Subscribe to operations from other users on a document.
    pub async fn subscribe(&self, doc_id: Uuid, observer: Uuid) -> OperationFeed {
        let channel = self.channels.get_or_create(doc_id).await;
        OperationFeed {
            rx: channel.subscribe_operations(),
            observer,
        }
    }

    /// Replay persisted operations with `version_number > since` in
    /// ascending order (late-joiner catch-up).
    pub fn replay_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<Operation>, CollabError> {
        Ok(self.store.list_operations_since(doc_id, since + 1)?)
    }

    /// Highest version number assigned for a document (0 if none).
    pub fn latest_version(&self, doc_id: Uuid) -> Result<u64, CollabError> {
        Ok(self.store.latest_operation_number(doc_id)?)
    }
}
