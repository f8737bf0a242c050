//! Append-only activity log for audit and timeline views.
//!
//! Every durable user action elsewhere (comment added/resolved, follow
//! started/ended, field edited, version created) also lands here. The
//! log is a sink, not a source of truth: entries are never mutated or
//! deleted, readers get them newest-first, and a failed append must
//! never fail the action that produced it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::ChannelMap;
use crate::protocol::CollabMessage;
use crate::storage::{epoch_millis, CollabStore, StoreError};

/// Discrete user action kinds recorded in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Joined,
    Left,
    FieldEdited,
    CommentAdded,
    CommentUpdated,
    CommentDeleted,
    CommentResolved,
    CommentReopened,
    VersionCreated,
    VersionRestored,
    BranchCreated,
    FollowStarted,
    FollowEnded,
}

/// Immutable timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub user_id: Uuid,
    pub action: ActivityKind,
    /// Human-readable summary ("resolved a comment", field name, ...).
    pub details: String,
    pub field_id: Option<Uuid>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Epoch milliseconds at append time.
    pub created_at: i64,
}

impl ActivityEntry {
    pub fn new(doc_id: Uuid, user_id: Uuid, action: ActivityKind, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_id,
            user_id,
            action,
            details: details.into(),
            field_id: None,
            old_value: None,
            new_value: None,
            created_at: epoch_millis(),
        }
    }

    /// Attach the field and value transition for `FieldEdited` entries.
    pub fn with_field(
        mut self,
        field_id: Uuid,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        self.field_id = Some(field_id);
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }
}

/// Page of timeline entries plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct ActivityPage {
    /// Entries, newest first.
    pub entries: Vec<ActivityEntry>,
    /// Pass as `cursor` to fetch the next (older) page. None = end.
    pub next_cursor: Option<u64>,
}

/// Durable append-only log, published on the per-document activity
/// topic as entries land.
pub struct ActivityLog {
    store: Arc<CollabStore>,
    channels: Arc<ChannelMap>,
}

impl ActivityLog {
    pub fn new(store: Arc<CollabStore>, channels: Arc<ChannelMap>) -> Self {
        Self { store, channels }
    }

    /// Persist an entry and publish it to subscribers.
    ///
    /// Publish failures are ignored: the durable append is the record,
    /// fan-out is best-effort.
    pub async fn append(&self, entry: ActivityEntry) -> Result<Uuid, StoreError> {
        self.store.append_activity(&entry)?;

        let msg = CollabMessage::activity(entry.user_id, entry.doc_id, &entry);
        if let Ok(encoded) = msg.encode() {
            let channel = self.channels.get_or_create(entry.doc_id).await;
            channel.publish_activity(Arc::new(encoded));
        }
        Ok(entry.id)
    }

    /// Best-effort append for use as a side-effect sink.
    ///
    /// Logs and swallows failures — a broken timeline must not fail
    /// the comment/version/follow mutation that produced the entry.
    pub async fn record(&self, entry: ActivityEntry) {
        let action = entry.action;
        let doc_id = entry.doc_id;
        if let Err(e) = self.append(entry).await {
            log::warn!("Activity append failed for doc {doc_id} ({action:?}): {e}");
        }
    }

    /// Timeline page, newest first. `cursor` is the `next_cursor` of a
    /// previous page.
    pub fn list(
        &self,
        doc_id: Uuid,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<ActivityPage, StoreError> {
        let rows = self.store.list_activity(doc_id, limit, cursor)?;
        let next_cursor = if rows.len() == limit {
            rows.last().map(|(seq, _)| *seq)
        } else {
            None
        };
        Ok(ActivityPage {
            entries: rows.into_iter().map(|(_, e)| e).collect(),
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    fn test_log() -> (ActivityLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CollabStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap(),
        );
        let channels = Arc::new(ChannelMap::new(64));
        (ActivityLog::new(store, channels), dir)
    }

    #[tokio::test]
    async fn test_append_and_list_newest_first() {
        let (log, _dir) = test_log();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();

        for i in 0..5 {
            log.append(ActivityEntry::new(
                doc,
                user,
                ActivityKind::FieldEdited,
                format!("edit {i}"),
            ))
            .await
            .unwrap();
        }

        let page = log.list(doc, 10, None).unwrap();
        assert_eq!(page.entries.len(), 5);
        assert_eq!(page.entries[0].details, "edit 4");
        assert_eq!(page.entries[4].details, "edit 0");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_cursor_pagination() {
        let (log, _dir) = test_log();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();

        for i in 0..7 {
            log.append(ActivityEntry::new(
                doc,
                user,
                ActivityKind::CommentAdded,
                format!("c{i}"),
            ))
            .await
            .unwrap();
        }

        let first = log.list(doc, 3, None).unwrap();
        assert_eq!(first.entries.len(), 3);
        assert_eq!(first.entries[0].details, "c6");
        let cursor = first.next_cursor.expect("more pages");

        let second = log.list(doc, 3, Some(cursor)).unwrap();
        assert_eq!(second.entries.len(), 3);
        assert_eq!(second.entries[0].details, "c3");

        let third = log.list(doc, 3, second.next_cursor).unwrap();
        assert_eq!(third.entries.len(), 1);
        assert_eq!(third.entries[0].details, "c0");
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_entries_isolated_by_document() {
        let (log, _dir) = test_log();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let user = Uuid::new_v4();

        log.append(ActivityEntry::new(doc_a, user, ActivityKind::Joined, "a"))
            .await
            .unwrap();
        log.append(ActivityEntry::new(doc_b, user, ActivityKind::Joined, "b"))
            .await
            .unwrap();

        assert_eq!(log.list(doc_a, 10, None).unwrap().entries.len(), 1);
        assert_eq!(log.list(doc_b, 10, None).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_append_publishes_to_topic() {
        let (log, _dir) = test_log();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();

        let channel = log.channels.get_or_create(doc).await;
        let mut rx = channel.subscribe_activity();

        log.append(ActivityEntry::new(doc, user, ActivityKind::Joined, "joined"))
            .await
            .unwrap();

        let bytes = rx.recv().await.unwrap();
        let msg = CollabMessage::decode(&bytes).unwrap();
        let entry = msg.activity_entry().unwrap();
        assert_eq!(entry.action, ActivityKind::Joined);
        assert_eq!(entry.doc_id, doc);
    }

    #[tokio::test]
    async fn test_field_edit_carries_transition() {
        let (log, _dir) = test_log();
        let doc = Uuid::new_v4();
        let field = Uuid::new_v4();

        let entry = ActivityEntry::new(doc, Uuid::new_v4(), ActivityKind::FieldEdited, "amount")
            .with_field(field, Some("10".into()), Some("25".into()));
        log.append(entry).await.unwrap();

        let page = log.list(doc, 1, None).unwrap();
        let got = &page.entries[0];
        assert_eq!(got.field_id, Some(field));
        assert_eq!(got.old_value.as_deref(), Some("10"));
        assert_eq!(got.new_value.as_deref(), Some("25"));
    }

    #[tokio::test]
    async fn test_record_swallows_nothing_on_success() {
        let (log, _dir) = test_log();
        let doc = Uuid::new_v4();
        log.record(ActivityEntry::new(doc, Uuid::new_v4(), ActivityKind::Left, "left"))
            .await;
        assert_eq!(log.list(doc, 10, None).unwrap().entries.len(), 1);
    }
}
