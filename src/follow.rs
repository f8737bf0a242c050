//! Follow sessions: one participant tracks another's viewport.
//!
//! A follower has at most one active session per document; starting a
//! new one ends the previous session first. Sessions are durable rows
//! (the full history is kept), but resolving the leader goes through
//! live presence, so a follower of a departed leader simply sees
//! nobody until the leader returns or they stop following. Disconnect
//! does not implicitly end a session.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::error::CollabError;
use crate::presence::{PresenceRecord, PresenceStore};
use crate::storage::{epoch_millis, CollabStore};

/// One follower-leader pairing on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowSession {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub follower_id: Uuid,
    pub leader_id: Uuid,
    pub is_active: bool,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl FollowSession {
    pub fn new(doc_id: Uuid, follower_id: Uuid, leader_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_id,
            follower_id,
            leader_id,
            is_active: true,
            started_at: epoch_millis(),
            ended_at: None,
        }
    }
}

/// Follow operations for one follower on one document.
pub struct FollowManager {
    store: Arc<CollabStore>,
    activity: Arc<ActivityLog>,
    doc_id: Uuid,
    follower_id: Uuid,
}

impl FollowManager {
    pub fn new(
        store: Arc<CollabStore>,
        activity: Arc<ActivityLog>,
        doc_id: Uuid,
        follower_id: Uuid,
    ) -> Self {
        Self {
            store,
            activity,
            doc_id,
            follower_id,
        }
    }

    /// Begin following a leader, ending any session already active.
    pub async fn start_following(&self, leader_id: Uuid) -> Result<FollowSession, CollabError> {
        if leader_id == self.follower_id {
            return Err(CollabError::InvalidOperation(
                "Cannot follow yourself".into(),
            ));
        }

        if let Some(mut active) = self
            .store
            .active_follow_session(self.doc_id, self.follower_id)?
        {
            active.is_active = false;
            active.ended_at = Some(epoch_millis());
            self.store.update_follow_session(&active)?;
        }

        let session = FollowSession::new(self.doc_id, self.follower_id, leader_id);
        self.store.append_follow_session(&session)?;
        self.activity
            .record(ActivityEntry::new(
                self.doc_id,
                self.follower_id,
                ActivityKind::FollowStarted,
                format!("started following {leader_id}"),
            ))
            .await;
        Ok(session)
    }

    /// End the active session, if any. Returns the ended session.
    pub async fn stop_following(&self) -> Result<Option<FollowSession>, CollabError> {
        let Some(mut session) = self
            .store
            .active_follow_session(self.doc_id, self.follower_id)?
        else {
            return Ok(None);
        };

        session.is_active = false;
        session.ended_at = Some(epoch_millis());
        self.store.update_follow_session(&session)?;
        self.activity
            .record(ActivityEntry::new(
                self.doc_id,
                self.follower_id,
                ActivityKind::FollowEnded,
                format!("stopped following {}", session.leader_id),
            ))
            .await;
        Ok(Some(session))
    }

    /// The active session, if any.
    pub fn current(&self) -> Result<Option<FollowSession>, CollabError> {
        Ok(self
            .store
            .active_follow_session(self.doc_id, self.follower_id)?)
    }

    /// Resolve the followed leader to a live presence record.
    ///
    /// Returns `None` when not following, or when the leader's
    /// presence has gone stale; the session itself stays active.
    pub async fn following(
        &self,
        presence: &PresenceStore,
    ) -> Result<Option<PresenceRecord>, CollabError> {
        let Some(session) = self.current()? else {
            return Ok(None);
        };
        Ok(presence.get(self.doc_id, session.leader_id).await)
    }

    /// Full follow history for this follower, oldest first.
    pub fn history(&self) -> Result<Vec<FollowSession>, CollabError> {
        Ok(self
            .store
            .list_follow_sessions(self.doc_id, self.follower_id)?)
    }
}
