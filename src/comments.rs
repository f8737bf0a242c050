//! Threaded comments anchored to document content.
//!
//! Comments are stored as flat rows; the reply tree is rebuilt on
//! every fetch from `parent_id` links, so nesting depth is unbounded
//! and the stored shape stays trivial. Emoji reactions are separate
//! rows keyed by `(comment, user, symbol)`, which makes toggling a
//! point lookup instead of a list rewrite.
//!
//! Authorship rules: only the author may edit or delete a comment,
//! while any participant may resolve or reopen one. Mutations feed the
//! activity timeline as a side effect; a timeline failure never fails
//! the mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::error::CollabError;
use crate::presence::SelectionRange;
use crate::storage::{epoch_millis, CollabStore, StoreError};

/// Resolution state of a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentStatus {
    Open,
    Resolved,
}

/// A single comment row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    /// Reply target. None for thread roots.
    pub parent_id: Option<Uuid>,
    /// Text range the comment is anchored to, if any.
    pub selection: Option<SelectionRange>,
    /// Snapshot of the selected text at comment time.
    pub selection_text: Option<String>,
    /// Free-form anchor (field id, block path) for non-text targets.
    pub anchor: Option<String>,
    pub status: CommentStatus,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Comment {
    pub fn new(
        doc_id: Uuid,
        user_id: Uuid,
        body: impl Into<String>,
        parent_id: Option<Uuid>,
    ) -> Self {
        let now = epoch_millis();
        Self {
            id: Uuid::new_v4(),
            doc_id,
            user_id,
            body: body.into(),
            parent_id,
            selection: None,
            selection_text: None,
            anchor: None,
            status: CommentStatus::Open,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Anchor the comment to a text selection.
    pub fn with_selection(mut self, selection: SelectionRange, text: impl Into<String>) -> Self {
        self.selection = Some(selection);
        self.selection_text = Some(text.into());
        self
    }

    /// Anchor the comment to a non-text target.
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = Some(anchor.into());
        self
    }
}

/// An emoji reaction, unique per `(comment, user, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub comment_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub created_at: i64,
}

impl Reaction {
    pub fn new(comment_id: Uuid, user_id: Uuid, symbol: impl Into<String>) -> Self {
        Self {
            comment_id,
            user_id,
            symbol: symbol.into(),
            created_at: epoch_millis(),
        }
    }
}

/// A comment with its nested replies and reactions, as rendered.
#[derive(Debug, Clone)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<CommentThread>,
    pub reactions: Vec<Reaction>,
}

/// Comment operations for one store.
pub struct CommentEngine {
    store: Arc<CollabStore>,
    activity: Arc<ActivityLog>,
}

impl CommentEngine {
    pub fn new(store: Arc<CollabStore>, activity: Arc<ActivityLog>) -> Self {
        Self { store, activity }
    }

    /// Persist a new comment. A reply's parent must exist and belong
    /// to the same document.
    pub async fn add(&self, comment: Comment) -> Result<Comment, CollabError> {
        if let Some(parent_id) = comment.parent_id {
            let parent = match self.store.get_comment(parent_id) {
                Ok(parent) => parent,
                Err(StoreError::NotFound(_)) => {
                    return Err(CollabError::NotFound {
                        kind: "comment",
                        id: parent_id,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            if parent.doc_id != comment.doc_id {
                return Err(CollabError::InvalidOperation(
                    "Reply parent belongs to a different document".into(),
                ));
            }
        }

        self.store.insert_comment(&comment)?;
        self.activity
            .record(ActivityEntry::new(
                comment.doc_id,
                comment.user_id,
                ActivityKind::CommentAdded,
                "added a comment",
            ))
            .await;
        Ok(comment)
    }

    /// Replace the body of a comment. Author-only.
    pub async fn update(
        &self,
        comment_id: Uuid,
        user_id: Uuid,
        body: impl Into<String>,
    ) -> Result<Comment, CollabError> {
        let mut comment = self.fetch(comment_id)?;
        if comment.user_id != user_id {
            return Err(CollabError::PermissionDenied(
                "Only the author can edit a comment".into(),
            ));
        }

        comment.body = body.into();
        comment.updated_at = epoch_millis();
        self.store.update_comment(&comment)?;
        self.activity
            .record(ActivityEntry::new(
                comment.doc_id,
                user_id,
                ActivityKind::CommentUpdated,
                "edited a comment",
            ))
            .await;
        Ok(comment)
    }

    /// Remove a comment and its reactions. Author-only. Replies are
    /// kept and surface as thread roots.
    pub async fn delete(&self, comment_id: Uuid, user_id: Uuid) -> Result<(), CollabError> {
        let comment = self.fetch(comment_id)?;
        if comment.user_id != user_id {
            return Err(CollabError::PermissionDenied(
                "Only the author can delete a comment".into(),
            ));
        }

        self.store.delete_comment(comment_id)?;
        self.activity
            .record(ActivityEntry::new(
                comment.doc_id,
                user_id,
                ActivityKind::CommentDeleted,
                "deleted a comment",
            ))
            .await;
        Ok(())
    }

    /// Mark a comment resolved. Any participant may resolve.
    pub async fn resolve(&self, comment_id: Uuid, user_id: Uuid) -> Result<Comment, CollabError> {
        let mut comment = self.fetch(comment_id)?;
        comment.status = CommentStatus::Resolved;
        comment.resolved_by = Some(user_id);
        comment.resolved_at = Some(epoch_millis());
        comment.updated_at = epoch_millis();
        self.store.update_comment(&comment)?;
        self.activity
            .record(ActivityEntry::new(
                comment.doc_id,
                user_id,
                ActivityKind::CommentResolved,
                "resolved a comment",
            ))
            .await;
        Ok(comment)
    }

    /// Reopen a resolved comment. Any participant may reopen.
    pub async fn reopen(&self, comment_id: Uuid, user_id: Uuid) -> Result<Comment, CollabError> {
        let mut comment = self.fetch(comment_id)?;
        comment.status = CommentStatus::Open;
        comment.resolved_by = None;
        comment.resolved_at = None;
        comment.updated_at = epoch_millis();
        self.store.update_comment(&comment)?;
        self.activity
            .record(ActivityEntry::new(
                comment.doc_id,
                user_id,
                ActivityKind::CommentReopened,
                "reopened a comment",
            ))
            .await;
        Ok(comment)
    }

    /// Add the reaction if absent, remove it if present. Returns
    /// whether the reaction exists after the call.
    pub async fn toggle_reaction(
        &self,
        comment_id: Uuid,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<bool, CollabError> {
        // Validate the target exists before writing a reaction row.
        self.fetch(comment_id)?;

        if self.store.get_reaction(comment_id, user_id, symbol)?.is_some() {
            self.store.delete_reaction(comment_id, user_id, symbol)?;
            Ok(false)
        } else {
            self.store
                .put_reaction(&Reaction::new(comment_id, user_id, symbol))?;
            Ok(true)
        }
    }

    /// All threads of a document: roots in creation order, each with
    /// nested replies (also creation-ordered) and reactions attached.
    pub fn list(&self, doc_id: Uuid) -> Result<Vec<CommentThread>, CollabError> {
        let flat = self.store.list_comments(doc_id)?;
        let known: HashMap<Uuid, ()> = flat.iter().map(|c| (c.id, ())).collect();

        // Bucket replies under their parent, preserving row order.
        let mut children: HashMap<Uuid, Vec<Comment>> = HashMap::new();
        let mut roots = Vec::new();
        for comment in flat {
            match comment.parent_id {
                Some(parent) if known.contains_key(&parent) => {
                    children.entry(parent).or_default().push(comment);
                }
                // Orphaned replies (deleted parent) surface as roots.
                _ => roots.push(comment),
            }
        }

        roots
            .into_iter()
            .map(|root| self.assemble(root, &mut children))
            .collect()
    }

    fn assemble(
        &self,
        comment: Comment,
        children: &mut HashMap<Uuid, Vec<Comment>>,
    ) -> Result<CommentThread, CollabError> {
        let reactions = self.store.list_reactions(comment.id)?;
        let replies = children
            .remove(&comment.id)
            .unwrap_or_default()
            .into_iter()
            .map(|reply| self.assemble(reply, children))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CommentThread {
            comment,
            replies,
            reactions,
        })
    }

    /// Depth-first search of a thread for a comment id.
    pub fn find_in_thread(thread: &CommentThread, id: Uuid) -> Option<&Comment> {
        if thread.comment.id == id {
            return Some(&thread.comment);
        }
        thread
            .replies
            .iter()
            .find_map(|reply| Self::find_in_thread(reply, id))
    }

    /// Number of unresolved thread roots (replies do not count).
    pub fn open_count(&self, doc_id: Uuid) -> Result<usize, CollabError> {
        let threads = self.list(doc_id)?;
        Ok(threads
            .iter()
            .filter(|t| t.comment.status == CommentStatus::Open)
            .count())
    }

    fn fetch(&self, comment_id: Uuid) -> Result<Comment, CollabError> {
        match self.store.get_comment(comment_id) {
            Ok(comment) => Ok(comment),
            Err(StoreError::NotFound(_)) => Err(CollabError::NotFound {
                kind: "comment",
                id: comment_id,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
