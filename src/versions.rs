//! Document version history: numbered snapshots, branches, restore,
//! and shallow diffs.
//!
//! Versions are full content snapshots, not deltas. Numbering is
//! `major.minor` with `version_number = major * 100 + minor`, so 1.0,
//! 1.1, 2.0 order as 100, 101, 200. Exactly one version per document
//! is current; the flip happens in a single store write batch.
//!
//! Restore never rewrites history: it copies the target's content into
//! a brand-new current version and leaves the target row untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::error::CollabError;
use crate::storage::{epoch_millis, CollabStore, StoreError};

/// How a version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Manual,
    Auto,
    Restore,
}

/// Branch lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Active,
    Merged,
    Archived,
}

/// A numbered content snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub doc_id: Uuid,
    /// Full document content at snapshot time.
    pub content: serde_json::Value,
    /// External file attachment, if the snapshot references one.
    pub file_ref: Option<String>,
    pub file_hash: Option<String>,
    pub change_summary: String,
    pub change_kind: ChangeKind,
    /// None = trunk.
    pub branch_id: Option<Uuid>,
    pub parent_version_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub major: u32,
    pub minor: u32,
    /// `major * 100 + minor`; strictly increasing along a lineage.
    pub version_number: u64,
    pub is_current: bool,
    pub created_by: Uuid,
    pub created_at: i64,
}

/// A named line of versions forked off a base version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionBranch {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub name: String,
    pub base_version_id: Uuid,
    pub parent_branch_id: Option<Uuid>,
    pub status: BranchStatus,
    pub created_by: Uuid,
    pub created_at: i64,
}

impl VersionBranch {
    pub fn new(
        doc_id: Uuid,
        name: impl Into<String>,
        base_version_id: Uuid,
        created_by: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_id,
            name: name.into(),
            base_version_id,
            parent_branch_id: None,
            status: BranchStatus::Active,
            created_by,
            created_at: epoch_millis(),
        }
    }
}

/// A note attached to one version (separate from document comments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionComment {
    pub id: Uuid,
    pub version_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    pub created_at: i64,
}

impl VersionComment {
    pub fn new(version_id: Uuid, user_id: Uuid, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version_id,
            user_id,
            body: body.into(),
            created_at: epoch_millis(),
        }
    }
}

/// Classification of one top-level key in a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

/// One top-level key's change between two versions.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub key: String,
    pub kind: DiffKind,
    pub from: Option<serde_json::Value>,
    pub to: Option<serde_json::Value>,
}

/// Shallow comparison of two versions' content.
///
/// Keys are compared at the top level only; nested values count as
/// modified or unchanged by serialized equality.
#[derive(Debug, Clone)]
pub struct VersionDiff {
    pub from_version: Uuid,
    pub to_version: Uuid,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub entries: Vec<DiffEntry>,
}

/// Version operations scoped to one document.
///
/// The actor is the acting user; mutations without one fail with
/// `NotAuthenticated`. The active branch filters `fetch_versions` and
/// stamps new versions; it never changes which version is current.
pub struct VersionControl {
    store: Arc<CollabStore>,
    activity: Arc<ActivityLog>,
    doc_id: Uuid,
    actor: Option<Uuid>,
    active_branch: Option<Uuid>,
}

impl VersionControl {
    pub fn new(store: Arc<CollabStore>, activity: Arc<ActivityLog>, doc_id: Uuid) -> Self {
        Self {
            store,
            activity,
            doc_id,
            actor: None,
            active_branch: None,
        }
    }

    pub fn with_actor(mut self, user_id: Uuid) -> Self {
        self.actor = Some(user_id);
        self
    }

    pub fn set_actor(&mut self, actor: Option<Uuid>) {
        self.actor = actor;
    }

    pub fn active_branch(&self) -> Option<Uuid> {
        self.active_branch
    }

    fn actor(&self) -> Result<Uuid, CollabError> {
        self.actor.ok_or(CollabError::NotAuthenticated)
    }

    /// The document's current version.
    pub fn current(&self) -> Result<Option<DocumentVersion>, CollabError> {
        Ok(self.store.current_version(self.doc_id)?)
    }

    /// Snapshot `content` as the new current version.
    ///
    /// A major bump moves to `(major + 1).0`; otherwise the minor is
    /// incremented. The first version of a document is 1.0.
    pub async fn create_version(
        &self,
        content: serde_json::Value,
        summary: impl Into<String>,
        major_bump: bool,
    ) -> Result<DocumentVersion, CollabError> {
        let actor = self.actor()?;

        let draft = DocumentVersion {
            id: Uuid::new_v4(),
            doc_id: self.doc_id,
            content,
            file_ref: None,
            file_hash: None,
            change_summary: summary.into(),
            change_kind: ChangeKind::Manual,
            branch_id: self.active_branch,
            parent_version_id: None,
            tags: Vec::new(),
            major: 0,
            minor: 0,
            version_number: 0,
            is_current: true,
            created_by: actor,
            created_at: epoch_millis(),
        };

        let version = self.store.commit_version(draft, major_bump)?;
        self.activity
            .record(ActivityEntry::new(
                self.doc_id,
                actor,
                ActivityKind::VersionCreated,
                format!("created version {}.{}", version.major, version.minor),
            ))
            .await;
        Ok(version)
    }

    /// Snapshot an auto-save. Same numbering as a manual minor bump.
    pub(crate) async fn create_auto_version(
        &self,
        content: serde_json::Value,
        actor: Uuid,
    ) -> Result<DocumentVersion, CollabError> {
        let draft = DocumentVersion {
            id: Uuid::new_v4(),
            doc_id: self.doc_id,
            content,
            file_ref: None,
            file_hash: None,
            change_summary: "Auto-saved version".into(),
            change_kind: ChangeKind::Auto,
            branch_id: self.active_branch,
            parent_version_id: None,
            tags: Vec::new(),
            major: 0,
            minor: 0,
            version_number: 0,
            is_current: true,
            created_by: actor,
            created_at: epoch_millis(),
        };

        Ok(self.store.commit_version(draft, false)?)
    }

    /// Copy a past version's content into a new current version.
    ///
    /// The restored-from row is left exactly as it was; history only
    /// ever grows.
    pub async fn restore_version(
        &self,
        version_id: Uuid,
    ) -> Result<DocumentVersion, CollabError> {
        let actor = self.actor()?;
        let target = self.fetch(version_id)?;

        let draft = DocumentVersion {
            id: Uuid::new_v4(),
            doc_id: self.doc_id,
            content: target.content.clone(),
            file_ref: target.file_ref.clone(),
            file_hash: target.file_hash.clone(),
            change_summary: format!("Restored from version {}.{}", target.major, target.minor),
            change_kind: ChangeKind::Restore,
            branch_id: self.active_branch,
            parent_version_id: None,
            tags: Vec::new(),
            major: 0,
            minor: 0,
            version_number: 0,
            is_current: true,
            created_by: actor,
            created_at: epoch_millis(),
        };

        let version = self.store.commit_version(draft, false)?;
        self.activity
            .record(ActivityEntry::new(
                self.doc_id,
                actor,
                ActivityKind::VersionRestored,
                version.change_summary.clone(),
            ))
            .await;
        Ok(version)
    }

    /// Remove a non-current version from history.
    pub async fn delete_version(&self, version_id: Uuid) -> Result<(), CollabError> {
        self.actor()?;
        if let Some(current) = self.store.current_version(self.doc_id)? {
            if current.id == version_id {
                return Err(CollabError::InvalidOperation(
                    "Cannot delete the current version".into(),
                ));
            }
        }
        self.fetch(version_id)?;
        self.store.delete_version(version_id)?;
        Ok(())
    }

    /// Fork a branch off the current version.
    pub async fn create_branch(
        &self,
        name: impl Into<String>,
    ) -> Result<VersionBranch, CollabError> {
        let actor = self.actor()?;
        let current = self
            .store
            .current_version(self.doc_id)?
            .ok_or(CollabError::InvalidOperation(
                "Cannot branch a document with no versions".into(),
            ))?;

        let mut branch = VersionBranch::new(self.doc_id, name, current.id, actor);
        branch.parent_branch_id = self.active_branch;
        self.store.insert_branch(&branch)?;
        self.activity
            .record(ActivityEntry::new(
                self.doc_id,
                actor,
                ActivityKind::BranchCreated,
                format!("created branch \"{}\"", branch.name),
            ))
            .await;
        Ok(branch)
    }

    /// Change which branch `fetch_versions` reads and new versions are
    /// stamped with. `None` switches back to trunk.
    pub fn switch_branch(&mut self, branch_id: Option<Uuid>) -> Result<(), CollabError> {
        if let Some(id) = branch_id {
            match self.store.get_branch(self.doc_id, id) {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    return Err(CollabError::NotFound { kind: "branch", id })
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.active_branch = branch_id;
        Ok(())
    }

    pub fn list_branches(&self) -> Result<Vec<VersionBranch>, CollabError> {
        Ok(self.store.list_branches(self.doc_id)?)
    }

    /// Versions on the active branch, newest first.
    pub fn fetch_versions(&self) -> Result<Vec<DocumentVersion>, CollabError> {
        let versions = self.store.list_versions(self.doc_id)?;
        Ok(versions
            .into_iter()
            .filter(|v| v.branch_id == self.active_branch)
            .collect())
    }

    /// Shallow per-key comparison of two versions' content.
    pub fn compare_versions(&self, from_id: Uuid, to_id: Uuid) -> Result<VersionDiff, CollabError> {
        let from = self.fetch(from_id)?;
        let to = self.fetch(to_id)?;

        let from_map = top_level(&from.content);
        let to_map = top_level(&to.content);

        let keys: BTreeSet<&String> = from_map.keys().chain(to_map.keys()).collect();
        let mut diff = VersionDiff {
            from_version: from_id,
            to_version: to_id,
            added: 0,
            removed: 0,
            modified: 0,
            unchanged: 0,
            entries: Vec::with_capacity(keys.len()),
        };

        for key in keys {
            let (kind, old, new) = match (from_map.get(key), to_map.get(key)) {
                (None, Some(new)) => (DiffKind::Added, None, Some(new.clone())),
                (Some(old), None) => (DiffKind::Removed, Some(old.clone()), None),
                (Some(old), Some(new)) if old == new => {
                    (DiffKind::Unchanged, Some(old.clone()), Some(new.clone()))
                }
                (Some(old), Some(new)) => {
                    (DiffKind::Modified, Some(old.clone()), Some(new.clone()))
                }
                (None, None) => continue,
            };
            match kind {
                DiffKind::Added => diff.added += 1,
                DiffKind::Removed => diff.removed += 1,
                DiffKind::Modified => diff.modified += 1,
                DiffKind::Unchanged => diff.unchanged += 1,
            }
            diff.entries.push(DiffEntry {
                key: key.clone(),
                kind,
                from: old,
                to: new,
            });
        }
        Ok(diff)
    }

    /// Attach a note to a version.
    pub async fn add_version_comment(
        &self,
        version_id: Uuid,
        body: impl Into<String>,
    ) -> Result<VersionComment, CollabError> {
        let actor = self.actor()?;
        self.fetch(version_id)?;
        let comment = VersionComment::new(version_id, actor, body);
        self.store.append_version_comment(&comment)?;
        Ok(comment)
    }

    /// Notes on a version in posting order.
    pub fn version_comments(&self, version_id: Uuid) -> Result<Vec<VersionComment>, CollabError> {
        Ok(self.store.list_version_comments(version_id)?)
    }

    fn fetch(&self, version_id: Uuid) -> Result<DocumentVersion, CollabError> {
        match self.store.get_version(version_id) {
            Ok(version) => Ok(version),
            Err(StoreError::NotFound(_)) => Err(CollabError::NotFound {
                kind: "version",
                id: version_id,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Content viewed as top-level keys. Non-object content is exposed as
/// a single `content` key so diffs still have something to say.
fn top_level(value: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("content".into(), other.clone());
            map
        }
    }
}
