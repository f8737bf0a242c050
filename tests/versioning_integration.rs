//! Integration tests for the store-backed engines: version control,
//! comments, auto-versioning, and follow sessions sharing one store.

use std::sync::Arc;

use serde_json::json;
use tandem_collab::activity::{ActivityKind, ActivityLog};
use tandem_collab::autosave::{AutoVersionSettings, AutoVersioner};
use tandem_collab::broadcast::ChannelMap;
use tandem_collab::comments::{Comment, CommentEngine, CommentStatus};
use tandem_collab::error::CollabError;
use tandem_collab::follow::FollowManager;
use tandem_collab::presence::PresenceStore;
use tandem_collab::storage::{CollabStore, StoreConfig};
use tandem_collab::versions::{ChangeKind, DiffKind, VersionControl};
use tokio::sync::Mutex;
use uuid::Uuid;

struct Harness {
    store: Arc<CollabStore>,
    activity: Arc<ActivityLog>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        CollabStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap(),
    );
    let channels = Arc::new(ChannelMap::new(64));
    let activity = Arc::new(ActivityLog::new(store.clone(), channels));
    Harness {
        store,
        activity,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_version_lifecycle_with_activity_trail() {
    let h = harness();
    let doc = Uuid::new_v4();
    let author = Uuid::new_v4();
    let vc = VersionControl::new(h.store.clone(), h.activity.clone(), doc).with_actor(author);

    let v1 = vc
        .create_version(json!({"title": "Draft"}), "First draft", false)
        .await
        .unwrap();
    assert_eq!((v1.major, v1.minor), (1, 0));

    let v2 = vc
        .create_version(json!({"title": "Draft", "body": "text"}), "Added body", false)
        .await
        .unwrap();
    assert_eq!((v2.major, v2.minor), (1, 1));
    assert_eq!(v2.parent_version_id, Some(v1.id));

    let v3 = vc
        .create_version(json!({"title": "Final"}), "Published", true)
        .await
        .unwrap();
    assert_eq!((v3.major, v3.minor), (2, 0));
    assert_eq!(vc.current().unwrap().unwrap().id, v3.id);

    // Restoring v1 produces a new version with v1's content.
    let restored = vc.restore_version(v1.id).await.unwrap();
    assert_eq!(restored.change_kind, ChangeKind::Restore);
    assert_eq!(restored.content, json!({"title": "Draft"}));
    assert_eq!((restored.major, restored.minor), (2, 1));
    assert_eq!(vc.current().unwrap().unwrap().id, restored.id);

    // Each mutation left an audit entry.
    let page = h.activity.list(doc, 20, None).unwrap();
    let kinds: Vec<ActivityKind> = page.entries.iter().map(|e| e.action).collect();
    assert!(kinds.contains(&ActivityKind::VersionCreated));
    assert!(kinds.contains(&ActivityKind::VersionRestored));
}

#[tokio::test]
async fn test_diff_between_versions() {
    let h = harness();
    let doc = Uuid::new_v4();
    let vc = VersionControl::new(h.store.clone(), h.activity.clone(), doc)
        .with_actor(Uuid::new_v4());

    let v1 = vc
        .create_version(json!({"title": "Plan", "owner": "alice", "status": "open"}), "v1", false)
        .await
        .unwrap();
    let v2 = vc
        .create_version(json!({"title": "Plan", "owner": "bob", "deadline": "friday"}), "v2", false)
        .await
        .unwrap();

    let diff = vc.compare_versions(v1.id, v2.id).unwrap();
    assert_eq!(diff.added, 1); // deadline
    assert_eq!(diff.removed, 1); // status
    assert_eq!(diff.modified, 1); // owner
    assert_eq!(diff.unchanged, 1); // title

    let owner = diff.entries.iter().find(|e| e.key == "owner").unwrap();
    assert_eq!(owner.kind, DiffKind::Modified);
    assert_eq!(owner.from, Some(json!("alice")));
    assert_eq!(owner.to, Some(json!("bob")));
}

#[tokio::test]
async fn test_branching_isolates_version_lists() {
    let h = harness();
    let doc = Uuid::new_v4();
    let author = Uuid::new_v4();
    let mut vc =
        VersionControl::new(h.store.clone(), h.activity.clone(), doc).with_actor(author);

    vc.create_version(json!({"a": 1}), "base", false).await.unwrap();
    let branch = vc.create_branch("experiment").await.unwrap();
    assert_eq!(branch.name, "experiment");

    vc.switch_branch(Some(branch.id)).unwrap();
    let on_branch = vc
        .create_version(json!({"a": 2}), "branch work", false)
        .await
        .unwrap();

    // The branch sees only its own versions, main only the base.
    let branch_versions = vc.fetch_versions().unwrap();
    assert_eq!(branch_versions.len(), 1);
    assert_eq!(branch_versions[0].id, on_branch.id);

    vc.switch_branch(None).unwrap();
    let main_versions = vc.fetch_versions().unwrap();
    assert_eq!(main_versions.len(), 1);
    assert_eq!(main_versions[0].change_summary, "base");
}

#[tokio::test]
async fn test_comment_thread_resolution_flow() {
    let h = harness();
    let doc = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let engine = CommentEngine::new(h.store.clone(), h.activity.clone());

    let root = engine
        .add(Comment::new(doc, alice, "Is this number right?", None))
        .await
        .unwrap();
    engine
        .add(Comment::new(doc, bob, "Checked, it is.", Some(root.id)))
        .await
        .unwrap();

    engine.toggle_reaction(root.id, bob, "👍").await.unwrap();

    let resolved = engine.resolve(root.id, bob).await.unwrap();
    assert_eq!(resolved.status, CommentStatus::Resolved);
    assert_eq!(resolved.resolved_by, Some(bob));

    let threads = engine.list(doc).unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].replies.len(), 1);
    assert_eq!(threads[0].reactions.len(), 1);
    assert_eq!(engine.open_count(doc).unwrap(), 0);

    // Reopening clears the resolution stamp.
    let reopened = engine.reopen(root.id, alice).await.unwrap();
    assert_eq!(reopened.status, CommentStatus::Open);
    assert!(reopened.resolved_by.is_none());
    assert_eq!(engine.open_count(doc).unwrap(), 1);
}

#[tokio::test]
async fn test_comment_permissions_cross_user() {
    let h = harness();
    let doc = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let engine = CommentEngine::new(h.store.clone(), h.activity.clone());

    let comment = engine
        .add(Comment::new(doc, alice, "original", None))
        .await
        .unwrap();

    let result = engine.update(comment.id, bob, "hijacked").await;
    assert!(matches!(result, Err(CollabError::PermissionDenied(_))));

    let result = engine.delete(comment.id, bob).await;
    assert!(matches!(result, Err(CollabError::PermissionDenied(_))));

    // Resolution is open to any participant.
    engine.resolve(comment.id, bob).await.unwrap();
}

#[tokio::test]
async fn test_autosave_skips_unchanged_content() {
    let h = harness();
    let doc = Uuid::new_v4();
    let user = Uuid::new_v4();

    let content = Arc::new(Mutex::new(json!({"body": "v1"})));
    let getter = {
        let content = content.clone();
        Arc::new(move || content.try_lock().map(|c| c.clone()).unwrap_or_default())
    };
    let saver = AutoVersioner::new(h.store.clone(), h.activity.clone(), doc, user, getter);

    assert!(saver.tick().await.unwrap(), "First tick should save");
    assert!(!saver.tick().await.unwrap(), "Unchanged content is skipped");

    *content.lock().await = json!({"body": "v2"});
    assert!(saver.tick().await.unwrap(), "Changed content saves again");

    let versions = h.store.list_versions(doc).unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.change_kind == ChangeKind::Auto));
}

#[tokio::test]
async fn test_autosave_settings_resolution() {
    let h = harness();
    let doc = Uuid::new_v4();
    let user = Uuid::new_v4();
    let getter = Arc::new(|| json!({}));
    let saver = AutoVersioner::new(h.store.clone(), h.activity.clone(), doc, user, getter);

    // First start creates the global defaults.
    let settings = saver.start().await.unwrap();
    assert!(settings.enabled);
    assert_eq!(settings.interval_secs, 300);
    assert!(saver.is_running());
    saver.stop();

    // A per-document override takes precedence over the global row.
    saver
        .apply_settings(AutoVersionSettings {
            user_id: user,
            doc_id: Some(doc),
            enabled: false,
            interval_secs: 60,
            max_auto_versions: 5,
        })
        .await
        .unwrap();
    assert!(!saver.is_running(), "Disabled settings stop the timer");

    let resolved = h.store.resolve_auto_settings(user, doc).unwrap();
    assert_eq!(resolved.interval_secs, 60);
    assert!(!resolved.enabled);
}

#[tokio::test]
async fn test_follow_session_with_presence() {
    let h = harness();
    let doc = Uuid::new_v4();
    let leader = Uuid::new_v4();
    let follower = Uuid::new_v4();
    let presence = PresenceStore::new();
    presence.join(doc, leader, "Leader").await;

    let manager = FollowManager::new(h.store.clone(), h.activity.clone(), doc, follower);
    let session = manager.start_following(leader).await.unwrap();
    assert!(session.is_active);

    let record = manager.following(&presence).await.unwrap().unwrap();
    assert_eq!(record.user_id, leader);

    // Switching leaders ends the previous session.
    let other = Uuid::new_v4();
    manager.start_following(other).await.unwrap();
    assert_eq!(manager.current().unwrap().unwrap().leader_id, other);

    let ended = manager.stop_following().await.unwrap().unwrap();
    assert!(!ended.is_active);
    assert!(ended.ended_at.is_some());
    assert!(manager.current().unwrap().is_none());

    // History keeps both sessions.
    assert_eq!(manager.history().unwrap().len(), 2);
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();
    let author = Uuid::new_v4();
    let v1_id;

    {
        let store = Arc::new(CollabStore::open(StoreConfig::for_testing(&path)).unwrap());
        let channels = Arc::new(ChannelMap::new(64));
        let activity = Arc::new(ActivityLog::new(store.clone(), channels));
        let vc = VersionControl::new(store.clone(), activity.clone(), doc).with_actor(author);
        let v1 = vc
            .create_version(json!({"persisted": true}), "before restart", false)
            .await
            .unwrap();
        v1_id = v1.id;

        let engine = CommentEngine::new(store.clone(), activity);
        engine
            .add(Comment::new(doc, author, "survives restart", None))
            .await
            .unwrap();
    }

    let store = Arc::new(CollabStore::open(StoreConfig::for_testing(&path)).unwrap());
    let channels = Arc::new(ChannelMap::new(64));
    let activity = Arc::new(ActivityLog::new(store.clone(), channels));

    let vc = VersionControl::new(store.clone(), activity.clone(), doc).with_actor(author);
    let current = vc.current().unwrap().unwrap();
    assert_eq!(current.id, v1_id);
    assert_eq!(current.content, json!({"persisted": true}));

    let engine = CommentEngine::new(store, activity);
    let threads = engine.list(doc).unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].comment.body, "survives restart");
}
