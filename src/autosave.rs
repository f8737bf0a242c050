//! Scheduled automatic versioning.
//!
//! A background interval task snapshots the document through a
//! caller-supplied content getter. A tick is a no-op when the content
//! has not changed since the last auto-save, and auto-saves stop once
//! the per-document cap of auto versions is reached (the cap counts
//! stored rows, so it holds across restarts). A failed tick logs and
//! waits for the next one.
//!
//! Settings resolve per user: a per-document row overrides the user's
//! global row, and a default global row is created on first use.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::error::CollabError;
use crate::storage::CollabStore;
use crate::versions::VersionControl;

/// Produces the current document content for a snapshot.
pub type ContentGetter = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Auto-versioning preferences for a user, optionally per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoVersionSettings {
    pub user_id: Uuid,
    /// None = the user's global row.
    pub doc_id: Option<Uuid>,
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_auto_versions: u64,
}

impl AutoVersionSettings {
    /// The defaults written when a user has no settings yet.
    pub fn default_global(user_id: Uuid) -> Self {
        Self {
            user_id,
            doc_id: None,
            enabled: true,
            interval_secs: 300,
            max_auto_versions: 50,
        }
    }
}

struct AutoState {
    /// Serialized form of the last snapshot taken, for change detection.
    last_saved: Option<String>,
    /// Stored Auto rows for this document; seeded lazily from the store.
    auto_count: Option<u64>,
    max_auto_versions: Option<u64>,
}

struct AutoInner {
    store: Arc<CollabStore>,
    activity: Arc<ActivityLog>,
    doc_id: Uuid,
    user_id: Uuid,
    content: ContentGetter,
    state: tokio::sync::Mutex<AutoState>,
}

impl AutoInner {
    /// One auto-save attempt. Returns whether a version was created.
    async fn tick(&self) -> Result<bool, CollabError> {
        let snapshot = (self.content)();
        let serialized = serde_json::to_string(&snapshot)
            .map_err(|e| CollabError::InvalidOperation(format!("Unserializable content: {e}")))?;

        let mut state = self.state.lock().await;
        if state.auto_count.is_none() {
            state.auto_count = Some(self.store.count_auto_versions(self.doc_id)?);
        }
        if state.max_auto_versions.is_none() {
            let settings = self.store.resolve_auto_settings(self.user_id, self.doc_id)?;
            state.max_auto_versions = Some(settings.max_auto_versions);
        }

        if state.last_saved.as_deref() == Some(serialized.as_str()) {
            return Ok(false);
        }
        let count = state.auto_count.unwrap_or(0);
        let max = state.max_auto_versions.unwrap_or(0);
        if count >= max {
            log::warn!(
                "Auto-version cap reached for doc {} ({count}/{max}), skipping",
                self.doc_id
            );
            return Ok(false);
        }

        let vc = VersionControl::new(self.store.clone(), self.activity.clone(), self.doc_id);
        vc.create_auto_version(snapshot, self.user_id).await?;
        state.auto_count = Some(count + 1);
        state.last_saved = Some(serialized);
        log::debug!("Auto-saved doc {} ({}/{max})", self.doc_id, count + 1);
        Ok(true)
    }
}

/// Drives periodic auto-versioning for one document and user.
pub struct AutoVersioner {
    inner: Arc<AutoInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoVersioner {
    pub fn new(
        store: Arc<CollabStore>,
        activity: Arc<ActivityLog>,
        doc_id: Uuid,
        user_id: Uuid,
        content: ContentGetter,
    ) -> Self {
        Self {
            inner: Arc::new(AutoInner {
                store,
                activity,
                doc_id,
                user_id,
                content,
                state: tokio::sync::Mutex::new(AutoState {
                    last_saved: None,
                    auto_count: None,
                    max_auto_versions: None,
                }),
            }),
            task: Mutex::new(None),
        }
    }

    /// Resolve the user's effective settings and start the interval
    /// task if auto-versioning is enabled. Returns those settings.
    pub async fn start(&self) -> Result<AutoVersionSettings, CollabError> {
        let settings = self
            .inner
            .store
            .resolve_auto_settings(self.inner.user_id, self.inner.doc_id)?;

        {
            let mut state = self.inner.state.lock().await;
            state.auto_count = Some(self.inner.store.count_auto_versions(self.inner.doc_id)?);
            state.max_auto_versions = Some(settings.max_auto_versions);
        }

        self.stop();
        if settings.enabled {
            self.spawn_timer(settings.interval_secs);
        }
        Ok(settings)
    }

    fn spawn_timer(&self, interval_secs: u64) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = inner.tick().await {
                    log::warn!("Auto-save failed for doc {}: {e}", inner.doc_id);
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// One auto-save attempt right now. Returns whether a version was
    /// created.
    pub async fn tick(&self) -> Result<bool, CollabError> {
        self.inner.tick().await
    }

    /// Persist new settings and restart the timer accordingly.
    pub async fn apply_settings(&self, settings: AutoVersionSettings) -> Result<(), CollabError> {
        self.inner.store.put_auto_settings(&settings)?;
        {
            let mut state = self.inner.state.lock().await;
            state.max_auto_versions = Some(settings.max_auto_versions);
        }

        self.stop();
        if settings.enabled {
            self.spawn_timer(settings.interval_secs);
        }
        Ok(())
    }

    /// Abort the interval task, if running.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for AutoVersioner {
    fn drop(&mut self) {
        self.stop();
    }
}
