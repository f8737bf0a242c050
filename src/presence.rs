//! Presence store for real-time "who's here" awareness.
//!
//! Tracks per-user ephemeral state (cursor, selection, status, active
//! field) per document. Records are keyed by `(doc_id, user_id)`,
//! overwritten on every update, and considered gone once `last_seen`
//! falls outside the liveness window — even before an explicit leave.
//!
//! ```text
//! Client heartbeat / cursor move
//!       │
//!       ▼
//! PresenceStore::update() / touch()     (last-write-wins)
//!       │
//!       ▼   (presence topic broadcast)
//! Remote clients render PresenceRecord list
//! ```
//!
//! Typing indicators auto-expire: a record left in `Typing` with no
//! further activity for 3 seconds is downgraded to `Editing` by the
//! liveness sweep. Colors come from a fixed palette: the first index
//! not used by another live participant in the same document, recycled
//! when a user leaves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::epoch_millis;

/// Fixed cursor color palette, indexed by join order.
pub const COLOR_PALETTE: &[&str] = &[
    "#2563EB", // blue
    "#DC2626", // red
    "#16A34A", // green
    "#D97706", // amber
    "#9333EA", // purple
    "#0891B2", // cyan
    "#DB2777", // pink
    "#65A30D", // lime
    "#EA580C", // orange
    "#4F46E5", // indigo
];

/// What a participant is currently doing in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Viewing,
    Editing,
    Typing,
    Idle,
}

/// 2D cursor position in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

impl CursorPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Text selection as character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: u32,
    pub end: u32,
}

impl SelectionRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// One connected session's ephemeral state.
///
/// `seen_at` is a monotonic clock used for liveness; `last_seen_ms` is
/// the wall-clock mirror carried over the wire for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub doc_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    /// Index into [`COLOR_PALETTE`], stable for the session lifetime.
    pub color_index: usize,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPos>,
    pub selection: Option<SelectionRange>,
    pub active_field_id: Option<Uuid>,
    /// Wall-clock last activity (epoch milliseconds).
    pub last_seen_ms: i64,
    /// Monotonic last activity, for liveness checks.
    #[serde(skip, default = "Instant::now")]
    pub seen_at: Instant,
    /// When the record last entered `Typing`.
    #[serde(skip, default = "Instant::now")]
    typing_since: Instant,
}

impl PresenceRecord {
    fn new(doc_id: Uuid, user_id: Uuid, display_name: String, color_index: usize) -> Self {
        let now = Instant::now();
        Self {
            doc_id,
            user_id,
            display_name,
            color_index,
            status: PresenceStatus::Viewing,
            cursor: None,
            selection: None,
            active_field_id: None,
            last_seen_ms: epoch_millis(),
            seen_at: now,
            typing_since: now,
        }
    }

    /// Palette color for this session.
    pub fn color(&self) -> &'static str {
        COLOR_PALETTE[self.color_index % COLOR_PALETTE.len()]
    }

    /// Whether this record is stale under the given liveness window.
    pub fn is_stale(&self, window: Duration) -> bool {
        self.seen_at.elapsed() > window
    }
}

/// Partial presence update. Unset fields keep their previous value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PresencePatch {
    pub status: Option<PresenceStatus>,
    pub cursor: Option<CursorPos>,
    pub selection: Option<SelectionRange>,
    pub active_field_id: Option<Uuid>,
    /// Explicitly clear the active field (an unset `active_field_id`
    /// alone means "unchanged").
    pub clear_active_field: bool,
}

impl PresencePatch {
    /// A pure heartbeat: refreshes `last_seen` without changing state.
    pub fn heartbeat() -> Self {
        Self::default()
    }

    pub fn status(status: PresenceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn cursor(pos: CursorPos) -> Self {
        Self {
            cursor: Some(pos),
            ..Self::default()
        }
    }
}

/// Liveness and expiry tuning.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// Maximum silence before a record is considered gone.
    pub liveness_window: Duration,
    /// Silence after which `Typing` downgrades to `Editing`.
    pub typing_expiry: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(120),
            typing_expiry: Duration::from_secs(3),
        }
    }
}

/// Per-document presence state.
#[derive(Default)]
struct DocPresence {
    records: HashMap<Uuid, PresenceRecord>,
}

impl DocPresence {
    /// First palette index not used by a live participant.
    fn free_color_index(&self, window: Duration) -> usize {
        let used: Vec<usize> = self
            .records
            .values()
            .filter(|r| !r.is_stale(window))
            .map(|r| r.color_index)
            .collect();
        (0..COLOR_PALETTE.len())
            .find(|i| !used.contains(i))
            .unwrap_or(self.records.len() % COLOR_PALETTE.len())
    }
}

/// Expiring key-value space for presence, keyed by `(doc_id, user_id)`.
///
/// Updates are idempotent overwrites; concurrent updates from the same
/// user are last-write-wins by arrival. Never persisted — presence is
/// cosmetic and expires with the liveness window.
pub struct PresenceStore {
    docs: RwLock<HashMap<Uuid, DocPresence>>,
    config: PresenceConfig,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    /// Create with custom liveness tuning (shortened windows in tests).
    pub fn with_config(config: PresenceConfig) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    /// Register a session. Re-joining overwrites the existing record
    /// but keeps its color.
    pub async fn join(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        display_name: impl Into<String>,
    ) -> PresenceRecord {
        let mut docs = self.docs.write().await;
        let doc = docs.entry(doc_id).or_default();

        let color_index = match doc.records.get(&user_id) {
            Some(existing) => existing.color_index,
            None => doc.free_color_index(self.config.liveness_window),
        };

        let record = PresenceRecord::new(doc_id, user_id, display_name.into(), color_index);
        doc.records.insert(user_id, record.clone());
        record
    }

    /// Apply a partial update, refreshing `last_seen`.
    ///
    /// Returns the updated record, or `None` for an unknown session
    /// (callers should `join` first; an update for a departed session
    /// is dropped rather than resurrected).
    pub async fn update(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        patch: &PresencePatch,
    ) -> Option<PresenceRecord> {
        let mut docs = self.docs.write().await;
        let doc = docs.get_mut(&doc_id)?;
        let record = doc.records.get_mut(&user_id)?;

        if let Some(status) = patch.status {
            record.status = status;
            if status == PresenceStatus::Typing {
                record.typing_since = Instant::now();
            }
        }
        if let Some(cursor) = patch.cursor {
            record.cursor = Some(cursor);
        }
        if let Some(selection) = patch.selection {
            record.selection = Some(selection);
        }
        if let Some(field) = patch.active_field_id {
            record.active_field_id = Some(field);
        }
        if patch.clear_active_field {
            record.active_field_id = None;
        }

        record.seen_at = Instant::now();
        record.last_seen_ms = epoch_millis();
        Some(record.clone())
    }

    /// Heartbeat: refresh `last_seen` only.
    pub async fn touch(&self, doc_id: Uuid, user_id: Uuid) -> bool {
        self.update(doc_id, user_id, &PresencePatch::heartbeat())
            .await
            .is_some()
    }

    /// Remove a session, recycling its palette color.
    pub async fn leave(&self, doc_id: Uuid, user_id: Uuid) -> Option<PresenceRecord> {
        let mut docs = self.docs.write().await;
        let doc = docs.get_mut(&doc_id)?;
        let removed = doc.records.remove(&user_id);
        if doc.records.is_empty() {
            docs.remove(&doc_id);
        }
        removed
    }

    /// Current live participants, typing expiry applied.
    ///
    /// Stale records are filtered out (not removed — `sweep` does
    /// that) so readers never see a dead cursor.
    pub async fn list(&self, doc_id: Uuid) -> Vec<PresenceRecord> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get_mut(&doc_id) else {
            return Vec::new();
        };

        let mut live = Vec::new();
        for record in doc.records.values_mut() {
            if record.is_stale(self.config.liveness_window) {
                continue;
            }
            Self::expire_typing(record, self.config.typing_expiry);
            live.push(record.clone());
        }
        // Stable ordering for rendering: by color slot, then id.
        live.sort_by_key(|r| (r.color_index, r.user_id));
        live
    }

    /// Fetch one live record.
    pub async fn get(&self, doc_id: Uuid, user_id: Uuid) -> Option<PresenceRecord> {
        let docs = self.docs.read().await;
        let record = docs.get(&doc_id)?.records.get(&user_id)?;
        if record.is_stale(self.config.liveness_window) {
            return None;
        }
        Some(record.clone())
    }

    /// Drop stale records and expire typing indicators.
    ///
    /// Returns the user ids removed. Run periodically; harmless to run
    /// concurrently with updates since removal is keyed.
    pub async fn sweep(&self, doc_id: Uuid) -> Vec<Uuid> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get_mut(&doc_id) else {
            return Vec::new();
        };

        let window = self.config.liveness_window;
        let stale: Vec<Uuid> = doc
            .records
            .iter()
            .filter(|(_, r)| r.is_stale(window))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            doc.records.remove(id);
        }
        for record in doc.records.values_mut() {
            Self::expire_typing(record, self.config.typing_expiry);
        }
        if doc.records.is_empty() {
            docs.remove(&doc_id);
        }
        stale
    }

    /// Documents with at least one tracked session.
    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.docs.read().await.keys().cloned().collect()
    }

    /// Typing with no activity for `expiry` downgrades to Editing.
    fn expire_typing(record: &mut PresenceRecord, expiry: Duration) {
        if record.status == PresenceStatus::Typing && record.typing_since.elapsed() > expiry {
            record.status = PresenceStatus::Editing;
        }
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_join_creates_record() {
        let store = PresenceStore::new();
        let (doc, user) = ids();

        let record = store.join(doc, user, "Alice").await;
        assert_eq!(record.display_name, "Alice");
        assert_eq!(record.status, PresenceStatus::Viewing);
        assert_eq!(record.color_index, 0);
        assert!(record.cursor.is_none());

        let listed = store.list(doc).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, user);
    }

    #[tokio::test]
    async fn test_color_assignment_by_join_order() {
        let store = PresenceStore::new();
        let doc = Uuid::new_v4();

        let a = store.join(doc, Uuid::new_v4(), "A").await;
        let b = store.join(doc, Uuid::new_v4(), "B").await;
        let c = store.join(doc, Uuid::new_v4(), "C").await;

        assert_eq!(a.color_index, 0);
        assert_eq!(b.color_index, 1);
        assert_eq!(c.color_index, 2);
        assert_ne!(a.color(), b.color());
    }

    #[tokio::test]
    async fn test_color_recycled_on_leave() {
        let store = PresenceStore::new();
        let doc = Uuid::new_v4();
        let u1 = Uuid::new_v4();

        let a = store.join(doc, u1, "A").await;
        let _b = store.join(doc, Uuid::new_v4(), "B").await;
        assert_eq!(a.color_index, 0);

        store.leave(doc, u1).await;
        let c = store.join(doc, Uuid::new_v4(), "C").await;
        // Slot 0 is free again.
        assert_eq!(c.color_index, 0);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_color() {
        let store = PresenceStore::new();
        let doc = Uuid::new_v4();
        let _a = store.join(doc, Uuid::new_v4(), "A").await;
        let u = Uuid::new_v4();
        let first = store.join(doc, u, "B").await;
        let again = store.join(doc, u, "B").await;
        assert_eq!(first.color_index, again.color_index);
    }

    #[tokio::test]
    async fn test_update_is_partial_overwrite() {
        let store = PresenceStore::new();
        let (doc, user) = ids();
        store.join(doc, user, "Alice").await;

        store
            .update(doc, user, &PresencePatch::cursor(CursorPos::new(10.0, 20.0)))
            .await
            .unwrap();
        let updated = store
            .update(doc, user, &PresencePatch::status(PresenceStatus::Editing))
            .await
            .unwrap();

        // Cursor survived the status-only patch.
        assert_eq!(updated.cursor, Some(CursorPos::new(10.0, 20.0)));
        assert_eq!(updated.status, PresenceStatus::Editing);
    }

    #[tokio::test]
    async fn test_update_unknown_session_dropped() {
        let store = PresenceStore::new();
        let (doc, user) = ids();
        let result = store.update(doc, user, &PresencePatch::heartbeat()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_active_field_set_and_clear() {
        let store = PresenceStore::new();
        let (doc, user) = ids();
        store.join(doc, user, "Alice").await;

        let field = Uuid::new_v4();
        let patch = PresencePatch {
            active_field_id: Some(field),
            ..PresencePatch::default()
        };
        let r = store.update(doc, user, &patch).await.unwrap();
        assert_eq!(r.active_field_id, Some(field));

        let clear = PresencePatch {
            clear_active_field: true,
            ..PresencePatch::default()
        };
        let r = store.update(doc, user, &clear).await.unwrap();
        assert_eq!(r.active_field_id, None);
    }

    #[tokio::test]
    async fn test_leave_removes_record() {
        let store = PresenceStore::new();
        let (doc, user) = ids();
        store.join(doc, user, "Alice").await;

        let removed = store.leave(doc, user).await;
        assert!(removed.is_some());
        assert!(store.list(doc).await.is_empty());
        // Idempotent.
        assert!(store.leave(doc, user).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_record_filtered_from_list() {
        // Scaled-down scenario: 125ms of silence under a 120ms window.
        let store = PresenceStore::with_config(PresenceConfig {
            liveness_window: Duration::from_millis(120),
            typing_expiry: Duration::from_secs(3),
        });
        let (doc, user) = ids();
        store.join(doc, user, "A").await;

        assert_eq!(store.list(doc).await.len(), 1);
        tokio::time::sleep(Duration::from_millis(125)).await;
        assert!(store.list(doc).await.is_empty());
        assert!(store.get(doc, user).await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_record_live() {
        let store = PresenceStore::with_config(PresenceConfig {
            liveness_window: Duration::from_millis(120),
            typing_expiry: Duration::from_secs(3),
        });
        let (doc, user) = ids();
        store.join(doc, user, "A").await;

        // Heartbeat at ~60ms intervals keeps the record inside the window.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.touch(doc, user).await);
        }
        assert_eq!(store.list(doc).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale() {
        let store = PresenceStore::with_config(PresenceConfig {
            liveness_window: Duration::from_millis(50),
            typing_expiry: Duration::from_secs(3),
        });
        let doc = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let alive = Uuid::new_v4();

        store.join(doc, gone, "Gone").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.join(doc, alive, "Alive").await;

        let removed = store.sweep(doc).await;
        assert_eq!(removed, vec![gone]);
        let listed = store.list(doc).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, alive);
    }

    #[tokio::test]
    async fn test_typing_expires_to_editing() {
        let store = PresenceStore::with_config(PresenceConfig {
            liveness_window: Duration::from_secs(120),
            typing_expiry: Duration::from_millis(30),
        });
        let (doc, user) = ids();
        store.join(doc, user, "A").await;
        store
            .update(doc, user, &PresencePatch::status(PresenceStatus::Typing))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let listed = store.list(doc).await;
        assert_eq!(listed[0].status, PresenceStatus::Editing);
    }

    #[tokio::test]
    async fn test_continued_typing_stays_typing() {
        let store = PresenceStore::with_config(PresenceConfig {
            liveness_window: Duration::from_secs(120),
            typing_expiry: Duration::from_millis(50),
        });
        let (doc, user) = ids();
        store.join(doc, user, "A").await;

        for _ in 0..3 {
            store
                .update(doc, user, &PresencePatch::status(PresenceStatus::Typing))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let listed = store.list(doc).await;
        assert_eq!(listed[0].status, PresenceStatus::Typing);
    }

    #[tokio::test]
    async fn test_documents_isolated() {
        let store = PresenceStore::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        store.join(doc_a, Uuid::new_v4(), "A").await;

        assert_eq!(store.list(doc_a).await.len(), 1);
        assert!(store.list(doc_b).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_doc_slot_released() {
        let store = PresenceStore::new();
        let (doc, user) = ids();
        store.join(doc, user, "A").await;
        assert_eq!(store.active_documents().await.len(), 1);
        store.leave(doc, user).await;
        assert!(store.active_documents().await.is_empty());
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = PresenceRecord::new(Uuid::new_v4(), Uuid::new_v4(), "Alice".into(), 2);
        let encoded =
            bincode::serde::encode_to_vec(&record, bincode::config::standard()).unwrap();
        let (decoded, _): (PresenceRecord, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded.user_id, record.user_id);
        assert_eq!(decoded.color_index, 2);
        assert_eq!(decoded.status, PresenceStatus::Viewing);
    }

    #[test]
    fn test_palette_has_distinct_colors() {
        for (i, a) in COLOR_PALETTE.iter().enumerate() {
            for b in &COLOR_PALETTE[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
