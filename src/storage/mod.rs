//! Persistent storage layer for the collaboration core.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   append/scan   ┌──────────────┐
//! │ Engines      │ ──────────────► │ CollabStore  │
//! │ (in-memory)  │                 │ (RocksDB)    │
//! └──────┬───────┘                 └──────┬───────┘
//!        │                                │
//!        │ presence stays                 │ column families
//!        ▼ in memory only                 ▼
//! ┌──────────────┐   ┌────────────────────────────────────────┐
//! │ PresenceStore│   │ CF "activity"         — timeline rows   │
//! │ (never here) │   │ CF "operations"       — edit log        │
//! └──────────────┘   │ CF "comments"/"..."   — threads         │
//!                    │ CF "versions"/"..."   — version history │
//!                    │ CF "settings"/"follow"— per-user state  │
//!                    └────────────────────────────────────────┘
//! ```
//!
//! Every persisted row lives in its own column family, keyed so that
//! one prefix scan answers each list query. Per-document sequence
//! numbers are recovered from the keys themselves at open, so the
//! store has no separate counter rows to keep consistent.

pub mod rocks;

pub use rocks::{CollabStore, StoreConfig, StoreError};

use std::time::SystemTime;

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
