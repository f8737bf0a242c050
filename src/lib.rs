//! # tandem-collab — Multi-user document collaboration core
//!
//! Presence, activity, operation fan-out, comment threads, version
//! control, and follow sessions for collaborative document editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │    Binary Proto     │ (central)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                              ┌──────────────┼──────────────┐
//!                              ▼              ▼              ▼
//!                       ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                       │ Presence   │ │ ChannelMap │ │ CollabStore│
//!                       │ (memory)   │ │ (fan-out)  │ │ (RocksDB)  │
//!                       └────────────┘ └────────────┘ └──────┬─────┘
//!                                                            │
//!                                         activity, operations,
//!                                         comments, versions, follow
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded CollabMessage)
//! - [`broadcast`] — Per-document topic fan-out
//! - [`presence`] — Ephemeral session roster with liveness sweeping
//! - [`activity`] — Append-only audit log with cursor pagination
//! - [`operations`] — Per-document sequenced operation log
//! - [`comments`] — Threaded comments with reactions
//! - [`versions`] — Snapshot version control with branches and diffs
//! - [`autosave`] — Interval-driven automatic versioning
//! - [`follow`] — Follow-the-leader viewport sessions
//! - [`storage`] — RocksDB persistence layer
//! - [`server`] / [`client`] — WebSocket transport

pub mod activity;
pub mod autosave;
pub mod broadcast;
pub mod client;
pub mod comments;
pub mod error;
pub mod follow;
pub mod operations;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod versions;

// Re-exports for convenience
pub use activity::{ActivityEntry, ActivityKind, ActivityLog, ActivityPage};
pub use autosave::{AutoVersionSettings, AutoVersioner, ContentGetter};
pub use broadcast::{ChannelMap, ChannelStats, DocChannel};
pub use client::{CollabClient, CollabEvent, ConnectionState};
pub use comments::{Comment, CommentEngine, CommentStatus, CommentThread, Reaction};
pub use error::CollabError;
pub use follow::{FollowManager, FollowSession};
pub use operations::{Operation, OperationFeed, OperationLog};
pub use presence::{
    CursorPos, PresenceConfig, PresencePatch, PresenceRecord, PresenceStatus, PresenceStore,
    SelectionRange,
};
pub use protocol::{CollabMessage, HelloInfo, MessageKind, ProtocolError};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{CollabStore, StoreConfig, StoreError};
pub use versions::{
    BranchStatus, ChangeKind, DiffEntry, DiffKind, DocumentVersion, VersionBranch,
    VersionComment, VersionControl, VersionDiff,
};
