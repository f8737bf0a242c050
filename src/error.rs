//! Crate-wide error taxonomy.
//!
//! Failure classes (see the propagation rules on each engine):
//! - `NotAuthenticated` — a mutating call with no known actor
//! - `PermissionDenied` — non-author attempting an author-only mutation
//! - `NotFound` — operating on a missing comment/version/branch id
//! - `InvalidOperation` — e.g. deleting the current version
//! - `Store` / `Protocol` — transient store or wire failures
//!
//! Presence, heartbeat, and activity-sink failures are best-effort:
//! callers log them and continue. Comment/version/branch mutation
//! failures are surfaced to the caller.

use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the collaboration engines.
#[derive(Debug, Clone)]
pub enum CollabError {
    /// A mutating call was made with no authenticated actor.
    NotAuthenticated,
    /// The actor is not allowed to perform this mutation.
    PermissionDenied(String),
    /// The referenced entity does not exist.
    NotFound { kind: &'static str, id: Uuid },
    /// The operation is not valid in the current state.
    InvalidOperation(String),
    /// Durable store failure (transient or persistent).
    Store(StoreError),
    /// Wire protocol failure.
    Protocol(ProtocolError),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollabError::NotAuthenticated => write!(f, "No authenticated actor"),
            CollabError::PermissionDenied(msg) => write!(f, "Permission denied: {msg}"),
            CollabError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            CollabError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            CollabError::Store(e) => write!(f, "Store error: {e}"),
            CollabError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        // A missing row surfaces as NotFound when the store knows the id.
        match e {
            StoreError::NotFound(id) => CollabError::NotFound { kind: "entity", id },
            other => CollabError::Store(other),
        }
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_variants() {
        let err = CollabError::NotAuthenticated;
        assert!(err.to_string().contains("authenticated"));

        let err = CollabError::PermissionDenied("only the author may edit".into());
        assert!(err.to_string().contains("Permission denied"));

        let id = Uuid::nil();
        let err = CollabError::NotFound { kind: "comment", id };
        assert!(err.to_string().contains("comment not found"));

        let err = CollabError::InvalidOperation("cannot delete the current version".into());
        assert!(err.to_string().contains("Invalid operation"));
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let id = Uuid::new_v4();
        let err: CollabError = StoreError::NotFound(id).into();
        match err {
            CollabError::NotFound { id: got, .. } => assert_eq!(got, id),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_store_database_error_wraps() {
        let err: CollabError = StoreError::DatabaseError("disk full".into()).into();
        assert!(matches!(err, CollabError::Store(_)));
    }
}
