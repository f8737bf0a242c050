//! Binary wire protocol for the collaboration channel.
//!
//! Frame layout (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ user_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payload encoding varies by kind: presence and activity payloads are
//! bincode; operation payloads are JSON, because `Operation` carries an
//! untyped `serde_json::Value` and bincode cannot decode untyped values
//! from its non-self-describing format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityEntry;
use crate::operations::Operation;
use crate::presence::{PresencePatch, PresenceRecord};

/// Message kinds on the collaboration channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Session introduction: joins the document room.
    Hello = 1,
    /// Clean leave notification.
    Goodbye = 2,
    /// Client → server partial presence update (includes heartbeats).
    PresencePatch = 3,
    /// Server → clients full presence record after an update.
    PresenceState = 4,
    /// Sequenced edit operation.
    Operation = 5,
    /// Activity log entry notification.
    Activity = 6,
    /// Liveness ping.
    Ping = 7,
    /// Liveness pong.
    Pong = 8,
}

/// Session introduction payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloInfo {
    pub display_name: String,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabMessage {
    pub kind: MessageKind,
    pub user_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local send counter, for de-duplication on at-least-once
    /// channels. Not globally ordered.
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl CollabMessage {
    pub fn hello(user_id: Uuid, doc_id: Uuid, display_name: impl Into<String>) -> Self {
        let info = HelloInfo {
            display_name: display_name.into(),
        };
        let payload = bincode::serde::encode_to_vec(&info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::Hello,
            user_id,
            doc_id,
            seq: 0,
            payload,
        }
    }

    pub fn goodbye(user_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Goodbye,
            user_id,
            doc_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn presence_patch(user_id: Uuid, doc_id: Uuid, seq: u64, patch: &PresencePatch) -> Self {
        let payload = bincode::serde::encode_to_vec(patch, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::PresencePatch,
            user_id,
            doc_id,
            seq,
            payload,
        }
    }

    pub fn presence_state(doc_id: Uuid, record: &PresenceRecord) -> Self {
        let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::PresenceState,
            user_id: record.user_id,
            doc_id,
            seq: 0,
            payload,
        }
    }

    /// JSON payload: see the module note on untyped values.
    pub fn operation(user_id: Uuid, doc_id: Uuid, op: &Operation) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(op)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::Operation,
            user_id,
            doc_id,
            seq: op.version_number,
            payload,
        })
    }

    pub fn activity(user_id: Uuid, doc_id: Uuid, entry: &ActivityEntry) -> Self {
        let payload = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::Activity,
            user_id,
            doc_id,
            seq: 0,
            payload,
        }
    }

    pub fn ping(user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            user_id,
            doc_id: Uuid::nil(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            user_id,
            doc_id: Uuid::nil(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    // ─── Typed payload accessors ─────────────────────────────────────

    pub fn hello_info(&self) -> Result<HelloInfo, ProtocolError> {
        self.expect_kind(MessageKind::Hello)?;
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    pub fn presence_patch_payload(&self) -> Result<PresencePatch, ProtocolError> {
        self.expect_kind(MessageKind::PresencePatch)?;
        let (patch, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(patch)
    }

    pub fn presence_record(&self) -> Result<PresenceRecord, ProtocolError> {
        self.expect_kind(MessageKind::PresenceState)?;
        let (record, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(record)
    }

    pub fn operation_payload(&self) -> Result<Operation, ProtocolError> {
        self.expect_kind(MessageKind::Operation)?;
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn activity_entry(&self) -> Result<ActivityEntry, ProtocolError> {
        self.expect_kind(MessageKind::Activity)?;
        let (entry, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::InvalidMessageKind);
        }
        Ok(())
    }
}

/// Wire protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageKind => write!(f, "Invalid message kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::presence::{CursorPos, PresenceStatus};
    use serde_json::json;

    #[test]
    fn test_hello_roundtrip() {
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let msg = CollabMessage::hello(user, doc, "Alice");
        let decoded = CollabMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Hello);
        assert_eq!(decoded.user_id, user);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.hello_info().unwrap().display_name, "Alice");
    }

    #[test]
    fn test_goodbye_roundtrip() {
        let msg = CollabMessage::goodbye(Uuid::new_v4(), Uuid::new_v4());
        let decoded = CollabMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Goodbye);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_presence_patch_roundtrip() {
        let patch = PresencePatch {
            status: Some(PresenceStatus::Typing),
            cursor: Some(CursorPos::new(12.5, 40.0)),
            ..PresencePatch::default()
        };
        let msg = CollabMessage::presence_patch(Uuid::new_v4(), Uuid::new_v4(), 7, &patch);
        let decoded = CollabMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.presence_patch_payload().unwrap(), patch);
    }

    #[test]
    fn test_operation_roundtrip_json_payload() {
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut op = Operation::draft(doc, user, "edit", json!({"x": [1, 2]}), Some(4));
        op.version_number = 5;

        let msg = CollabMessage::operation(user, doc, &op).unwrap();
        let decoded = CollabMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, 5);
        let got = decoded.operation_payload().unwrap();
        assert_eq!(got.data, json!({"x": [1, 2]}));
        assert_eq!(got.parent_version, Some(4));
        assert_eq!(got.version_number, 5);
    }

    #[test]
    fn test_activity_roundtrip() {
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let entry = ActivityEntry::new(doc, user, ActivityKind::CommentAdded, "added a comment");

        let msg = CollabMessage::activity(user, doc, &entry);
        let decoded = CollabMessage::decode(&msg.encode().unwrap()).unwrap();

        let got = decoded.activity_entry().unwrap();
        assert_eq!(got.id, entry.id);
        assert_eq!(got.action, ActivityKind::CommentAdded);
    }

    #[test]
    fn test_ping_pong() {
        let user = Uuid::new_v4();
        let ping = CollabMessage::decode(&CollabMessage::ping(user).encode().unwrap()).unwrap();
        let pong = CollabMessage::decode(&CollabMessage::pong(user).encode().unwrap()).unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        assert_eq!(pong.kind, MessageKind::Pong);
        assert_eq!(ping.doc_id, Uuid::nil());
    }

    #[test]
    fn test_wrong_kind_accessor_errors() {
        let msg = CollabMessage::ping(Uuid::new_v4());
        assert!(msg.hello_info().is_err());
        assert!(msg.operation_payload().is_err());
        assert!(msg.activity_entry().is_err());
        assert!(msg.presence_record().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(CollabMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_heartbeat_is_small() {
        let msg = CollabMessage::presence_patch(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            &PresencePatch::heartbeat(),
        );
        let encoded = msg.encode().unwrap();
        // 1 kind + 16 user + 16 doc + seq + empty-ish patch: stays tiny.
        assert!(encoded.len() < 64, "heartbeat too large: {} bytes", encoded.len());
    }
}
