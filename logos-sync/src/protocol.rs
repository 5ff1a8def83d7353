//! Versioned message envelope for the sync protocol.
//!
//! Wire format (UTF-8 JSON text frame):
//! ```text
//! { "version": 1, "type": "operation", "payload": { ... } }
//! ```
//!
//! Parsing tolerates any `version` so the receiver can decide how to handle
//! older or newer peers (usually by asking for a resync). It does fail on
//! input that is not JSON, not an object, or has no string `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::FieldClock;
use crate::document::{DocumentSnapshot, State};
use crate::error::{ProtocolError, SyncResult};
use crate::operation::{Operation, WireOperation};

pub const CURRENT_VERSION: u32 = 1;

/// Message types understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client joins a document room as a user
    Join,
    /// Client leaves a document room
    Leave,
    /// Client submits an operation / server fans out an accepted one
    Operation,
    /// Server confirms the sender's operation with its final revision
    Ack,
    /// Client asks for the full document state
    SyncRequest,
    /// Full document state
    Snapshot,
    /// Client pushes its full state after being offline
    Merge,
    /// Ephemeral cursor/selection state
    Presence,
    Undo,
    Redo,
    PeerJoined,
    PeerLeft,
    Ping,
    Pong,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 15] = [
        MessageType::Join,
        MessageType::Leave,
        MessageType::Operation,
        MessageType::Ack,
        MessageType::SyncRequest,
        MessageType::Snapshot,
        MessageType::Merge,
        MessageType::Presence,
        MessageType::Undo,
        MessageType::Redo,
        MessageType::PeerJoined,
        MessageType::PeerLeft,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Operation => "operation",
            MessageType::Ack => "ack",
            MessageType::SyncRequest => "sync_request",
            MessageType::Snapshot => "snapshot",
            MessageType::Merge => "merge",
            MessageType::Presence => "presence",
            MessageType::Undo => "undo",
            MessageType::Redo => "redo",
            MessageType::PeerJoined => "peer_joined",
            MessageType::PeerLeft => "peer_left",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Value,
}

/// Wrap `payload` in an envelope stamped with [`CURRENT_VERSION`].
pub fn create_message<T: Serialize>(msg_type: &str, payload: &T) -> Result<Envelope, ProtocolError> {
    Ok(Envelope {
        version: CURRENT_VERSION,
        msg_type: msg_type.to_string(),
        payload: serde_json::to_value(payload)?,
    })
}

/// Parse a raw frame into an envelope.
///
/// A missing or non-numeric `version` reads as 0; a missing `payload` reads
/// as an empty object.
pub fn parse_message(raw: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    let msg_type = match obj.remove("type") {
        Some(Value::String(t)) if !t.is_empty() => t,
        _ => return Err(ProtocolError::MissingType),
    };
    let version = obj
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    let payload = obj.remove("payload").unwrap_or_else(|| Value::Object(Map::new()));

    Ok(Envelope {
        version,
        msg_type,
        payload,
    })
}

impl Envelope {
    fn typed<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        create_message(msg_type.as_str(), payload)
    }

    /// Known message type, `None` for anything this build does not understand.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.msg_type)
    }

    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            msg_type: self.msg_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode an `operation` payload.
    ///
    /// A payload of the wrong shape is a protocol error. An operation that
    /// is well formed but breaks a rule (negative number, unknown type,
    /// missing field) reports that rule's validation error instead.
    pub fn operation_payload(&self) -> SyncResult<OperationPayload> {
        let raw: RawOperationPayload = self.payload_as()?;
        Ok(OperationPayload {
            doc_id: raw.doc_id,
            base_revision: raw.base_revision,
            operation: Operation::try_from(raw.operation)?,
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn join(doc_id: &str, user_id: &str) -> Result<Self, ProtocolError> {
        Self::rejoin(doc_id, user_id, None)
    }

    /// Join carrying the last revision the client holds. The server answers
    /// with the operations since then, or a snapshot if it no longer has them.
    pub fn rejoin(doc_id: &str, user_id: &str, since_revision: Option<u64>) -> Result<Self, ProtocolError> {
        Self::typed(
            MessageType::Join,
            &JoinPayload {
                doc_id: doc_id.to_string(),
                user_id: user_id.to_string(),
                since_revision,
            },
        )
    }

    pub fn leave(doc_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::Leave, &DocRef { doc_id: doc_id.to_string() })
    }

    pub fn operation(doc_id: &str, base_revision: u64, operation: Operation) -> Result<Self, ProtocolError> {
        Self::typed(
            MessageType::Operation,
            &OperationPayload {
                doc_id: doc_id.to_string(),
                base_revision,
                operation,
            },
        )
    }

    pub fn applied(msg_type: MessageType, payload: &AppliedPayload) -> Result<Self, ProtocolError> {
        Self::typed(msg_type, payload)
    }

    pub fn sync_request(doc_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::SyncRequest, &DocRef { doc_id: doc_id.to_string() })
    }

    pub fn snapshot(snapshot: &DocumentSnapshot) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::Snapshot, snapshot)
    }

    pub fn merge(doc_id: &str, state: State, clock: FieldClock) -> Result<Self, ProtocolError> {
        Self::typed(
            MessageType::Merge,
            &MergePayload {
                doc_id: doc_id.to_string(),
                state,
                clock,
            },
        )
    }

    pub fn presence(payload: &PresencePayload) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::Presence, payload)
    }

    pub fn undo(doc_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::Undo, &DocRef { doc_id: doc_id.to_string() })
    }

    pub fn redo(doc_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(MessageType::Redo, &DocRef { doc_id: doc_id.to_string() })
    }

    pub fn peer_joined(doc_id: &str, user_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(
            MessageType::PeerJoined,
            &JoinPayload {
                doc_id: doc_id.to_string(),
                user_id: user_id.to_string(),
                since_revision: None,
            },
        )
    }

    pub fn peer_left(doc_id: &str, user_id: &str) -> Result<Self, ProtocolError> {
        Self::typed(
            MessageType::PeerLeft,
            &JoinPayload {
                doc_id: doc_id.to_string(),
                user_id: user_id.to_string(),
                since_revision: None,
            },
        )
    }

    pub fn ping() -> Self {
        Self::empty(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::empty(MessageType::Pong)
    }

    /// Error envelope; never fails to build.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::String(code.to_string()));
        payload.insert("message".to_string(), Value::String(message.into()));
        Self {
            version: CURRENT_VERSION,
            msg_type: MessageType::Error.as_str().to_string(),
            payload: Value::Object(payload),
        }
    }

    fn empty(msg_type: MessageType) -> Self {
        Self {
            version: CURRENT_VERSION,
            msg_type: msg_type.as_str().to_string(),
            payload: Value::Object(Map::new()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRef {
    pub doc_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub doc_id: String,
    pub user_id: String,
    /// Revision the client already holds, on reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_revision: Option<u64>,
}

/// Client submission: an operation computed against `base_revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    pub doc_id: String,
    #[serde(default)]
    pub base_revision: u64,
    pub operation: Operation,
}

/// [`OperationPayload`] with the operation still in wire form.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperationPayload {
    doc_id: String,
    #[serde(default)]
    base_revision: u64,
    operation: WireOperation,
}

/// Operations as accepted by the server. Used for `ack` to the sender and
/// `operation` fan-out to everyone else. A catch-up after a rejoin uses the
/// same shape with an empty `user_id`; each operation names its author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPayload {
    pub doc_id: String,
    /// Document revision after the last of `operations`.
    pub revision: u64,
    pub user_id: String,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePayload {
    pub doc_id: String,
    pub state: State,
    pub clock: FieldClock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub doc_id: String,
    /// Filled in by the server from the connection's identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_message_stamps_version() {
        let env = create_message("custom", &json!({"a": 1})).unwrap();
        assert_eq!(env.version, CURRENT_VERSION);
        assert_eq!(env.msg_type, "custom");
        assert_eq!(env.payload["a"], 1);
        assert!(env.kind().is_none());
    }

    #[test]
    fn test_parse_tolerates_version_mismatch() {
        let env = parse_message(r#"{"version": 99, "type": "ping", "payload": {}}"#).unwrap();
        assert_eq!(env.version, 99);
        assert!(!env.is_current_version());
        assert_eq!(env.kind(), Some(MessageType::Ping));

        let env = parse_message(r#"{"type": "pong"}"#).unwrap();
        assert_eq!(env.version, 0);
        assert!(env.payload.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(parse_message("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_message("[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse_message(r#"{"version": 1, "payload": {}}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(parse_message(r#"{"type": 5}"#), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_operation_envelope_wire_shape() {
        let env = Envelope::operation("doc", 3, Operation::insert(2, "hi").by("alice").at(7)).unwrap();
        let wire: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "version": 1,
                "type": "operation",
                "payload": {
                    "docId": "doc",
                    "baseRevision": 3,
                    "operation": {"type": "insert", "position": 2, "content": "hi", "userId": "alice", "timestamp": 7}
                }
            })
        );
    }

    #[test]
    fn test_payload_as_reports_invalid_operation() {
        let env = parse_message(
            r#"{"version":1,"type":"operation","payload":{"docId":"d","operation":{"type":"explode","position":0}}}"#,
        )
        .unwrap();
        match env.payload_as::<OperationPayload>() {
            Err(ProtocolError::InvalidPayload { reason, .. }) => assert!(reason.contains("unknown operation type")),
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn test_operation_payload_keeps_validation_codes() {
        let decode = |operation: Value| {
            let env = create_message("operation", &json!({"docId": "d", "baseRevision": 2, "operation": operation}))
                .unwrap();
            env.operation_payload().map_err(|e| e.code())
        };

        let ok = decode(json!({"type": "insert", "position": 1, "content": "x"})).unwrap();
        assert_eq!((ok.base_revision, ok.operation.position), (2, 1));
        assert_eq!(decode(json!({"type": "insert", "position": -1, "content": "x"})).unwrap_err(), "negative_value");
        assert_eq!(decode(json!({"type": "explode", "position": 0})).unwrap_err(), "unknown_operation_type");
        assert_eq!(decode(json!({"type": "delete", "position": 0})).unwrap_err(), "missing_field");
        assert_eq!(decode(json!({"type": "insert", "position": "zero"})).unwrap_err(), "protocol_error");
    }

    #[test]
    fn test_rejoin_carries_since_revision() {
        let join: JoinPayload = Envelope::join("d", "alice").unwrap().payload_as().unwrap();
        assert_eq!(join.since_revision, None);

        let env = Envelope::rejoin("d", "alice", Some(12)).unwrap();
        assert_eq!(env.payload["sinceRevision"], 12);
        let join: JoinPayload = env.payload_as().unwrap();
        assert_eq!(join.since_revision, Some(12));
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error("capacity_exceeded", "full");
        let payload: ErrorPayload = env.payload_as().unwrap();
        assert_eq!(payload.code, "capacity_exceeded");
        assert_eq!(env.kind(), Some(MessageType::Error));
    }

    #[test]
    fn test_message_type_names_round_trip() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
    }
}
