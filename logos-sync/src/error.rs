//! Error taxonomy for the sync core.
//!
//! Validation and capacity errors are surfaced to clients as `error`
//! envelopes; transport errors stay local to the failing connection.

use thiserror::Error;
use uuid::Uuid;

/// An operation or request was rejected at the call boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),
    #[error("negative {field}: {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("{op} operation is missing required field '{field}'")]
    MissingField { op: &'static str, field: &'static str },
    #[error("delete of {length} at {position} extends past text length {text_len}")]
    OutOfBounds {
        position: usize,
        length: usize,
        text_len: usize,
    },
    #[error("document field '{field}' is not {expected}")]
    FieldType { field: String, expected: &'static str },
    #[error("base revision {base} is ahead of document revision {current}")]
    FutureRevision { base: u64, current: u64 },
    #[error("base revision {base} fell out of the operation log (oldest retained: {oldest})")]
    ResyncRequired { base: u64, oldest: u64 },
}

impl ValidationError {
    /// Stable machine-readable code used in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOperationType(_) => "unknown_operation_type",
            Self::Negative { .. } => "negative_value",
            Self::MissingField { .. } => "missing_field",
            Self::OutOfBounds { .. } => "out_of_bounds",
            Self::FieldType { .. } => "field_type",
            Self::FutureRevision { .. } => "future_revision",
            Self::ResyncRequired { .. } => "resync_required",
        }
    }
}

/// Wire envelope errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message is missing the 'type' field")]
    MissingType,
    #[error("invalid payload for '{msg_type}': {reason}")]
    InvalidPayload { msg_type: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("offline queue is full ({0} operations)")]
    QueueFull(usize),
}

/// Transport-level delivery failure for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Connection and room manager errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection limit reached ({max} connections)")]
    CapacityExceeded { max: usize },
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
    #[error("connection {0} has not joined as a user")]
    NotJoined(Uuid),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot checkpoint errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot encode failed: {0}")]
    Encode(String),
    #[error("snapshot decode failed: {0}")]
    Decode(String),
    #[error("snapshot decompression failed: {0}")]
    Decompression(String),
}

/// Umbrella error for the message-dispatch layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Code reported to the client in an `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::Protocol(_) => "protocol_error",
            Self::Connection(ConnectionError::CapacityExceeded { .. }) => "capacity_exceeded",
            Self::Connection(ConnectionError::NotJoined(_)) => "not_joined",
            Self::Connection(_) => "connection_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
