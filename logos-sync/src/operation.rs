//! Text operations exchanged between peers.
//!
//! On the wire an operation is a flat JSON object:
//!
//! ```text
//! { "type": "insert" | "delete" | "format",
//!   "position": 5, "content": " Beautiful", "length": 10,
//!   "format": { "bold": true }, "userId": "alice",
//!   "priority": 1.0, "timestamp": 1718000000000 }
//! ```
//!
//! Decoding goes through [`WireOperation`], which rejects unknown types,
//! negative numbers and missing required fields. Past that boundary the
//! operation is a closed enum and every match is exhaustive.
//!
//! Positions and lengths count `char`s, not bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

pub type Attributes = Map<String, Value>;

/// What an operation does.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Insert {
        content: String,
    },
    Delete {
        length: usize,
        /// Removed text, filled in from the apply result so undo can restore it.
        content: Option<String>,
    },
    Format {
        length: usize,
        attributes: Attributes,
        /// Attributes in effect on the range before this format was applied.
        previous: Option<Attributes>,
    },
}

/// A single edit, immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Operation {
    pub kind: OpKind,
    pub position: usize,
    pub user_id: Option<String>,
    /// Tie-break key for concurrent inserts at the same position; higher wins.
    pub priority: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `char_idx`-th char, clamped to the end of `s`.
pub(crate) fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map_or(s.len(), |(i, _)| i)
}

/// Chars `[start, end)` of `s`, clamped.
pub(crate) fn char_slice(s: &str, start: usize, end: usize) -> &str {
    let from = byte_offset(s, start);
    let to = byte_offset(s, end.max(start));
    &s[from..to]
}

impl Operation {
    fn with_kind(kind: OpKind, position: usize) -> Self {
        Self {
            kind,
            position,
            user_id: None,
            priority: None,
            timestamp: now_millis(),
        }
    }

    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self::with_kind(OpKind::Insert { content: content.into() }, position)
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::with_kind(OpKind::Delete { length, content: None }, position)
    }

    pub fn format(position: usize, length: usize, attributes: Attributes) -> Self {
        Self::with_kind(
            OpKind::Format {
                length,
                attributes,
                previous: None,
            },
            position,
        )
    }

    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Wire name of the operation type.
    pub fn op_type(&self) -> &'static str {
        match self.kind {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Format { .. } => "format",
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete { .. })
    }

    pub fn is_format(&self) -> bool {
        matches!(self.kind, OpKind::Format { .. })
    }

    /// Inserted text for inserts, captured text for deletes.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Insert { content } => Some(content),
            OpKind::Delete { content, .. } => content.as_deref(),
            OpKind::Format { .. } => None,
        }
    }

    /// Number of chars the operation covers (inserted or removed/formatted).
    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { content } => char_len(content),
            OpKind::Delete { length, .. } | OpKind::Format { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `position + len`, the exclusive end of the covered range.
    pub fn end(&self) -> usize {
        self.position + self.len()
    }

    /// Copy with a new position, keeping every other field.
    pub fn moved_to(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// Reject a delete that would run past the current text.
    ///
    /// Clamping is only done inside `apply_operation`; callers that accept
    /// operations from peers validate first.
    pub fn validate_against(&self, text_len: usize) -> Result<(), ValidationError> {
        match &self.kind {
            OpKind::Delete { length, .. } if self.position + length > text_len => Err(ValidationError::OutOfBounds {
                position: self.position,
                length: *length,
                text_len,
            }),
            _ => Ok(()),
        }
    }

    /// The operation that undoes this one.
    ///
    /// Inserts invert to deletes of the same span and vice versa. A delete
    /// without captured content inverts to an empty insert. Formats invert
    /// to a format that restores `previous`, with `null` for attributes that
    /// were not set before. Metadata is carried over unchanged.
    pub fn inverse(&self) -> Operation {
        let kind = match &self.kind {
            OpKind::Insert { content } => OpKind::Delete {
                length: char_len(content),
                content: Some(content.clone()),
            },
            OpKind::Delete { content, .. } => OpKind::Insert {
                content: content.clone().unwrap_or_default(),
            },
            OpKind::Format {
                length,
                attributes,
                previous,
            } => {
                let previous = previous.clone().unwrap_or_default();
                let restored = attributes
                    .keys()
                    .map(|k| (k.clone(), previous.get(k).cloned().unwrap_or(Value::Null)))
                    .collect();
                OpKind::Format {
                    length: *length,
                    attributes: restored,
                    previous: Some(attributes.clone()),
                }
            }
        };
        Operation {
            kind,
            position: self.position,
            user_id: self.user_id.clone(),
            priority: self.priority,
            timestamp: self.timestamp,
        }
    }
}

/// Flat wire shape of an [`Operation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default)]
    pub timestamp: u64,
}

fn non_negative(field: &'static str, value: i64) -> Result<usize, ValidationError> {
    usize::try_from(value).map_err(|_| ValidationError::Negative { field, value })
}

impl TryFrom<WireOperation> for Operation {
    type Error = ValidationError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let position = non_negative("position", wire.position)?;
        let length = wire.length.map(|l| non_negative("length", l)).transpose()?;

        let kind = match wire.op_type.as_str() {
            "insert" => OpKind::Insert {
                content: wire.content.ok_or(ValidationError::MissingField {
                    op: "insert",
                    field: "content",
                })?,
            },
            "delete" => {
                let length = length.ok_or(ValidationError::MissingField {
                    op: "delete",
                    field: "length",
                })?;
                OpKind::Delete {
                    length,
                    content: wire.content,
                }
            }
            "format" => OpKind::Format {
                length: length.ok_or(ValidationError::MissingField {
                    op: "format",
                    field: "length",
                })?,
                attributes: wire.format.ok_or(ValidationError::MissingField {
                    op: "format",
                    field: "format",
                })?,
                previous: wire.previous,
            },
            other => return Err(ValidationError::UnknownOperationType(other.to_string())),
        };

        Ok(Operation {
            kind,
            position,
            user_id: wire.user_id,
            priority: wire.priority,
            timestamp: wire.timestamp,
        })
    }
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        let op_type = op.op_type().to_string();
        let (content, length, format, previous) = match op.kind {
            OpKind::Insert { content } => (Some(content), None, None, None),
            OpKind::Delete { length, content } => (content, Some(length as i64), None, None),
            OpKind::Format {
                length,
                attributes,
                previous,
            } => (None, Some(length as i64), Some(attributes), previous),
        };
        WireOperation {
            op_type,
            position: op.position as i64,
            content,
            length,
            format,
            previous,
            user_id: op.user_id,
            priority: op.priority,
            timestamp: op.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Operation, String> {
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    #[test]
    fn test_parse_insert() {
        let op = parse(json!({"type": "insert", "position": 5, "content": "abc", "userId": "alice"})).unwrap();
        assert_eq!(op.position, 5);
        assert_eq!(op.content(), Some("abc"));
        assert_eq!(op.user_id.as_deref(), Some("alice"));
        assert!(op.is_insert());
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = parse(json!({"type": "bold", "position": 0})).unwrap_err();
        assert!(err.contains("unknown operation type"), "{err}");
    }

    #[test]
    fn test_parse_rejects_negative_position() {
        let err = parse(json!({"type": "insert", "position": -1, "content": "x"})).unwrap_err();
        assert!(err.contains("negative position"), "{err}");
    }

    #[test]
    fn test_parse_rejects_negative_length() {
        let err = parse(json!({"type": "delete", "position": 0, "length": -3})).unwrap_err();
        assert!(err.contains("negative length"), "{err}");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(parse(json!({"type": "insert", "position": 0})).is_err());
        assert!(parse(json!({"type": "delete", "position": 0})).is_err());
        assert!(parse(json!({"type": "format", "position": 0, "length": 2})).is_err());
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let op = Operation::delete(3, 2).by("bob").at(10);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"type": "delete", "position": 3, "length": 2, "userId": "bob", "timestamp": 10}));
    }

    #[test]
    fn test_validate_against_bounds() {
        assert!(Operation::delete(5, 6).validate_against(11).is_ok());
        assert_eq!(
            Operation::delete(5, 7).validate_against(11),
            Err(ValidationError::OutOfBounds {
                position: 5,
                length: 7,
                text_len: 11
            })
        );
        assert!(Operation::insert(40, "x").validate_against(11).is_ok());
    }

    #[test]
    fn test_inverse_insert_delete() {
        let ins = Operation::insert(5, " Beautiful").by("a");
        let inv = ins.inverse();
        assert!(inv.is_delete());
        assert_eq!(inv.position, 5);
        assert_eq!(inv.len(), 10);
        assert_eq!(inv.inverse().content(), Some(" Beautiful"));
    }

    #[test]
    fn test_inverse_format_restores_previous() {
        let mut attrs = Attributes::new();
        attrs.insert("bold".into(), json!(true));
        attrs.insert("color".into(), json!("red"));
        let mut previous = Attributes::new();
        previous.insert("color".into(), json!("blue"));
        let op = Operation {
            kind: OpKind::Format {
                length: 4,
                attributes: attrs,
                previous: Some(previous),
            },
            ..Operation::insert(2, "")
        };
        match op.inverse().kind {
            OpKind::Format { attributes, .. } => {
                assert_eq!(attributes["color"], json!("blue"));
                assert!(attributes["bold"].is_null());
            }
            other => panic!("expected format, got {other:?}"),
        }
    }

    #[test]
    fn test_char_helpers_multibyte() {
        let s = "héllo wörld";
        assert_eq!(char_len(s), 11);
        assert_eq!(char_slice(s, 1, 5), "éllo");
        assert_eq!(byte_offset(s, 100), s.len());
    }
}
