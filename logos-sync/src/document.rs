//! CRDT document store.
//!
//! A document is a map of fields to JSON values plus a per-field logical
//! clock. The text body lives in the `"text"` field and format spans in
//! `"formats"`. Local edits go through [`apply_operation`]; replicas that
//! fell behind converge through [`merge_states`], never through log replay.
//!
//! ```text
//!   Operation ──► apply_operation ──► new State ──► OperationLog (FIFO, capped)
//!                                          │
//!   (remote State, FieldClock) ──► merge_states ──► merged State + clock
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{merge_value, pick_winner, FieldClock, Winner};
use crate::error::ValidationError;
use crate::operation::{byte_offset, char_len, char_slice, Attributes, OpKind, Operation};

pub const TEXT_FIELD: &str = "text";
pub const FORMATS_FIELD: &str = "formats";
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Field map of a document.
pub type State = Map<String, Value>;

/// A formatting run over `[position, position + length)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSpan {
    pub position: usize,
    pub length: usize,
    pub format: Attributes,
}

impl FormatSpan {
    fn covers(&self, position: usize, length: usize) -> bool {
        self.position <= position && self.position + self.length >= position + length
    }
}

/// What applying an operation did, with enough detail to build an inverse.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Inserted { position: usize, length: usize },
    Deleted { position: usize, removed: String },
    Formatted { position: usize, length: usize, previous: Attributes },
}

/// New state plus the result descriptor.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: State,
    pub result: ApplyResult,
}

impl Applied {
    /// The operation as it actually took effect: clamped positions, removed
    /// text and prior attributes filled in.
    pub fn recorded(&self, op: &Operation) -> Operation {
        let (position, kind) = match (&self.result, &op.kind) {
            (ApplyResult::Inserted { position, .. }, kind) => (*position, kind.clone()),
            (ApplyResult::Deleted { position, removed }, _) => (
                *position,
                OpKind::Delete {
                    length: char_len(removed),
                    content: Some(removed.clone()),
                },
            ),
            (ApplyResult::Formatted { position, previous, .. }, OpKind::Format { length, attributes, .. }) => (
                *position,
                OpKind::Format {
                    length: *length,
                    attributes: attributes.clone(),
                    previous: Some(previous.clone()),
                },
            ),
            (ApplyResult::Formatted { position, .. }, kind) => (*position, kind.clone()),
        };
        Operation {
            kind,
            position,
            ..op.clone()
        }
    }
}

fn text_of(state: &State) -> Result<&str, ValidationError> {
    match state.get(TEXT_FIELD) {
        None => Ok(""),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::FieldType {
            field: TEXT_FIELD.to_string(),
            expected: "a string",
        }),
    }
}

fn formats_of(state: &State) -> Result<Vec<FormatSpan>, ValidationError> {
    match state.get(FORMATS_FIELD) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| ValidationError::FieldType {
            field: FORMATS_FIELD.to_string(),
            expected: "a list of format spans",
        }),
    }
}

/// Apply `op` to `state`, returning a new state. The input is untouched.
///
/// Inserts clamp `position` to `[0, len(text)]`; deletes clamp both ends of
/// the range. Formats append a span to `"formats"`.
pub fn apply_operation(op: &Operation, state: &State) -> Result<Applied, ValidationError> {
    let mut next = state.clone();
    let text = text_of(state)?;
    let text_len = char_len(text);

    let result = match &op.kind {
        OpKind::Insert { content } => {
            let position = op.position.min(text_len);
            let at = byte_offset(text, position);
            let mut out = String::with_capacity(text.len() + content.len());
            out.push_str(&text[..at]);
            out.push_str(content);
            out.push_str(&text[at..]);
            next.insert(TEXT_FIELD.to_string(), Value::String(out));
            ApplyResult::Inserted {
                position,
                length: char_len(content),
            }
        }
        OpKind::Delete { length, .. } => {
            let start = op.position.min(text_len);
            let end = start.saturating_add(*length).min(text_len);
            let removed = char_slice(text, start, end).to_string();
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..byte_offset(text, start)]);
            out.push_str(&text[byte_offset(text, end)..]);
            next.insert(TEXT_FIELD.to_string(), Value::String(out));
            ApplyResult::Deleted {
                position: start,
                removed,
            }
        }
        OpKind::Format { length, attributes, .. } => {
            let mut spans = formats_of(state)?;
            let previous = effective_format(&spans, op.position, *length, attributes);
            spans.push(FormatSpan {
                position: op.position,
                length: *length,
                format: attributes.clone(),
            });
            let encoded = serde_json::to_value(&spans).map_err(|_| ValidationError::FieldType {
                field: FORMATS_FIELD.to_string(),
                expected: "a list of format spans",
            })?;
            next.insert(FORMATS_FIELD.to_string(), encoded);
            ApplyResult::Formatted {
                position: op.position,
                length: *length,
                previous,
            }
        }
    };

    Ok(Applied { state: next, result })
}

/// Attributes (restricted to `keys`) in effect on a range, folding every
/// span that fully covers it in order. A `null` value clears the attribute.
fn effective_format(spans: &[FormatSpan], position: usize, length: usize, keys: &Attributes) -> Attributes {
    let mut out = Attributes::new();
    for span in spans.iter().filter(|s| s.covers(position, length)) {
        for (key, value) in &span.format {
            if !keys.contains_key(key) {
                continue;
            }
            if value.is_null() {
                out.remove(key);
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Result of merging a remote snapshot into local state.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub state: State,
    pub clock: FieldClock,
    /// Fields where the remote value won.
    pub changed: Vec<String>,
}

/// Field-level last-writer-wins merge keyed on logical clocks.
///
/// A strictly greater remote clock wins; equal clocks keep local. Object
/// values merge key by key (see [`merge_value`]). A field whose clock the
/// remote dominates but whose value it omits is removed. Inputs are not
/// mutated.
pub fn merge_states(local_state: &State, local_clock: &FieldClock, remote_state: &State, remote_clock: &FieldClock) -> Merged {
    let mut state = State::new();
    for (key, value) in local_state {
        state.insert(key.clone(), value.clone());
    }
    let mut changed = Vec::new();

    for field in local_clock.fields_with(remote_clock) {
        if pick_winner(local_clock.get(field), remote_clock.get(field)) == Winner::Local {
            continue;
        }
        match (local_state.get(field), remote_state.get(field)) {
            (Some(local), Some(remote)) => {
                state.insert(field.to_string(), merge_value(local, remote));
            }
            (None, Some(remote)) => {
                state.insert(field.to_string(), remote.clone());
            }
            (_, None) => {
                state.remove(field);
            }
        }
        changed.push(field.to_string());
    }

    Merged {
        state,
        clock: local_clock.merged(remote_clock),
        changed,
    }
}

/// An applied operation and the revision it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub revision: u64,
    pub op: Operation,
}

/// Bounded operation log; the oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct OperationLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, revision: u64, op: Operation) {
        self.entries.push_back(LogEntry { revision, op });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Operations applied after `base`, oldest first.
    ///
    /// Fails if `base` is newer than `current` or if some of the needed
    /// entries have already been evicted.
    pub fn since(&self, base: u64, current: u64) -> Result<Vec<Operation>, ValidationError> {
        if base > current {
            return Err(ValidationError::FutureRevision { base, current });
        }
        if base == current {
            return Ok(Vec::new());
        }
        let oldest = self.entries.front().map_or(current + 1, |e| e.revision);
        if base + 1 < oldest {
            return Err(ValidationError::ResyncRequired { base, oldest });
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| e.revision > base)
            .map(|e| e.op.clone())
            .collect())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

/// Full-state checkpoint handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub doc_id: String,
    pub state: State,
    pub clock: FieldClock,
    pub version: u64,
}

/// A live document.
#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    state: State,
    clock: FieldClock,
    log: OperationLog,
    revision: u64,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_log_capacity(id, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            state: State::new(),
            clock: FieldClock::new(),
            log: OperationLog::new(capacity),
            revision: 0,
        }
    }

    /// Restore from a checkpoint. The log starts empty at the snapshot's version.
    pub fn from_snapshot(snapshot: DocumentSnapshot, capacity: usize) -> Self {
        let mut clock = snapshot.clock;
        for field in snapshot.state.keys() {
            clock.observe(field, 0);
        }
        Self {
            id: snapshot.doc_id,
            state: snapshot.state,
            clock,
            log: OperationLog::new(capacity),
            revision: snapshot.version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn clock(&self) -> &FieldClock {
        &self.clock
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn text(&self) -> &str {
        self.state.get(TEXT_FIELD).and_then(Value::as_str).unwrap_or("")
    }

    pub fn text_len(&self) -> usize {
        char_len(self.text())
    }

    pub fn formats(&self) -> Vec<FormatSpan> {
        formats_of(&self.state).unwrap_or_default()
    }

    /// Apply a local operation, tick the touched field's clock and append
    /// the recorded form of the operation to the log.
    pub fn apply(&mut self, op: &Operation) -> Result<Operation, ValidationError> {
        let applied = apply_operation(op, &self.state)?;
        let recorded = applied.recorded(op);
        let field = if recorded.is_format() { FORMATS_FIELD } else { TEXT_FIELD };

        self.state = applied.state;
        self.clock.tick(field);
        self.revision += 1;
        self.log.push(self.revision, recorded.clone());
        Ok(recorded)
    }

    /// Write an arbitrary field locally.
    pub fn set_field(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        self.clock.tick(&field);
        self.state.insert(field, value);
    }

    /// Merge a remote snapshot into this document.
    ///
    /// If any field changed the revision advances and the log is cleared:
    /// positions in older operations no longer line up with the text, so
    /// peers holding an older base revision must resynchronize.
    pub fn merge(&mut self, remote_state: &State, remote_clock: &FieldClock) -> &State {
        let merged = merge_states(&self.state, &self.clock, remote_state, remote_clock);
        self.clock = merged.clock;
        if !merged.changed.is_empty() {
            log::debug!("Document {} merged remote fields {:?}", self.id, merged.changed);
            self.state = merged.state;
            self.revision += 1;
            self.log.clear();
        }
        &self.state
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            doc_id: self.id.clone(),
            state: self.state.clone(),
            clock: self.clock.clone(),
            version: self.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> State {
        value.as_object().cloned().unwrap()
    }

    fn clock(pairs: &[(&str, u64)]) -> FieldClock {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_insert_then_delete_round_trip() {
        let s = state(json!({"text": "Hello World"}));
        let inserted = apply_operation(&Operation::insert(5, " Beautiful"), &s).unwrap();
        assert_eq!(inserted.state["text"], "Hello Beautiful World");

        let deleted = apply_operation(&Operation::delete(5, 10), &inserted.state).unwrap();
        assert_eq!(deleted.state["text"], "Hello World");
        assert_eq!(
            deleted.result,
            ApplyResult::Deleted {
                position: 5,
                removed: " Beautiful".to_string()
            }
        );
        // inputs untouched
        assert_eq!(s["text"], "Hello World");
        assert_eq!(inserted.state["text"], "Hello Beautiful World");
    }

    #[test]
    fn test_insert_clamps_position() {
        let s = state(json!({"text": "abc"}));
        let applied = apply_operation(&Operation::insert(99, "!"), &s).unwrap();
        assert_eq!(applied.state["text"], "abc!");
        assert_eq!(applied.result, ApplyResult::Inserted { position: 3, length: 1 });
    }

    #[test]
    fn test_delete_clamps_range() {
        let s = state(json!({"text": "abcdef"}));
        let applied = apply_operation(&Operation::delete(4, 10), &s).unwrap();
        assert_eq!(applied.state["text"], "abcd");
        let recorded = applied.recorded(&Operation::delete(4, 10));
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded.content(), Some("ef"));
    }

    #[test]
    fn test_insert_into_missing_text() {
        let applied = apply_operation(&Operation::insert(0, "hi"), &State::new()).unwrap();
        assert_eq!(applied.state["text"], "hi");
    }

    #[test]
    fn test_non_string_text_rejected() {
        let s = state(json!({"text": 42}));
        assert!(matches!(
            apply_operation(&Operation::insert(0, "x"), &s),
            Err(ValidationError::FieldType { .. })
        ));
    }

    #[test]
    fn test_format_appends_span_and_reports_previous() {
        let s = state(json!({"text": "Hello World"}));
        let mut bold = Attributes::new();
        bold.insert("bold".into(), json!(true));
        let first = apply_operation(&Operation::format(0, 5, bold.clone()), &s).unwrap();
        assert_eq!(first.state["formats"].as_array().unwrap().len(), 1);

        let mut not_bold = Attributes::new();
        not_bold.insert("bold".into(), json!(false));
        let second = apply_operation(&Operation::format(1, 2, not_bold), &first.state).unwrap();
        match second.result {
            ApplyResult::Formatted { previous, .. } => assert_eq!(previous["bold"], json!(true)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(second.state["formats"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_merge_tie_break() {
        let local_state = state(json!({"title": "Hello", "text": "World"}));
        let local_clock = clock(&[("title", 5), ("text", 3)]);
        let remote_state = state(json!({"title": "Hi", "text": "Earth"}));
        let remote_clock = clock(&[("title", 5), ("text", 4)]);

        let merged = merge_states(&local_state, &local_clock, &remote_state, &remote_clock);
        assert_eq!(merged.state["title"], "Hello");
        assert_eq!(merged.state["text"], "Earth");
        assert_eq!(merged.clock.get("text"), 4);
        assert_eq!(merged.changed, vec!["text".to_string()]);
        assert_eq!(local_state["text"], "World");
    }

    #[test]
    fn test_merge_nested_preservation() {
        let local_state = state(json!({"properties": {"fill": "red", "stroke": "black", "nested": {"deep": "value"}}}));
        let remote_state = state(json!({"properties": {"fill": "blue"}}));
        let merged = merge_states(
            &local_state,
            &clock(&[("properties", 1)]),
            &remote_state,
            &clock(&[("properties", 2)]),
        );
        let props = &merged.state["properties"];
        assert_eq!(props["fill"], "blue");
        assert_eq!(props["stroke"], "black");
        assert_eq!(props["nested"]["deep"], "value");
    }

    #[test]
    fn test_merge_remote_only_field_and_removal() {
        let local_state = state(json!({"a": 1, "b": 2}));
        let remote_state = state(json!({"c": 3}));
        let merged = merge_states(
            &local_state,
            &clock(&[("a", 1), ("b", 1)]),
            &remote_state,
            &clock(&[("b", 2), ("c", 1)]),
        );
        assert_eq!(merged.state.get("a"), Some(&json!(1)));
        assert!(merged.state.get("b").is_none());
        assert_eq!(merged.state.get("c"), Some(&json!(3)));
    }

    #[test]
    fn test_merge_prototype_keys_are_data() {
        let remote_state = state(json!({"__proto__": {"admin": true}, "constructor": 1}));
        let merged = merge_states(
            &State::new(),
            &FieldClock::new(),
            &remote_state,
            &clock(&[("__proto__", 1), ("constructor", 1)]),
        );
        assert_eq!(merged.state["__proto__"]["admin"], true);
        assert_eq!(merged.state.len(), 2);
    }

    #[test]
    fn test_document_apply_ticks_clock_and_logs() {
        let mut doc = Document::new("doc-1");
        doc.apply(&Operation::insert(0, "Hello")).unwrap();
        doc.apply(&Operation::insert(5, " World")).unwrap();
        assert_eq!(doc.text(), "Hello World");
        assert_eq!(doc.revision(), 2);
        assert_eq!(doc.clock().get("text"), 2);
        assert_eq!(doc.log().len(), 2);
        for key in doc.state().keys() {
            assert!(doc.clock().contains(key));
        }
    }

    #[test]
    fn test_log_evicts_oldest_first() {
        let mut doc = Document::with_log_capacity("doc", 3);
        for i in 0..5 {
            doc.apply(&Operation::insert(i, "x")).unwrap();
        }
        let revisions: Vec<u64> = doc.log().iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![3, 4, 5]);
    }

    #[test]
    fn test_log_since() {
        let mut log = OperationLog::new(2);
        log.push(1, Operation::insert(0, "a"));
        log.push(2, Operation::insert(1, "b"));
        log.push(3, Operation::insert(2, "c"));
        assert_eq!(log.since(3, 3).unwrap().len(), 0);
        assert_eq!(log.since(2, 3).unwrap().len(), 1);
        assert_eq!(log.since(1, 3).unwrap().len(), 2);
        assert!(matches!(log.since(0, 3), Err(ValidationError::ResyncRequired { .. })));
        assert!(matches!(log.since(4, 3), Err(ValidationError::FutureRevision { .. })));
    }

    #[test]
    fn test_document_merge_clears_log_on_change() {
        let mut doc = Document::new("doc");
        doc.apply(&Operation::insert(0, "abc")).unwrap();
        let remote_state = state(json!({"text": "xyz"}));
        doc.merge(&remote_state, &clock(&[("text", 9)]));
        assert_eq!(doc.text(), "xyz");
        assert_eq!(doc.revision(), 2);
        assert!(doc.log().is_empty());
        assert_eq!(doc.clock().get("text"), 9);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut doc = Document::new("doc");
        doc.apply(&Operation::insert(0, "abc")).unwrap();
        doc.set_field("title", json!("T"));
        let restored = Document::from_snapshot(doc.snapshot(), 10);
        assert_eq!(restored.text(), "abc");
        assert_eq!(restored.revision(), 1);
        assert_eq!(restored.clock().get("title"), 1);
    }
}
