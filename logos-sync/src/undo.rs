//! Per-user undo/redo history.
//!
//! Each user owns two independent stacks. Operations from different users
//! may arrive interleaved, but undoing for one user never looks at another
//! user's entries.
//!
//! Entries are whole [`Edit`]s: everything one submission applied, tagged
//! with the revision it produced. The hub rebases an edit's inverse over
//! whatever landed after that revision before applying it.

use std::collections::HashMap;

use crate::operation::Operation;

/// Default number of undo entries kept per user.
pub const DEFAULT_UNDO_DEPTH: usize = 500;

/// Operations applied as one unit, and the document revision after them.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub ops: Vec<Operation>,
    pub revision: u64,
}

impl Edit {
    pub fn new(ops: Vec<Operation>, revision: u64) -> Self {
        Self { ops, revision }
    }

    /// Operations that revert this edit when applied at `revision`, last
    /// applied first.
    pub fn inverse(&self) -> Vec<Operation> {
        self.ops.iter().rev().map(Operation::inverse).collect()
    }
}

#[derive(Debug, Default, Clone)]
struct History {
    undo: Vec<Edit>,
    redo: Vec<Edit>,
}

/// Undo/redo stacks keyed by user id.
#[derive(Debug, Clone)]
pub struct UndoManager {
    histories: HashMap<String, History>,
    max_depth: usize,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

impl UndoManager {
    /// `max_depth` caps each user's undo stack; the oldest entries go first.
    pub fn new(max_depth: usize) -> Self {
        Self {
            histories: HashMap::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Record a fresh edit. Clears this user's redo stack only.
    pub fn record(&mut self, user_id: &str, edit: Edit) {
        self.push_undo(user_id, edit);
        if let Some(history) = self.histories.get_mut(user_id) {
            history.redo.clear();
        }
    }

    /// Record a single operation applied at `revision`.
    pub fn push(&mut self, user_id: &str, op: Operation, revision: u64) {
        self.record(user_id, Edit::new(vec![op], revision));
    }

    /// Pop the user's latest edit and return its inverse, moving the
    /// inverse onto the redo stack as if applied at the same revision.
    ///
    /// Only valid when nothing else was applied since; the hub uses
    /// [`take_undo`](Self::take_undo) and rebases instead.
    pub fn undo(&mut self, user_id: &str) -> Option<Vec<Operation>> {
        let edit = self.take_undo(user_id)?;
        let inverse = edit.inverse();
        self.push_redo(user_id, Edit::new(inverse.clone(), edit.revision));
        Some(inverse)
    }

    /// Pop the user's latest undone edit and return the operations that
    /// reapply it.
    pub fn redo(&mut self, user_id: &str) -> Option<Vec<Operation>> {
        let edit = self.take_redo(user_id)?;
        let reapply = edit.inverse();
        self.push_undo(user_id, Edit::new(reapply.clone(), edit.revision));
        Some(reapply)
    }

    pub fn take_undo(&mut self, user_id: &str) -> Option<Edit> {
        self.histories.get_mut(user_id)?.undo.pop()
    }

    pub fn take_redo(&mut self, user_id: &str) -> Option<Edit> {
        self.histories.get_mut(user_id)?.redo.pop()
    }

    /// Push onto the undo stack without touching redo.
    pub fn push_undo(&mut self, user_id: &str, edit: Edit) {
        let history = self.histories.entry(user_id.to_string()).or_default();
        history.undo.push(edit);
        if history.undo.len() > self.max_depth {
            let excess = history.undo.len() - self.max_depth;
            history.undo.drain(..excess);
        }
    }

    pub fn push_redo(&mut self, user_id: &str, edit: Edit) {
        self.histories.entry(user_id.to_string()).or_default().redo.push(edit);
    }

    pub fn can_undo(&self, user_id: &str) -> bool {
        self.histories.get(user_id).is_some_and(|h| !h.undo.is_empty())
    }

    pub fn can_redo(&self, user_id: &str) -> bool {
        self.histories.get(user_id).is_some_and(|h| !h.redo.is_empty())
    }

    pub fn undo_depth(&self, user_id: &str) -> usize {
        self.histories.get(user_id).map_or(0, |h| h.undo.len())
    }

    pub fn redo_depth(&self, user_id: &str) -> usize {
        self.histories.get(user_id).map_or(0, |h| h.redo.len())
    }

    /// Drop everything recorded for `user_id`.
    pub fn clear_user(&mut self, user_id: &str) {
        self.histories.remove(user_id);
    }

    /// Drop every user's history.
    pub fn clear(&mut self) {
        self.histories.clear();
    }

    /// Number of users with any history.
    pub fn user_count(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_isolation_between_users() {
        let mut undo = UndoManager::default();
        let op_x = Operation::insert(0, "X").by("userA");
        let op_y = Operation::insert(1, "Y").by("userB");
        let op_z = Operation::insert(2, "Z").by("userA");

        undo.push("userA", op_x.clone(), 1);
        undo.push("userB", op_y.clone(), 2);
        undo.push("userA", op_z.clone(), 3);

        assert_eq!(undo.undo("userA"), Some(vec![op_z.inverse()]));
        assert_eq!(undo.undo("userB"), Some(vec![op_y.inverse()]));
        assert_eq!(undo.undo("userA"), Some(vec![op_x.inverse()]));
        assert_eq!(undo.undo("userA"), None);
    }

    #[test]
    fn test_undo_empty_returns_none() {
        let mut undo = UndoManager::default();
        assert_eq!(undo.undo("nobody"), None);
        assert_eq!(undo.redo("nobody"), None);
    }

    #[test]
    fn test_redo_round_trip() {
        let mut undo = UndoManager::default();
        let op = Operation::insert(0, "abc").by("u");
        undo.push("u", op.clone(), 1);

        let inverse = undo.undo("u").unwrap();
        assert!(inverse[0].is_delete());
        assert!(undo.can_redo("u"));

        assert_eq!(undo.redo("u"), Some(vec![op]));
        assert!(undo.can_undo("u"));
        assert!(!undo.can_redo("u"));
    }

    #[test]
    fn test_push_clears_only_own_redo() {
        let mut undo = UndoManager::default();
        undo.push("a", Operation::insert(0, "1"), 1);
        undo.push("b", Operation::insert(0, "2"), 2);
        undo.undo("a");
        undo.undo("b");

        undo.push("a", Operation::insert(0, "3"), 5);
        assert_eq!(undo.redo_depth("a"), 0);
        assert_eq!(undo.redo_depth("b"), 1);
    }

    #[test]
    fn test_depth_cap_drops_oldest() {
        let mut undo = UndoManager::new(2);
        for (rev, c) in ["a", "b", "c"].into_iter().enumerate() {
            undo.push("u", Operation::insert(0, c), rev as u64 + 1);
        }
        assert_eq!(undo.undo_depth("u"), 2);
        assert_eq!(undo.undo("u").unwrap()[0].content(), Some("c"));
        assert_eq!(undo.undo("u").unwrap()[0].content(), Some("b"));
        assert_eq!(undo.undo("u"), None);
    }

    #[test]
    fn test_split_edit_inverts_in_reverse_order() {
        // A delete split around a concurrent insert lands as two deletes.
        let mut first = Operation::delete(2, 3);
        first.kind = crate::operation::OpKind::Delete {
            length: 3,
            content: Some("cde".to_string()),
        };
        let mut second = Operation::delete(4, 2);
        second.kind = crate::operation::OpKind::Delete {
            length: 2,
            content: Some("gh".to_string()),
        };
        let edit = Edit::new(vec![first, second], 7);

        let inverse = edit.inverse();
        assert_eq!(inverse.len(), 2);
        assert_eq!((inverse[0].position, inverse[0].content()), (4, Some("gh")));
        assert_eq!((inverse[1].position, inverse[1].content()), (2, Some("cde")));
    }

    #[test]
    fn test_take_and_restore_keep_redo() {
        let mut undo = UndoManager::default();
        undo.push("u", Operation::insert(0, "a"), 1);
        undo.push("u", Operation::insert(1, "b"), 2);
        undo.undo("u");

        let edit = undo.take_undo("u").unwrap();
        assert_eq!(edit.revision, 1);
        undo.push_undo("u", edit);
        assert_eq!(undo.undo_depth("u"), 1);
        assert_eq!(undo.redo_depth("u"), 1);

        undo.clear();
        assert_eq!(undo.user_count(), 0);
    }
}
