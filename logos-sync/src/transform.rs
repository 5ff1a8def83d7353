//! Operational transform over text operations.
//!
//! `transform(a, b)` takes two operations computed against the same base
//! text and returns `(a', b')` such that applying `a` then `b'` yields the
//! same text as applying `b` then `a'`.
//!
//! Results are sequences: an insert that lands strictly inside a concurrent
//! delete survives at the delete's start, and the delete is split around it
//! into two deletes (right part first) so both orders converge. Every other
//! case yields exactly one operation.
//!
//! Precondition: both inputs really are concurrent. The engine cannot detect
//! misuse; transforming causally ordered operations gives garbage.

use std::cmp::Ordering;

use crate::operation::{char_len, char_slice, OpKind, Operation};

/// Transform two concurrent operations. `a` counts as the earlier arrival
/// when nothing else breaks an insert/insert tie.
pub fn transform(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    let a_wins = insert_tie_winner(a, b) == Ordering::Less;
    (include(a, b, a_wins), include(b, a, !a_wins))
}

/// Lift [`transform`] to sequences: `xs` and `ys` each apply in order to the
/// same base. Returns `(xs', ys')` where `xs'` applies after `ys` and `ys'`
/// after `xs`. `xs` wins arrival-order ties.
pub fn transform_sequences(xs: &[Operation], ys: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    match (xs, ys) {
        ([], _) => (Vec::new(), ys.to_vec()),
        (_, []) => (xs.to_vec(), Vec::new()),
        ([x], [y]) => transform(x, y),
        ([x, rest @ ..], _) if !rest.is_empty() => {
            let (x_prime, ys_after_x) = transform_sequences(std::slice::from_ref(x), ys);
            let (rest_prime, ys_after_all) = transform_sequences(rest, &ys_after_x);
            let mut out = x_prime;
            out.extend(rest_prime);
            (out, ys_after_all)
        }
        (_, [y, rest @ ..]) => {
            let (xs_after_y, y_prime) = transform_sequences(xs, std::slice::from_ref(y));
            let (xs_after_all, rest_prime) = transform_sequences(&xs_after_y, rest);
            let mut out = y_prime;
            out.extend(rest_prime);
            (xs_after_all, out)
        }
    }
}

/// Ordering key for inserts at the same position. `Less` means `a` goes
/// first: higher priority, then smaller user id, then arrival order.
fn insert_tie_winner(a: &Operation, b: &Operation) -> Ordering {
    let pa = a.priority.unwrap_or(0.0);
    let pb = b.priority.unwrap_or(0.0);
    match pb.total_cmp(&pa) {
        Ordering::Equal => {}
        other => return other,
    }
    if let (Some(ua), Some(ub)) = (&a.user_id, &b.user_id) {
        match ua.cmp(ub) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Less
}

/// Rewrite `op` so it applies after `other` has been applied.
fn include(op: &Operation, other: &Operation, op_wins_tie: bool) -> Vec<Operation> {
    match (&op.kind, &other.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { content }) => {
            let shift = other.position < op.position || (other.position == op.position && !op_wins_tie);
            if shift {
                vec![op.moved_to(op.position + char_len(content))]
            } else {
                vec![op.clone()]
            }
        }
        (OpKind::Insert { .. }, OpKind::Delete { length, .. }) => {
            let (start, end) = (other.position, other.position + length);
            if op.position <= start {
                vec![op.clone()]
            } else if op.position >= end {
                vec![op.moved_to(op.position - length)]
            } else {
                vec![op.moved_to(start)]
            }
        }
        (OpKind::Delete { length, content }, OpKind::Insert { content: inserted }) => {
            let at = other.position;
            let shift = char_len(inserted);
            let end = op.position + length;
            if at <= op.position {
                vec![op.moved_to(op.position + shift)]
            } else if at >= end {
                vec![op.clone()]
            } else {
                split_delete(op, *length, content.as_deref(), at, shift)
            }
        }
        (OpKind::Delete { length, content }, OpKind::Delete { length: other_len, .. }) => {
            let (position, new_len, cut) = shrink_range(op.position, *length, other.position, *other_len);
            let content = content.as_deref().map(|c| remove_chars(c, cut));
            vec![Operation {
                kind: OpKind::Delete {
                    length: new_len,
                    content,
                },
                position,
                ..op.clone()
            }]
        }
        (OpKind::Format { length, attributes, previous }, OpKind::Insert { content }) => {
            let at = other.position;
            let shift = char_len(content);
            if at <= op.position {
                vec![op.moved_to(op.position + shift)]
            } else if at >= op.position + length {
                vec![op.clone()]
            } else {
                vec![Operation {
                    kind: OpKind::Format {
                        length: length + shift,
                        attributes: attributes.clone(),
                        previous: previous.clone(),
                    },
                    ..op.clone()
                }]
            }
        }
        (OpKind::Format { length, attributes, previous }, OpKind::Delete { length: other_len, .. }) => {
            let (position, new_len, _) = shrink_range(op.position, *length, other.position, *other_len);
            vec![Operation {
                kind: OpKind::Format {
                    length: new_len,
                    attributes: attributes.clone(),
                    previous: previous.clone(),
                },
                position,
                ..op.clone()
            }]
        }
        (_, OpKind::Format { .. }) => vec![op.clone()],
    }
}

/// Range `[pos, pos + len)` after `[other_pos, other_pos + other_len)` was
/// removed. Returns the new position, the new length, and the overlap as
/// offsets relative to `pos`.
fn shrink_range(pos: usize, len: usize, other_pos: usize, other_len: usize) -> (usize, usize, (usize, usize)) {
    let end = pos + len;
    let other_end = other_pos + other_len;

    let overlap_start = pos.max(other_pos);
    let overlap_end = end.min(other_end);
    let overlap = overlap_end.saturating_sub(overlap_start);

    // Portion of the other range that sits before `pos`.
    let preceding = other_end.min(pos).saturating_sub(other_pos);

    let cut = if overlap > 0 {
        (overlap_start - pos, overlap_end - pos)
    } else {
        (0, 0)
    };
    (pos - preceding, len - overlap, cut)
}

fn remove_chars(s: &str, (from, to): (usize, usize)) -> String {
    let mut out = String::with_capacity(s.len());
    out.push_str(char_slice(s, 0, from));
    out.push_str(char_slice(s, to, char_len(s)));
    out
}

/// Split a delete around text inserted at `at` (strictly inside it).
fn split_delete(op: &Operation, length: usize, content: Option<&str>, at: usize, shift: usize) -> Vec<Operation> {
    let left_len = at - op.position;
    let right_len = length - left_len;
    let (left_content, right_content) = match content {
        Some(c) => (
            Some(char_slice(c, 0, left_len).to_string()),
            Some(char_slice(c, left_len, char_len(c)).to_string()),
        ),
        None => (None, None),
    };
    vec![
        Operation {
            kind: OpKind::Delete {
                length: right_len,
                content: right_content,
            },
            position: at + shift,
            ..op.clone()
        },
        Operation {
            kind: OpKind::Delete {
                length: left_len,
                content: left_content,
            },
            position: op.position,
            ..op.clone()
        },
    ]
}

enum Step {
    Combined(Operation),
    Cancelled,
    Separate,
}

/// Shorten a sequence without changing its effect.
///
/// Same-user inserts that land inside or right after the previous insert
/// collapse into one; same-user adjacent deletes (forward or backspace)
/// collapse into one; an insert immediately deleted in full disappears.
/// Everything else, formats included, is kept in its original order.
pub fn compose(ops: &[Operation]) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        let step = match out.last() {
            Some(prev) => combine(prev, op),
            None => Step::Separate,
        };
        match step {
            Step::Combined(merged) => {
                out.pop();
                out.push(merged);
            }
            Step::Cancelled => {
                out.pop();
            }
            Step::Separate => out.push(op.clone()),
        }
    }
    out
}

fn combine(prev: &Operation, next: &Operation) -> Step {
    if prev.user_id != next.user_id {
        return Step::Separate;
    }
    match (&prev.kind, &next.kind) {
        (OpKind::Insert { content: first }, OpKind::Insert { content: second })
            if next.position >= prev.position && next.position <= prev.end() =>
        {
            let offset = next.position - prev.position;
            let mut content = String::with_capacity(first.len() + second.len());
            content.push_str(char_slice(first, 0, offset));
            content.push_str(second);
            content.push_str(char_slice(first, offset, char_len(first)));
            Step::Combined(Operation {
                kind: OpKind::Insert { content },
                timestamp: next.timestamp,
                ..prev.clone()
            })
        }
        (OpKind::Insert { .. }, OpKind::Delete { length, .. })
            if next.position == prev.position && *length == prev.len() =>
        {
            Step::Cancelled
        }
        (OpKind::Delete { length: first_len, content: first }, OpKind::Delete { length: second_len, content: second }) => {
            if next.position == prev.position {
                Step::Combined(merged_delete(prev, next, prev.position, *first_len + second_len, first, second))
            } else if next.position + second_len == prev.position {
                Step::Combined(merged_delete(prev, next, next.position, *first_len + second_len, second, first))
            } else {
                Step::Separate
            }
        }
        _ => Step::Separate,
    }
}

fn merged_delete(
    prev: &Operation,
    next: &Operation,
    position: usize,
    length: usize,
    left: &Option<String>,
    right: &Option<String>,
) -> Operation {
    let content = match (left, right) {
        (Some(l), Some(r)) => Some(format!("{l}{r}")),
        _ => None,
    };
    Operation {
        kind: OpKind::Delete { length, content },
        position,
        timestamp: next.timestamp,
        ..prev.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{apply_operation, State};
    use crate::operation::Attributes;
    use serde_json::{json, Value};

    fn run(text: &str, ops: &[Operation]) -> String {
        let mut state = State::new();
        state.insert("text".into(), Value::String(text.to_string()));
        for op in ops {
            state = apply_operation(op, &state).unwrap().state;
        }
        state["text"].as_str().unwrap().to_string()
    }

    fn assert_converges(base: &str, a: Operation, b: Operation) -> String {
        let (a_prime, b_prime) = transform(&a, &b);
        let mut left = vec![a.clone()];
        left.extend(b_prime);
        let mut right = vec![b.clone()];
        right.extend(a_prime);
        let l = run(base, &left);
        let r = run(base, &right);
        assert_eq!(l, r, "diverged for {a:?} / {b:?}");
        l
    }

    #[test]
    fn test_insert_insert_same_position_arrival_order() {
        let a = Operation::insert(0, "Hello");
        let b = Operation::insert(0, "World");
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime[0].position, 0);
        assert_eq!(b_prime[0].position, 5);
        assert_eq!(assert_converges("", a, b), "HelloWorld");
    }

    #[test]
    fn test_insert_insert_priority_wins() {
        let a = Operation::insert(0, "aa").with_priority(1.0);
        let b = Operation::insert(0, "bb").with_priority(5.0);
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime[0].position, 2);
        assert_eq!(b_prime[0].position, 0);
        assert_eq!(assert_converges("xy", a, b), "bbaaxy");
    }

    #[test]
    fn test_insert_insert_user_id_breaks_tie() {
        let a = Operation::insert(1, "A").by("zed");
        let b = Operation::insert(1, "B").by("amy");
        assert_eq!(assert_converges("xy", a.clone(), b.clone()), "xBAy");
        // same result whichever replica calls first
        assert_eq!(assert_converges("xy", b, a), "xBAy");
    }

    #[test]
    fn test_insert_insert_different_positions() {
        let a = Operation::insert(1, "123");
        let b = Operation::insert(4, "!");
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime[0].position, 1);
        assert_eq!(b_prime[0].position, 7);
        assert_converges("abcdef", a, b);
    }

    #[test]
    fn test_insert_before_delete_shifts_delete() {
        let ins = Operation::insert(1, "XY");
        let del = Operation::delete(3, 2);
        let (_, del_prime) = transform(&ins, &del);
        assert_eq!(del_prime[0].position, 5);
        assert_eq!(assert_converges("abcdefg", ins, del), "aXYbcfg");
    }

    #[test]
    fn test_insert_after_delete_shifts_insert() {
        let ins = Operation::insert(6, "!");
        let del = Operation::delete(1, 3);
        let (ins_prime, _) = transform(&ins, &del);
        assert_eq!(ins_prime[0].position, 3);
        assert_eq!(assert_converges("abcdefg", ins, del), "aef!g");
    }

    #[test]
    fn test_insert_inside_delete_is_preserved() {
        let ins = Operation::insert(3, "XY");
        let del = Operation::delete(1, 4);
        let (ins_prime, del_prime) = transform(&ins, &del);
        assert_eq!(ins_prime[0].position, 1);
        let covered: usize = del_prime.iter().map(Operation::len).sum();
        assert_eq!(covered, 4);
        assert_eq!(assert_converges("abcdefg", ins.clone(), del.clone()), "aXYfg");
        assert_eq!(assert_converges("abcdefg", del, ins), "aXYfg");
    }

    #[test]
    fn test_split_delete_keeps_captured_content() {
        let mut del = Operation::delete(1, 4);
        del.kind = OpKind::Delete {
            length: 4,
            content: Some("bcde".into()),
        };
        let ins = Operation::insert(3, "Z");
        let (_, del_prime) = transform(&ins, &del);
        let contents: Vec<_> = del_prime.iter().map(|o| o.content().unwrap().to_string()).collect();
        assert_eq!(contents, vec!["de".to_string(), "bc".to_string()]);
    }

    #[test]
    fn test_delete_delete_overlap() {
        let a = Operation::delete(2, 4); // cdef
        let b = Operation::delete(4, 4); // efgh
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!((b_prime[0].position, b_prime[0].len()), (2, 2));
        assert_eq!((a_prime[0].position, a_prime[0].len()), (2, 2));
        assert_eq!(assert_converges("abcdefghij", a, b), "abij");
    }

    #[test]
    fn test_delete_delete_contained_and_identical() {
        assert_eq!(
            assert_converges("abcdefghij", Operation::delete(1, 8), Operation::delete(3, 2)),
            "aj"
        );
        let (a_prime, _) = transform(&Operation::delete(2, 3), &Operation::delete(2, 3));
        assert_eq!(a_prime[0].len(), 0);
        assert_eq!(
            assert_converges("abcdefghij", Operation::delete(2, 3), Operation::delete(2, 3)),
            "abfghij"
        );
    }

    #[test]
    fn test_delete_delete_disjoint() {
        assert_eq!(
            assert_converges("abcdefghij", Operation::delete(0, 2), Operation::delete(5, 3)),
            "cdeij"
        );
    }

    #[test]
    fn test_format_range_follows_edits() {
        let mut bold = Attributes::new();
        bold.insert("bold".into(), json!(true));
        let fmt = Operation::format(2, 4, bold);
        let (fmt_after_ins, _) = transform(&fmt, &Operation::insert(3, "XX"));
        assert_eq!((fmt_after_ins[0].position, fmt_after_ins[0].len()), (2, 6));
        let (fmt_after_del, _) = transform(&fmt, &Operation::delete(0, 3));
        assert_eq!((fmt_after_del[0].position, fmt_after_del[0].len()), (0, 3));
        let (ins_after_fmt, _) = transform(&Operation::insert(3, "XX"), &fmt);
        assert_eq!(ins_after_fmt[0].position, 3);
    }

    #[test]
    fn test_transform_sequences_converges() {
        let base = "The quick brown fox";
        let xs = vec![Operation::insert(4, "very "), Operation::delete(0, 4)];
        let ys = vec![Operation::delete(10, 6), Operation::insert(10, "red ")];
        let (xs_prime, ys_prime) = transform_sequences(&xs, &ys);

        let mut left = xs.clone();
        left.extend(ys_prime);
        let mut right = ys.clone();
        right.extend(xs_prime);
        assert_eq!(run(base, &left), run(base, &right));
        assert_eq!(run(base, &left), "very quick red fox");
    }

    #[test]
    fn test_compose_never_drops_types() {
        let ops = vec![Operation::insert(0, "Hello"), Operation::delete(3, 2)];
        let composed = compose(&ops);
        assert!(composed.iter().any(|o| o.is_delete()));
        assert_eq!(run("", &composed), run("", &ops));
    }

    #[test]
    fn test_compose_merges_contiguous_inserts() {
        let ops = vec![
            Operation::insert(0, "He").by("u"),
            Operation::insert(2, "llo").by("u"),
            Operation::insert(5, "!").by("u"),
        ];
        let composed = compose(&ops);
        assert_eq!(composed.len(), 1);
        assert_eq!(composed[0].content(), Some("Hello!"));
    }

    #[test]
    fn test_compose_keeps_other_users_separate() {
        let ops = vec![Operation::insert(0, "a").by("u1"), Operation::insert(1, "b").by("u2")];
        assert_eq!(compose(&ops).len(), 2);
    }

    #[test]
    fn test_compose_full_cancel_and_formats() {
        let mut bold = Attributes::new();
        bold.insert("bold".into(), json!(true));
        let ops = vec![
            Operation::insert(3, "tmp"),
            Operation::delete(3, 3),
            Operation::format(0, 2, bold),
            Operation::insert(0, "x"),
        ];
        let composed = compose(&ops);
        assert_eq!(composed.len(), 2);
        assert!(composed[0].is_format());
        assert_eq!(run("abcdef", &composed), run("abcdef", &ops));
    }

    #[test]
    fn test_compose_merges_backspace_deletes() {
        let ops = vec![Operation::delete(5, 1), Operation::delete(4, 1), Operation::delete(3, 1)];
        let composed = compose(&ops);
        assert_eq!(composed.len(), 1);
        assert_eq!((composed[0].position, composed[0].len()), (3, 3));
        assert_eq!(run("abcdefg", &composed), run("abcdefg", &ops));
    }
}
