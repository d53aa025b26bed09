//! Concurrent-edit transformation.
//!
//! `transform(a, b, side)` rewrites operation `a`, authored against the same
//! document version as `b`, into the operation to apply after `b` has already
//! been applied, such that both application orders converge:
//!
//! ```text
//! apply(apply(S, b), transform(a, b, Left)) ==
//! apply(apply(S, a), transform(b, a, Right))
//! ```
//!
//! `side` settles ties when both operations target the same position: the
//! `Left` operation wins. The engine derives sides from the total order over
//! (author session, submission sequence), so the outcome is deterministic
//! for any interleaving.
//!
//! Positional rules: edits inside a concurrently deleted or replaced subtree
//! are dropped; an insert at exactly a deleted list index or text offset is
//! positioned *at* the gap, not inside it, and survives.

use serde_json::Value;

use super::{apply_edit, char_len, Edit, Operation, Path, PathSegment};

/// Which operation wins positional ties. `Left` is the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Transform `op` against a concurrently applied `against`.
pub fn transform(op: &Operation, against: &Operation, side: Side) -> Operation {
    let mut edits: Vec<Edit> = op.edits.clone();
    for b in &against.edits {
        let mut next = Vec::with_capacity(edits.len());
        for a in edits {
            next.extend(transform_edit(a, b, side));
        }
        edits = next;
    }
    Operation { edits }
}

fn transform_edit(a: Edit, b: &Edit, side: Side) -> Vec<Edit> {
    match b {
        Edit::Insert { path: pb, value } => against_insert(a, b, pb, value, side),
        Edit::Delete { path: pb, .. } => against_delete(a, b, pb),
        Edit::Replace { path: pb, value, .. } => against_replace(a, b, pb, value, side),
        Edit::AddNumber { path: pb, .. } => against_leaf(a, b, pb),
        Edit::InsertText {
            path: pb,
            offset,
            text,
        } => against_text_insert(a, b, pb, *offset, char_len(text), side),
        Edit::DeleteText {
            path: pb,
            offset,
            text,
        } => against_text_delete(a, b, pb, *offset, char_len(text)),
    }
}

fn against_insert(mut a: Edit, b: &Edit, pb: &Path, bval: &Value, side: Side) -> Vec<Edit> {
    match pb.last() {
        // List insert: indices at or past the insertion point shift right.
        Some(PathSegment::Index(i)) => {
            if let Some(j) = list_pos(a.path(), pb) {
                let at_list = a.path().len() == pb.len();
                let shifts = if at_list && matches!(a, Edit::Insert { .. }) {
                    // Insert vs insert at the same index: the winner stays first.
                    j > *i || (j == *i && side == Side::Right)
                } else {
                    j >= *i
                };
                if shifts {
                    set_index(a.path_mut(), pb.len() - 1, j + 1);
                }
                return vec![a];
            }
        }
        // Object insert: a concurrent insert of the same key becomes a
        // replace for the winner and a no-op for the loser.
        Some(PathSegment::Key(_)) => {
            if a.path() == pb {
                return match a {
                    Edit::Insert { path, value } => match side {
                        Side::Left => vec![Edit::Replace {
                            path,
                            prior: bval.clone(),
                            value,
                        }],
                        Side::Right => Vec::new(),
                    },
                    other => vec![other],
                };
            }
        }
        None => {}
    }
    if is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

fn against_delete(a: Edit, b: &Edit, pb: &Path) -> Vec<Edit> {
    if a.path() == pb {
        return match a {
            // Same target deleted twice: once is enough.
            Edit::Delete { .. } => Vec::new(),
            // A concurrent replace re-creates the value the delete removed.
            Edit::Replace { path, value, .. } => vec![Edit::Insert { path, value }],
            // An insert at the deleted index sits at the gap, not inside it.
            insert @ Edit::Insert { .. } => vec![insert],
            Edit::AddNumber { .. } | Edit::InsertText { .. } | Edit::DeleteText { .. } => {
                Vec::new()
            }
        };
    }
    if is_proper_prefix(pb, a.path()) {
        // Target was inside the deleted subtree.
        return Vec::new();
    }
    if let Some(PathSegment::Index(i)) = pb.last() {
        if let Some(j) = list_pos(a.path(), pb) {
            let mut a = a;
            if j > *i {
                set_index(a.path_mut(), pb.len() - 1, j - 1);
            }
            return vec![a];
        }
    }
    let mut a = a;
    if is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

fn against_replace(a: Edit, b: &Edit, pb: &Path, bval: &Value, side: Side) -> Vec<Edit> {
    if is_proper_prefix(pb, a.path()) {
        // Target was inside the replaced subtree.
        return Vec::new();
    }
    if a.path() == pb {
        return match a {
            Edit::Replace { path, value, .. } => match side {
                Side::Left => vec![Edit::Replace {
                    path,
                    prior: bval.clone(),
                    value,
                }],
                Side::Right => Vec::new(),
            },
            Edit::Delete { .. } => Vec::new(),
            // A list insert at the replaced element's index is untouched.
            insert @ Edit::Insert { .. } => vec![insert],
            Edit::AddNumber { .. } | Edit::InsertText { .. } | Edit::DeleteText { .. } => {
                Vec::new()
            }
        };
    }
    let mut a = a;
    if is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

fn against_leaf(mut a: Edit, b: &Edit, pb: &Path) -> Vec<Edit> {
    if a.path() == pb || is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

fn against_text_insert(
    a: Edit,
    b: &Edit,
    pb: &Path,
    ob: usize,
    blen: usize,
    side: Side,
) -> Vec<Edit> {
    if a.path() == pb {
        match a {
            Edit::InsertText {
                path,
                mut offset,
                text,
            } => {
                if offset > ob || (offset == ob && side == Side::Right) {
                    offset += blen;
                }
                return vec![Edit::InsertText { path, offset, text }];
            }
            Edit::DeleteText { path, offset, text } => {
                let n = char_len(&text);
                if ob <= offset {
                    return vec![Edit::DeleteText {
                        path,
                        offset: offset + blen,
                        text,
                    }];
                }
                if ob >= offset + n {
                    return vec![Edit::DeleteText { path, offset, text }];
                }
                // The insertion landed inside the deleted range: delete
                // around it in two pieces.
                let split = ob - offset;
                let first: String = text.chars().take(split).collect();
                let second: String = text.chars().skip(split).collect();
                return vec![
                    Edit::DeleteText {
                        path: path.clone(),
                        offset,
                        text: first,
                    },
                    Edit::DeleteText {
                        path,
                        offset: offset + blen,
                        text: second,
                    },
                ];
            }
            mut other => {
                patch_prior(&mut other, b);
                return vec![other];
            }
        }
    }
    let mut a = a;
    if is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

fn against_text_delete(a: Edit, b: &Edit, pb: &Path, ob: usize, m: usize) -> Vec<Edit> {
    if a.path() == pb {
        match a {
            Edit::InsertText {
                path,
                mut offset,
                text,
            } => {
                if offset >= ob + m {
                    offset -= m;
                } else if offset > ob {
                    // Insert point was inside the deleted range: snap to its start.
                    offset = ob;
                }
                return vec![Edit::InsertText { path, offset, text }];
            }
            Edit::DeleteText { path, offset, text } => {
                let n = char_len(&text);
                if offset >= ob + m {
                    return vec![Edit::DeleteText {
                        path,
                        offset: offset - m,
                        text,
                    }];
                }
                if offset + n <= ob {
                    return vec![Edit::DeleteText { path, offset, text }];
                }
                // Overlapping deletes: keep only the chars `b` did not remove.
                let left_keep = ob.saturating_sub(offset);
                let right_keep = (offset + n).saturating_sub(ob + m);
                if left_keep + right_keep == 0 {
                    return Vec::new();
                }
                let left: String = text.chars().take(left_keep).collect();
                let right: String = text.chars().skip(n - right_keep).collect();
                return vec![Edit::DeleteText {
                    path,
                    offset: offset.min(ob),
                    text: left + &right,
                }];
            }
            mut other => {
                patch_prior(&mut other, b);
                return vec![other];
            }
        }
    }
    let mut a = a;
    if is_proper_prefix(a.path(), pb) {
        patch_prior(&mut a, b);
    }
    vec![a]
}

/// True when `prefix` is a strict ancestor path of `path`.
fn is_proper_prefix(prefix: &Path, path: &Path) -> bool {
    prefix.len() < path.len() && path[..prefix.len()] == prefix[..]
}

/// When `a` addresses an element of the list that `b`'s last segment indexes,
/// return `a`'s index in that list.
fn list_pos(pa: &Path, pb: &Path) -> Option<usize> {
    let depth = pb.len() - 1;
    if pa.len() <= depth || pa[..depth] != pb[..depth] {
        return None;
    }
    match pa[depth] {
        PathSegment::Index(j) => Some(j),
        PathSegment::Key(_) => None,
    }
}

fn set_index(path: &mut Path, depth: usize, value: usize) {
    path[depth] = PathSegment::Index(value);
}

/// `b` edited inside the subtree that `a` is about to delete or replace:
/// replay `b` on `a`'s recorded prior value so it still matches the document.
fn patch_prior(a: &mut Edit, b: &Edit) {
    let depth = a.path().len();
    let prior = match a {
        Edit::Delete { prior, .. } | Edit::Replace { prior, .. } => prior,
        _ => return,
    };
    let mut rebased = b.clone();
    rebased.path_mut().drain(..depth);
    // A shape disagreement here means the submission will be rejected on
    // apply anyway; leave the prior untouched.
    let _ = apply_edit(prior, &rebased);
}
