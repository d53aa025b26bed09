//! Path-addressed edit operations over JSON document content.
//!
//! An [`Operation`] is an ordered sequence of atomic [`Edit`]s. Each edit
//! addresses a [`Path`] into the document's content tree and carries the
//! payload needed to apply it — and, for destructive edits, the prior value,
//! so that concurrent-edit transformation can rewrite it (see [`transform`]).
//!
//! Documents are `serde_json::Value` trees; a plain text document is a JSON
//! string at the root path. Operations are immutable once submitted:
//! transformation and composition always produce new values.
//!
//! Text offsets count `char`s, not bytes.

mod transform;

pub use transform::{transform, Side};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step into a content tree: an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// Location of an edit target inside the content tree. Empty = the root.
pub type Path = Vec<PathSegment>;

/// An atomic edit against a known document shape.
///
/// `prior` fields carry the value the edit expects to find; apply rejects
/// the edit with [`OtError::TypeMismatch`] when the document disagrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    /// Insert an object key (last segment names it, must be absent) or
    /// splice an element into a list (last segment is the index).
    Insert { path: Path, value: Value },
    /// Remove the key or element at `path`.
    Delete { path: Path, prior: Value },
    /// Swap the value at `path`; the empty path replaces the whole document.
    Replace { path: Path, prior: Value, value: Value },
    /// Increment the number at `path`.
    AddNumber { path: Path, amount: f64 },
    /// Splice `text` into the string at `path` at char `offset`.
    InsertText { path: Path, offset: usize, text: String },
    /// Remove `text` from the string at `path` at char `offset`.
    DeleteText { path: Path, offset: usize, text: String },
}

impl Edit {
    pub fn path(&self) -> &Path {
        match self {
            Edit::Insert { path, .. }
            | Edit::Delete { path, .. }
            | Edit::Replace { path, .. }
            | Edit::AddNumber { path, .. }
            | Edit::InsertText { path, .. }
            | Edit::DeleteText { path, .. } => path,
        }
    }

    pub(crate) fn path_mut(&mut self) -> &mut Path {
        match self {
            Edit::Insert { path, .. }
            | Edit::Delete { path, .. }
            | Edit::Replace { path, .. }
            | Edit::AddNumber { path, .. }
            | Edit::InsertText { path, .. }
            | Edit::DeleteText { path, .. } => path,
        }
    }
}

/// An ordered sequence of edits, applied atomically to one document version.
///
/// Serializes as a bare edit list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation {
    pub edits: Vec<Edit>,
}

impl Operation {
    pub fn new(edits: Vec<Edit>) -> Self {
        Self { edits }
    }

    pub fn single(edit: Edit) -> Self {
        Self { edits: vec![edit] }
    }

    /// Replace the entire document content — the form a plain-text editor
    /// emits when it rewrites the whole buffer.
    pub fn set_content(prior: Value, value: Value) -> Self {
        Self::single(Edit::Replace {
            path: Vec::new(),
            prior,
            value,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.edits.is_empty()
    }

    /// Merge `other` onto `self` so that applying the result equals applying
    /// `self` then `other`. Adjacent mergeable edits (number increments at the
    /// same path, contiguous text insertions) collapse into one.
    pub fn compose(mut self, other: Operation) -> Operation {
        for edit in other.edits {
            let merged = match (self.edits.last_mut(), &edit) {
                (
                    Some(Edit::AddNumber { path: p, amount }),
                    Edit::AddNumber { path: q, amount: add },
                ) if *p == *q => {
                    *amount += *add;
                    true
                }
                (
                    Some(Edit::InsertText {
                        path: p,
                        offset,
                        text,
                    }),
                    Edit::InsertText {
                        path: q,
                        offset: next,
                        text: tail,
                    },
                ) if *p == *q && *next == *offset + char_len(text) => {
                    text.push_str(tail);
                    true
                }
                _ => false,
            };
            if !merged {
                self.edits.push(edit);
            }
        }
        let ended_on_zero_add = matches!(
            self.edits.last(),
            Some(Edit::AddNumber { amount, .. }) if *amount == 0.0
        );
        if ended_on_zero_add {
            self.edits.pop();
        }
        self
    }
}

/// Errors raised while validating or applying an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OtError {
    /// A path, index, or text offset does not exist in the current content.
    MalformedOperation(String),
    /// The content at a path has a different shape or value than the edit expects.
    TypeMismatch(String),
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::MalformedOperation(e) => write!(f, "malformed operation: {e}"),
            OtError::TypeMismatch(e) => write!(f, "type mismatch: {e}"),
        }
    }
}

impl std::error::Error for OtError {}

/// Apply `op` to `content`, returning the new content.
///
/// All-or-nothing: the input is never observed partially edited. Any failing
/// edit rejects the whole operation.
pub fn apply(content: &Value, op: &Operation) -> Result<Value, OtError> {
    let mut working = content.clone();
    for edit in &op.edits {
        apply_edit(&mut working, edit)?;
    }
    Ok(working)
}

pub(crate) fn apply_edit(target: &mut Value, edit: &Edit) -> Result<(), OtError> {
    match edit {
        Edit::Insert { path, value } => {
            let (parent_path, last) = split_last(path)?;
            let parent = descend(target, parent_path)?;
            match (last, parent) {
                (PathSegment::Key(k), Value::Object(map)) => {
                    if map.contains_key(k) {
                        return Err(OtError::TypeMismatch(format!(
                            "insert into existing key `{k}`"
                        )));
                    }
                    map.insert(k.clone(), value.clone());
                }
                (PathSegment::Index(i), Value::Array(items)) => {
                    if *i > items.len() {
                        return Err(OtError::MalformedOperation(format!(
                            "insert index {i} past end of list of {}",
                            items.len()
                        )));
                    }
                    items.insert(*i, value.clone());
                }
                (seg, parent) => return Err(container_mismatch(seg, parent)),
            }
        }
        Edit::Delete { path, prior } => {
            let (parent_path, last) = split_last(path)?;
            let parent = descend(target, parent_path)?;
            match (last, parent) {
                (PathSegment::Key(k), Value::Object(map)) => {
                    match map.get(k) {
                        None => {
                            return Err(OtError::MalformedOperation(format!(
                                "delete of missing key `{k}`"
                            )))
                        }
                        Some(current) if current != prior => {
                            return Err(OtError::TypeMismatch(format!(
                                "delete at `{k}` does not match current value"
                            )))
                        }
                        Some(_) => {}
                    }
                    map.remove(k);
                }
                (PathSegment::Index(i), Value::Array(items)) => {
                    match items.get(*i) {
                        None => {
                            return Err(OtError::MalformedOperation(format!(
                                "delete index {i} out of range"
                            )))
                        }
                        Some(current) if current != prior => {
                            return Err(OtError::TypeMismatch(format!(
                                "delete at index {i} does not match current value"
                            )))
                        }
                        Some(_) => {}
                    }
                    items.remove(*i);
                }
                (seg, parent) => return Err(container_mismatch(seg, parent)),
            }
        }
        Edit::Replace { path, prior, value } => {
            let slot = descend(target, path)?;
            if *slot != *prior {
                return Err(OtError::TypeMismatch(
                    "replace does not match current value".into(),
                ));
            }
            *slot = value.clone();
        }
        Edit::AddNumber { path, amount } => {
            let slot = descend(target, path)?;
            match slot {
                Value::Number(n) => {
                    *slot = Value::Number(add_number(n, *amount)?);
                }
                other => {
                    return Err(OtError::TypeMismatch(format!(
                        "expected number, found {}",
                        kind(other)
                    )))
                }
            }
        }
        Edit::InsertText { path, offset, text } => {
            let slot = descend(target, path)?;
            match slot {
                Value::String(s) => *s = splice_in(s, *offset, text)?,
                other => {
                    return Err(OtError::TypeMismatch(format!(
                        "expected string, found {}",
                        kind(other)
                    )))
                }
            }
        }
        Edit::DeleteText { path, offset, text } => {
            let slot = descend(target, path)?;
            match slot {
                Value::String(s) => *s = splice_out(s, *offset, text)?,
                other => {
                    return Err(OtError::TypeMismatch(format!(
                        "expected string, found {}",
                        kind(other)
                    )))
                }
            }
        }
    }
    Ok(())
}

fn split_last(path: &Path) -> Result<(&[PathSegment], &PathSegment), OtError> {
    match path.split_last() {
        Some((last, parent)) => Ok((parent, last)),
        None => Err(OtError::MalformedOperation(
            "insert/delete at the document root".into(),
        )),
    }
}

fn descend<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, OtError> {
    let mut cur = root;
    for seg in path {
        cur = match seg {
            PathSegment::Key(k) => match cur {
                Value::Object(map) => map.get_mut(k).ok_or_else(|| {
                    OtError::MalformedOperation(format!("missing key `{k}`"))
                })?,
                other => return Err(container_mismatch(seg, other)),
            },
            PathSegment::Index(i) => match cur {
                Value::Array(items) => {
                    let len = items.len();
                    items.get_mut(*i).ok_or_else(|| {
                        OtError::MalformedOperation(format!(
                            "index {i} out of range for list of {len}"
                        ))
                    })?
                }
                other => return Err(container_mismatch(seg, other)),
            },
        };
    }
    Ok(cur)
}

fn container_mismatch(seg: &PathSegment, found: &Value) -> OtError {
    match seg {
        PathSegment::Key(k) => OtError::TypeMismatch(format!(
            "key `{k}` addressed into {}",
            kind(found)
        )),
        PathSegment::Index(i) => OtError::TypeMismatch(format!(
            "index {i} addressed into {}",
            kind(found)
        )),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn add_number(n: &serde_json::Number, amount: f64) -> Result<serde_json::Number, OtError> {
    // Keep integers integral when the increment allows it.
    if amount.fract() == 0.0 && amount.abs() < i64::MAX as f64 {
        if let Some(i) = n.as_i64() {
            if let Some(sum) = i.checked_add(amount as i64) {
                return Ok(serde_json::Number::from(sum));
            }
        }
    }
    let sum = n.as_f64().unwrap_or(0.0) + amount;
    serde_json::Number::from_f64(sum)
        .ok_or_else(|| OtError::MalformedOperation("non-finite number result".into()))
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_to_byte(s: &str, chars: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(chars)
}

fn splice_in(s: &str, offset: usize, text: &str) -> Result<String, OtError> {
    let at = char_to_byte(s, offset).ok_or_else(|| {
        OtError::MalformedOperation(format!("text offset {offset} out of range"))
    })?;
    let mut out = String::with_capacity(s.len() + text.len());
    out.push_str(&s[..at]);
    out.push_str(text);
    out.push_str(&s[at..]);
    Ok(out)
}

fn splice_out(s: &str, offset: usize, text: &str) -> Result<String, OtError> {
    let from = char_to_byte(s, offset).ok_or_else(|| {
        OtError::MalformedOperation(format!("text offset {offset} out of range"))
    })?;
    let to = char_to_byte(s, offset + char_len(text)).ok_or_else(|| {
        OtError::MalformedOperation(format!("text delete at {offset} past end of string"))
    })?;
    if &s[from..to] != text {
        return Err(OtError::TypeMismatch(
            "deleted text does not match current string".into(),
        ));
    }
    let mut out = String::with_capacity(s.len() - (to - from));
    out.push_str(&s[..from]);
    out.push_str(&s[to..]);
    Ok(out)
}
