//! Version reconciliation: the per-document synchronization protocol.
//!
//! Every submission names the document version it was authored against. A
//! submission at the current version applies directly; a stale one is first
//! transformed against every operation it missed, in committed order, and the
//! *transformed* operation is what gets applied, acknowledged, and broadcast.
//! A submission claiming a future version is a protocol violation and the
//! session is told to resynchronize.
//!
//! The registry invokes [`DocState::reconcile`] under the per-document lock,
//! so the whole fetch-history / transform / apply / append sequence is atomic
//! with respect to other submissions for the same id.

use std::collections::VecDeque;

use serde_json::Value;
use uuid::Uuid;

use crate::ot::{self, Operation, OtError, Side};

/// A transport session's identity, used for tie-breaking and echo filtering.
pub type SessionId = Uuid;

/// One committed operation, retained for transforming stale submissions.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub op: Operation,
    pub author: SessionId,
    pub seq: u64,
}

/// The canonical in-memory state of one document.
///
/// `version` counts every operation ever applied since creation; `content`
/// is always the fold of those operations over the initial state.
#[derive(Debug)]
pub struct DocState {
    pub id: String,
    content: Value,
    version: u64,
    /// Committed operations since `history_start`, one per version.
    history: VecDeque<HistoryEntry>,
    /// Version at which `history[0]` was applied.
    history_start: u64,
    /// Retention cap: the bounded-staleness backstop.
    max_history: usize,
}

/// A successfully reconciled submission.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The operation as actually applied (transformed when the base was stale)
    pub operation: Operation,
    pub new_version: u64,
}

/// Why a submission was refused. The document is unchanged in every case.
#[derive(Debug, Clone)]
pub enum Rejected {
    /// The operation does not fit the current content shape.
    Operation(OtError),
    /// The client claimed a version the server has not reached.
    ProtocolViolation {
        base_version: u64,
        server_version: u64,
    },
    /// The base version predates the retained history window.
    HistoryEvicted {
        base_version: u64,
        oldest_retained: u64,
    },
}

impl Rejected {
    /// Whether the submitting session must re-join to recover.
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            Rejected::ProtocolViolation { .. } | Rejected::HistoryEvicted { .. }
        )
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::Operation(e) => write!(f, "{e}"),
            Rejected::ProtocolViolation {
                base_version,
                server_version,
            } => write!(
                f,
                "base version {base_version} is ahead of server version {server_version}"
            ),
            Rejected::HistoryEvicted {
                base_version,
                oldest_retained,
            } => write!(
                f,
                "base version {base_version} predates retained history (oldest {oldest_retained})"
            ),
        }
    }
}

impl std::error::Error for Rejected {}

impl DocState {
    /// Wrap state loaded from the store. History starts empty: any session
    /// joining now receives this exact version.
    pub fn new(id: impl Into<String>, content: Value, version: u64, max_history: usize) -> Self {
        Self {
            id: id.into(),
            content,
            version,
            history: VecDeque::new(),
            history_start: version,
            max_history,
        }
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Oldest base version a submission can still be transformed from.
    pub fn oldest_supported_base(&self) -> u64 {
        self.history_start
    }

    /// Reconcile and apply one submission.
    pub fn reconcile(
        &mut self,
        op: Operation,
        base_version: u64,
        author: SessionId,
        seq: u64,
    ) -> Result<Applied, Rejected> {
        if base_version > self.version {
            return Err(Rejected::ProtocolViolation {
                base_version,
                server_version: self.version,
            });
        }
        if base_version < self.history_start {
            return Err(Rejected::HistoryEvicted {
                base_version,
                oldest_retained: self.history_start,
            });
        }

        let mut op = op;
        let missed_from = (base_version - self.history_start) as usize;
        for entry in self.history.iter().skip(missed_from) {
            // Total order over (author, seq) decides positional ties.
            let side = if (author, seq) < (entry.author, entry.seq) {
                Side::Left
            } else {
                Side::Right
            };
            op = ot::transform(&op, &entry.op, side);
        }

        self.content = ot::apply(&self.content, &op).map_err(Rejected::Operation)?;
        self.version += 1;
        self.history.push_back(HistoryEntry {
            op: op.clone(),
            author,
            seq,
        });
        if self.history.len() > self.max_history {
            self.history.pop_front();
            self.history_start += 1;
        }

        Ok(Applied {
            operation: op,
            new_version: self.version,
        })
    }

    /// Drop history that no in-flight submission can still reference,
    /// returning the dropped span composed into a single catch-up operation.
    ///
    /// `oldest_inflight_base` is the lowest base version any connected
    /// session could still submit against (the current version when the room
    /// is empty). Submissions older than the new floor are answered with
    /// [`Rejected::HistoryEvicted`].
    pub fn compact(&mut self, oldest_inflight_base: u64) -> Option<Operation> {
        let floor = oldest_inflight_base.min(self.version);
        let mut composed: Option<Operation> = None;
        while self.history_start < floor {
            let entry = match self.history.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.history_start += 1;
            composed = Some(match composed {
                Some(span) => span.compose(entry.op),
                None => entry.op,
            });
        }
        composed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Edit;
    use serde_json::json;

    fn text_insert(offset: usize, text: &str) -> Operation {
        Operation::single(Edit::InsertText {
            path: vec![],
            offset,
            text: text.into(),
        })
    }

    fn session() -> SessionId {
        Uuid::new_v4()
    }

    #[test]
    fn test_direct_apply_at_current_version() {
        let mut state = DocState::new("doc", json!(""), 0, 64);
        let op = Operation::set_content(json!(""), json!("hello"));

        let applied = state.reconcile(op.clone(), 0, session(), 1).unwrap();
        assert_eq!(applied.new_version, 1);
        assert_eq!(applied.operation, op);
        assert_eq!(state.content(), &json!("hello"));
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn test_stale_base_is_transformed() {
        let mut state = DocState::new("doc", json!("hello"), 5, 64);
        let a = session();
        let b = session();

        // A commits an insert at the front while B still holds version 5.
        state.reconcile(text_insert(0, ">> "), 5, a, 1).unwrap();
        // B's append was authored at offset 5; it must land after ">> hello".
        let applied = state.reconcile(text_insert(5, "!"), 5, b, 1).unwrap();

        assert_eq!(applied.new_version, 7);
        assert_eq!(state.content(), &json!(">> hello!"));
        // The broadcast payload is the transformed operation, not the original.
        assert_eq!(applied.operation, text_insert(8, "!"));
    }

    #[test]
    fn test_future_base_rejected() {
        let mut state = DocState::new("doc", json!("x"), 4, 64);
        let err = state
            .reconcile(text_insert(0, "y"), 10, session(), 1)
            .unwrap_err();

        assert!(matches!(err, Rejected::ProtocolViolation { .. }));
        assert!(err.needs_resync());
        assert_eq!(state.version(), 4);
        assert_eq!(state.content(), &json!("x"));
    }

    #[test]
    fn test_invalid_operation_leaves_state_unchanged() {
        let mut state = DocState::new("doc", json!("abc"), 1, 64);
        let bad = Operation::single(Edit::DeleteText {
            path: vec![],
            offset: 0,
            text: "zzz".into(),
        });

        let err = state.reconcile(bad, 1, session(), 1).unwrap_err();
        assert!(matches!(err, Rejected::Operation(OtError::TypeMismatch(_))));
        assert!(!err.needs_resync());
        assert_eq!(state.version(), 1);
        assert_eq!(state.content(), &json!("abc"));
        assert_eq!(state.history_len(), 0);
    }

    #[test]
    fn test_version_strictly_monotonic() {
        let mut state = DocState::new("doc", json!(""), 0, 64);
        let author = session();
        for i in 0..10u64 {
            let applied = state
                .reconcile(text_insert(i as usize, "x"), i, author, i)
                .unwrap();
            assert_eq!(applied.new_version, i + 1);
        }
        assert_eq!(state.version(), 10);
        assert_eq!(state.content(), &json!("xxxxxxxxxx"));
    }

    #[test]
    fn test_concurrent_same_base_converges_with_broadcast_order() {
        // Two sessions edit version 0 concurrently; a third replica applying
        // the broadcast sequence in committed order reaches the same content.
        let mut state = DocState::new("doc", json!("ab"), 0, 64);
        let a = session();
        let b = session();

        let first = state.reconcile(text_insert(0, "A"), 0, a, 1).unwrap();
        let second = state.reconcile(text_insert(2, "B"), 0, b, 1).unwrap();

        let mut replica = json!("ab");
        replica = ot::apply(&replica, &first.operation).unwrap();
        replica = ot::apply(&replica, &second.operation).unwrap();
        assert_eq!(&replica, state.content());
    }

    #[test]
    fn test_history_cap_advances_floor() {
        let mut state = DocState::new("doc", json!(""), 0, 4);
        let author = session();
        for i in 0..8u64 {
            state
                .reconcile(text_insert(i as usize, "x"), i, author, i)
                .unwrap();
        }
        assert_eq!(state.history_len(), 4);
        assert_eq!(state.oldest_supported_base(), 4);

        let err = state
            .reconcile(text_insert(0, "y"), 2, session(), 1)
            .unwrap_err();
        assert!(matches!(err, Rejected::HistoryEvicted { .. }));
        assert!(err.needs_resync());
    }

    #[test]
    fn test_compact_composes_dropped_span() {
        let mut state = DocState::new("doc", json!(""), 0, 64);
        let author = session();
        for i in 0..5u64 {
            state
                .reconcile(text_insert(i as usize, "x"), i, author, i)
                .unwrap();
        }

        let span = state.compact(3).unwrap();
        assert_eq!(state.oldest_supported_base(), 3);
        assert_eq!(state.history_len(), 2);
        // The composed span replays the dropped prefix in one step.
        assert_eq!(ot::apply(&json!(""), &span).unwrap(), json!("xxx"));

        // Bases at or above the floor still reconcile.
        state.reconcile(text_insert(0, "!"), 3, session(), 1).unwrap();
        // Bases below it no longer do.
        assert!(matches!(
            state.reconcile(text_insert(0, "!"), 2, session(), 2),
            Err(Rejected::HistoryEvicted { .. })
        ));
    }

    #[test]
    fn test_compact_empty_room_drains_history() {
        let mut state = DocState::new("doc", json!(""), 0, 64);
        let author = session();
        for i in 0..3u64 {
            state
                .reconcile(text_insert(0, "x"), i, author, i)
                .unwrap();
        }
        state.compact(state.version());
        assert_eq!(state.history_len(), 0);
        assert_eq!(state.oldest_supported_base(), 3);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        // Same scenario replayed twice gives the same outcome.
        let a = session();
        let b = session();
        let run = |a: SessionId, b: SessionId| {
            let mut state = DocState::new("doc", json!("__"), 0, 64);
            state.reconcile(text_insert(1, "A"), 0, a, 1).unwrap();
            state.reconcile(text_insert(1, "B"), 0, b, 1).unwrap();
            state.content().clone()
        };
        assert_eq!(run(a, b), run(a, b));
    }
}
