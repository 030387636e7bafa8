//! Client-side synchronization state machine.
//!
//! Local edits are applied optimistically and queued. Only the head of
//! the queue is on the wire at any time; the rest are released one by
//! one as acknowledgments arrive, each tagged with the revision current
//! at release. Remote operations are rebased over the queue before they
//! touch local content, so replaying the queue on top of the server's
//! content at `revision` always reproduces `content`.
//!
//! ```text
//!            local edit                 ack (queue empty)
//!   Idle ───────────────► Pending ─────────────────────► Idle
//!    ▲                      │  ▲ ack (more queued)
//!    │ snapshot             │  └──┘
//!    │                      ▼ error / divergence
//!  AwaitingSnapshot ◄───────┘
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::edit::{transform, Edit};
use crate::error::SessionError;
use crate::text::{diff, Operation};
use crate::{ClientId, Revision};

/// Full document state at a revision, as sent on join and resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<D> {
    pub content: D,
    pub revision: Revision,
}

/// An operation ready to go to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission<E> {
    pub op: E,
    pub client_id: ClientId,
    pub base_revision: Revision,
}

/// Coarse session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing unacknowledged.
    Idle,
    /// At least one local operation awaits acknowledgment.
    Pending,
    /// Local state was discarded; waiting for a fresh snapshot.
    AwaitingSnapshot,
}

#[derive(Debug, Clone)]
struct InFlight<E> {
    /// `None` once a remote edit has absorbed it; the ack still comes.
    op: Option<E>,
    base_revision: Revision,
}

/// Per-session replica of one document.
#[derive(Debug, Clone)]
pub struct ClientSession<E: Edit> {
    client_id: ClientId,
    content: E::Document,
    revision: Revision,
    in_flight: Option<InFlight<E>>,
    buffered: VecDeque<E>,
    awaiting_snapshot: bool,
}

impl<E: Edit> ClientSession<E> {
    /// Start from the snapshot received at join time.
    pub fn new(client_id: ClientId, snapshot: Snapshot<E::Document>) -> Self {
        Self {
            client_id,
            content: snapshot.content,
            revision: snapshot.revision,
            in_flight: None,
            buffered: VecDeque::new(),
            awaiting_snapshot: false,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Local view, including unacknowledged edits.
    pub fn content(&self) -> &E::Document {
        &self.content
    }

    /// Last revision fully incorporated.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn state(&self) -> SyncState {
        if self.awaiting_snapshot {
            SyncState::AwaitingSnapshot
        } else if self.in_flight.is_some() {
            SyncState::Pending
        } else {
            SyncState::Idle
        }
    }

    /// Unacknowledged operations in submission order. An in-flight op
    /// that a remote edit absorbed is skipped.
    pub fn pending_ops(&self) -> impl Iterator<Item = &E> {
        self.in_flight
            .iter()
            .filter_map(|f| f.op.as_ref())
            .chain(self.buffered.iter())
    }

    /// Number of acknowledgments still expected plus queued ops.
    pub fn pending_len(&self) -> usize {
        usize::from(self.in_flight.is_some()) + self.buffered.len()
    }

    /// Base revision of the operation currently on the wire.
    pub fn in_flight_base(&self) -> Option<Revision> {
        self.in_flight.as_ref().map(|f| f.base_revision)
    }

    /// Apply a local edit immediately and queue it. Returns the
    /// submission to send when nothing else is in flight.
    pub fn apply_local(&mut self, op: E) -> Result<Option<Submission<E>>, SessionError> {
        if self.awaiting_snapshot {
            return Err(SessionError::AwaitingSnapshot);
        }
        op.validate()?;
        op.apply_to(&mut self.content)
            .map_err(SessionError::LocalOutOfBounds)?;

        if self.in_flight.is_some() {
            log::trace!("Queued local op behind in-flight submission: {op:?}");
            self.buffered.push_back(op);
            return Ok(None);
        }

        Ok(Some(self.release(op)))
    }

    /// The server applied (or no-op'd) the head of the queue.
    ///
    /// `applied_revision` is `revision + 1` for an applied op and equals
    /// `revision` when the server dropped it as a no-op.
    pub fn handle_ack(
        &mut self,
        applied_revision: Revision,
    ) -> Result<Option<Submission<E>>, SessionError> {
        if self.awaiting_snapshot {
            log::debug!("Ignoring ack for revision {applied_revision} while resyncing");
            return Ok(None);
        }
        if self.in_flight.is_none() {
            return Err(SessionError::UnexpectedAck(applied_revision));
        }
        if applied_revision != self.revision && applied_revision != self.revision + 1 {
            return Err(SessionError::RevisionGap {
                expected: self.revision + 1,
                received: applied_revision,
            });
        }

        self.in_flight = None;
        self.revision = applied_revision;

        Ok(self.buffered.pop_front().map(|next| self.release(next)))
    }

    /// Another session's operation, already applied by the server at
    /// `applied_revision`.
    pub fn handle_remote(
        &mut self,
        op: E,
        applied_revision: Revision,
        origin: ClientId,
    ) -> Result<(), SessionError> {
        if self.awaiting_snapshot {
            return Ok(());
        }
        if origin == self.client_id {
            // Own edits come back through the ack path.
            return Ok(());
        }
        if applied_revision <= self.revision {
            log::debug!(
                "Ignoring stale remote op at revision {applied_revision} (have {})",
                self.revision
            );
            return Ok(());
        }
        if applied_revision != self.revision + 1 {
            return Err(SessionError::RevisionGap {
                expected: self.revision + 1,
                received: applied_revision,
            });
        }

        let me = self.client_id;
        let mut incoming = Some(op);

        let head = match &self.in_flight {
            Some(InFlight { op: Some(mine), .. }) => {
                let rebased = incoming.as_ref().and_then(|r| transform(mine, me, r, origin));
                incoming = incoming.and_then(|r| transform(&r, origin, mine, me));
                Some(rebased)
            }
            _ => None,
        };

        let mut buffered = VecDeque::with_capacity(self.buffered.len());
        for mine in &self.buffered {
            match incoming.take() {
                Some(r) => {
                    if let Some(rebased) = transform(mine, me, &r, origin) {
                        buffered.push_back(rebased);
                    }
                    incoming = transform(&r, origin, mine, me);
                }
                None => buffered.push_back(mine.clone()),
            }
        }

        if let Some(r) = &incoming {
            r.apply_to(&mut self.content)?;
        }

        if let (Some(rebased), Some(flight)) = (head, self.in_flight.as_mut()) {
            flight.op = rebased;
        }
        self.buffered = buffered;
        self.revision = applied_revision;
        Ok(())
    }

    /// Drop every unacknowledged op and wait for a fresh snapshot. The
    /// caller is responsible for sending the resync request.
    pub fn begin_resync(&mut self) {
        let dropped = self.pending_len();
        if dropped > 0 {
            log::warn!("Resync discards {dropped} pending op(s)");
        }
        self.in_flight = None;
        self.buffered.clear();
        self.awaiting_snapshot = true;
    }

    /// Replace local state wholesale.
    pub fn handle_snapshot(&mut self, snapshot: Snapshot<E::Document>) {
        self.content = snapshot.content;
        self.revision = snapshot.revision;
        self.in_flight = None;
        self.buffered.clear();
        self.awaiting_snapshot = false;
    }

    fn release(&mut self, op: E) -> Submission<E> {
        self.in_flight = Some(InFlight {
            op: Some(op.clone()),
            base_revision: self.revision,
        });
        Submission {
            op,
            client_id: self.client_id,
            base_revision: self.revision,
        }
    }
}

impl ClientSession<Operation> {
    /// Capture a change from the editor surface by diffing against the
    /// local content. A replacement becomes a delete then an insert.
    pub fn edit(&mut self, new_content: &str) -> Result<Vec<Submission<Operation>>, SessionError> {
        let mut submissions = Vec::new();
        while let Some(op) = diff(&self.content, new_content) {
            if let Some(submission) = self.apply_local(op)? {
                submissions.push(submission);
            }
        }
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session(id: u128, content: &str) -> ClientSession<Operation> {
        ClientSession::new(
            Uuid::from_u128(id),
            Snapshot {
                content: content.to_string(),
                revision: 0,
            },
        )
    }

    #[test]
    fn test_local_edit_is_optimistic() {
        let mut s = session(1, "abc");
        let subs = s.edit("aXbc").unwrap();

        assert_eq!(s.content(), "aXbc");
        assert_eq!(s.state(), SyncState::Pending);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].op, Operation::insert(1, "X"));
        assert_eq!(subs[0].base_revision, 0);
        assert_eq!(subs[0].client_id, Uuid::from_u128(1));
    }

    #[test]
    fn test_unchanged_edit_sends_nothing() {
        let mut s = session(1, "abc");
        assert!(s.edit("abc").unwrap().is_empty());
        assert_eq!(s.state(), SyncState::Idle);
    }

    #[test]
    fn test_second_edit_waits_for_ack() {
        let mut s = session(1, "abc");
        assert_eq!(s.edit("abcd").unwrap().len(), 1);
        assert!(s.edit("abcde").unwrap().is_empty());
        assert_eq!(s.pending_len(), 2);

        let next = s.handle_ack(1).unwrap().unwrap();
        assert_eq!(next.op, Operation::insert(4, "e"));
        assert_eq!(next.base_revision, 1);
        assert_eq!(s.revision(), 1);
        assert_eq!(s.state(), SyncState::Pending);

        assert!(s.handle_ack(2).unwrap().is_none());
        assert_eq!(s.state(), SyncState::Idle);
        assert_eq!(s.revision(), 2);
    }

    #[test]
    fn test_replacement_captured_as_delete_then_insert() {
        let mut s = session(1, "abc");
        let subs = s.edit("xyz").unwrap();
        assert_eq!(subs, vec![Submission {
            op: Operation::delete(0, 3),
            client_id: Uuid::from_u128(1),
            base_revision: 0,
        }]);
        assert_eq!(s.content(), "xyz");
        let queued: Vec<_> = s.pending_ops().cloned().collect();
        assert_eq!(queued, vec![Operation::delete(0, 3), Operation::insert(0, "xyz")]);
    }

    #[test]
    fn test_remote_op_rebases_pending() {
        // Client B (id 2) typed "Y" at 1; A (id 1) won the tie at the server.
        let mut b = session(2, "abc");
        b.edit("aYbc").unwrap();

        b.handle_remote(Operation::insert(1, "X"), 1, Uuid::from_u128(1))
            .unwrap();
        assert_eq!(b.content(), "aXYbc");
        assert_eq!(b.revision(), 1);

        let pending: Vec<_> = b.pending_ops().cloned().collect();
        assert_eq!(pending, vec![Operation::insert(2, "Y")]);
    }

    #[test]
    fn test_queue_invariant_holds_after_remote() {
        let mut s = session(5, "hello world");
        s.edit("hello brave world").unwrap();
        s.edit("hello brave world!").unwrap();

        s.handle_remote(Operation::delete(0, 6), 1, Uuid::from_u128(1))
            .unwrap();

        let mut server = String::from("world");
        for op in s.pending_ops() {
            op.apply_to(&mut server).unwrap();
        }
        assert_eq!(&server, s.content());
        assert_eq!(s.content(), "brave world!");
    }

    #[test]
    fn test_own_and_stale_remote_ignored() {
        let mut s = session(1, "abc");
        s.handle_remote(Operation::insert(0, "Z"), 1, Uuid::from_u128(1))
            .unwrap();
        assert_eq!(s.content(), "abc");

        s.handle_remote(Operation::insert(0, "Q"), 1, Uuid::from_u128(2))
            .unwrap();
        s.handle_remote(Operation::insert(0, "Q"), 1, Uuid::from_u128(2))
            .unwrap();
        assert_eq!(s.content(), "Qabc");
    }

    #[test]
    fn test_revision_gap_is_error() {
        let mut s = session(1, "abc");
        let err = s
            .handle_remote(Operation::insert(0, "Q"), 3, Uuid::from_u128(2))
            .unwrap_err();
        assert_eq!(err, SessionError::RevisionGap { expected: 1, received: 3 });
    }

    #[test]
    fn test_remote_out_of_bounds_is_divergence() {
        let mut s = session(1, "abc");
        let err = s
            .handle_remote(Operation::delete(2, 9), 1, Uuid::from_u128(2))
            .unwrap_err();
        assert!(matches!(err, SessionError::Diverged(_)));
        assert_eq!(s.content(), "abc");
    }

    #[test]
    fn test_noop_ack_keeps_revision() {
        let mut s = session(2, "abcdef");
        s.edit("def").unwrap();
        // Same deletion arrives first from another client.
        s.handle_remote(Operation::delete(0, 3), 1, Uuid::from_u128(1))
            .unwrap();
        assert_eq!(s.content(), "def");
        assert_eq!(s.pending_ops().count(), 0);
        assert_eq!(s.state(), SyncState::Pending);

        assert!(s.handle_ack(1).unwrap().is_none());
        assert_eq!(s.revision(), 1);
        assert_eq!(s.state(), SyncState::Idle);
    }

    #[test]
    fn test_unexpected_ack() {
        let mut s = session(1, "abc");
        assert_eq!(s.handle_ack(1), Err(SessionError::UnexpectedAck(1)));
    }

    #[test]
    fn test_resync_discards_and_replaces() {
        let mut s = session(1, "abc");
        s.edit("abcd").unwrap();
        s.edit("abcde").unwrap();

        s.begin_resync();
        assert_eq!(s.state(), SyncState::AwaitingSnapshot);
        assert_eq!(s.pending_len(), 0);

        // Deliveries in the gap are ignored.
        assert!(s.handle_ack(1).unwrap().is_none());
        s.handle_remote(Operation::insert(0, "Z"), 7, Uuid::from_u128(2))
            .unwrap();
        assert!(matches!(
            s.apply_local(Operation::insert(0, "n")),
            Err(SessionError::AwaitingSnapshot)
        ));

        s.handle_snapshot(Snapshot {
            content: "fresh".to_string(),
            revision: 42,
        });
        assert_eq!(s.state(), SyncState::Idle);
        assert_eq!(s.content(), "fresh");
        assert_eq!(s.revision(), 42);
    }
}
