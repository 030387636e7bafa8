//! Error types shared by the text and tree edit schemes.

use thiserror::Error;

use crate::Revision;

/// An operation is structurally malformed and must be rejected before
/// it reaches transform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("insert carries no text")]
    EmptyInsert,

    #[error("delete removes nothing")]
    EmptyDelete,

    #[error("operation targets the document root")]
    RootPath,
}

/// An operation does not fit the document it is applied to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("range {start}..{end} exceeds content length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("no node at path {0:?}")]
    InvalidPath(Vec<usize>),

    #[error("node at path {0:?} is not a text node")]
    NotText(Vec<usize>),

    #[error("node at path {0:?} cannot hold children")]
    NotElement(Vec<usize>),
}

/// Client-side synchronization failures.
///
/// `RevisionGap`, `Diverged` and `UnexpectedAck` mean the replica can no
/// longer be trusted and must resync. The rest reject a local edit
/// without touching state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("revision gap: expected {expected}, received {received}")]
    RevisionGap { expected: Revision, received: Revision },

    #[error("remote operation does not fit local content: {0}")]
    Diverged(#[from] ApplyError),

    #[error("acknowledgment for revision {0} with nothing in flight")]
    UnexpectedAck(Revision),

    #[error("invalid local edit: {0}")]
    Invalid(#[from] ValidationError),

    #[error("local edit does not fit content: {0}")]
    LocalOutOfBounds(ApplyError),

    #[error("session is waiting for a snapshot")]
    AwaitingSnapshot,
}

impl SessionError {
    /// Whether recovering requires a resync.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SessionError::RevisionGap { .. }
                | SessionError::Diverged(_)
                | SessionError::UnexpectedAck(_)
        )
    }
}
