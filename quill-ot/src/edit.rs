//! The edit abstraction shared by every position scheme.
//!
//! Both the flat text [`Operation`](crate::Operation) and the tree
//! [`TreeOp`](crate::TreeOp) implement [`Edit`], so sequence transform,
//! the client session and the server authority are written once.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApplyError, ValidationError};
use crate::ClientId;

/// Which of two concurrent edits keeps its position when both target
/// the same spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This edit wins the tie and keeps its offset.
    Left,
    /// The other edit wins; this one shifts past it.
    Right,
}

impl Side {
    /// Lower client id wins position priority.
    ///
    /// Equal ids happen when one client's reconnect overlaps its old
    /// connection. The edit being transformed then yields to `against`,
    /// which the authority has already sequenced and never transforms
    /// back, so the outcome follows sequencing order.
    pub fn for_clients(op_client: ClientId, against_client: ClientId) -> Self {
        if op_client < against_client {
            Side::Left
        } else {
            Side::Right
        }
    }
}

/// A transformable edit over some document type.
pub trait Edit:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The replica state this edit mutates.
    type Document: Clone
        + Debug
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Structural checks that do not depend on any document state.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Apply in place. Fails without mutating when the edit does not fit.
    fn apply_to(&self, doc: &mut Self::Document) -> Result<(), ApplyError>;

    /// Rewrite `self` so it can be applied after `against`, both having
    /// been authored on the same base state. `None` means the edit no
    /// longer contributes anything and must be dropped.
    fn transform(&self, against: &Self, side: Side) -> Option<Self>;
}

/// Transform `op` (authored by `op_client`) past `against` (authored by
/// `against_client`), breaking position ties by client id.
pub fn transform<E: Edit>(
    op: &E,
    op_client: ClientId,
    against: &E,
    against_client: ClientId,
) -> Option<E> {
    op.transform(against, Side::for_clients(op_client, against_client))
}

/// Fold `op` through `ops` left to right. Stops at the first `None`.
///
/// An empty `ops` returns `op` unchanged.
pub fn transform_sequence<'a, E, I>(op: E, client: ClientId, ops: I) -> Option<E>
where
    E: Edit + 'a,
    I: IntoIterator<Item = (&'a E, ClientId)>,
{
    let mut current = op;
    for (against, against_client) in ops {
        current = transform(&current, client, against, against_client)?;
    }
    Some(current)
}
