//! # quill-ot — Operational transformation engine for Quill
//!
//! Pure, synchronous building blocks for concurrent plain-text (and
//! tree-structured) editing with a central revision authority.
//!
//! ## Architecture
//!
//! ```text
//!  local edit ──► diff ──► ClientSession ──► Submission ──► (server)
//!                              ▲    │
//!                              │    └── optimistic apply
//!                              │
//!  (server) ── Ack / Remote ───┘  rebase pending ◄── transform_sequence
//! ```
//!
//! ## Modules
//!
//! - [`edit`] — the [`Edit`] trait, [`transform`] and [`transform_sequence`]
//! - [`text`] — flat offset-addressed [`Operation`], `apply` and `diff`
//! - [`tree`] — path-addressed [`TreeOp`] over a [`Node`] tree
//! - [`session`] — client synchronization state machine
//! - [`error`] — validation / apply / session errors

pub mod edit;
pub mod error;
pub mod session;
pub mod text;
pub mod tree;

use uuid::Uuid;

/// Opaque identifier of an editing session. Ordering breaks position ties.
pub type ClientId = Uuid;

/// Identifier of a collaboratively edited document.
pub type DocumentId = Uuid;

/// Server-assigned count of applied operations.
pub type Revision = u64;

// Re-exports for convenience
pub use edit::{transform, transform_sequence, Edit, Side};
pub use error::{ApplyError, SessionError, ValidationError};
pub use session::{ClientSession, Snapshot, Submission, SyncState};
pub use text::{apply, diff, Operation};
pub use tree::{Node, Path, TreeOp};
