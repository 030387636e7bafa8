//! # quill-collab — Real-time collaboration layer for Quill
//!
//! Central-authority synchronization over WebSocket using the
//! operational transformation engine in `quill-ot`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ClientSession│                     │  Authority  │──► DocumentStore
//! │ (replica)   │                     │ (revisions) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴─────────┐
//!                                  │ BroadcastRegistry │
//!                                  │ (fan-out per doc) │
//!                                  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`authority`] — revision sequencing, rebasing, divergence checks
//! - [`broadcast`] — per-document fan-out of acks and operations
//! - [`protocol`] — binary wire protocol (bincode-encoded messages)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with automatic resync
//! - [`storage`] — persistence collaborator (in-memory and RocksDB)

pub mod authority;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use authority::{Authority, AuthorityConfig, AuthorityError, SubmitOutcome};
pub use broadcast::{
    BroadcastGroup, BroadcastRegistry, BroadcastStats, Delivery, DocumentEvent, Subscription,
    SubscriptionError,
};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentStore, LogEntry, MemoryStore, RocksStore, StoreConfig, StoreError,
    StoredDocument, DEFAULT_LOG_CAPACITY,
};
