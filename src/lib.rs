//! gramitra-sync - offline-tolerant submission and sync engine
//!
//! Core of the GraMitra civic-reporting workflow: citizens file grievances,
//! answer village surveys, and follow project progress under intermittent
//! connectivity, while authority users consume and mutate the same records
//! from a connected context.
//!
//! ## Architecture
//!
//! ```text
//! UI action → Outbox (durable, immediate) → DeviceEngine (when online)
//!     → Transport → AuthorityNode → RecordStore (versioned source of truth)
//!     → broadcast / pull → Replica → UI refresh
//! ```
//!
//! - **Outbox**: per-device durable FIFO of unconfirmed operations
//! - **RecordStore**: authoritative entity state + accepted-op history,
//!   serialized per entity
//! - **resolver**: pure merge policy applied on version conflicts
//! - **DeviceEngine / AuthorityNode**: mirrored sync roles
//! - **ConnectivityMonitor**: online/offline event source the device
//!   subscribes to
//!
//! Guarantees: no accepted duplicate effects under retry (apply is
//! idempotent on op_id), no silent loss (every operation that leaves the
//! queue ends accepted or parked for manual review), and convergence of
//! concurrent citizen/authority edits under the per-kind merge policy.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod model;
pub mod outbox;
pub mod record_store;
pub mod replica;
pub mod resolver;
pub mod transport;

// Re-exports
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, LinkState};
pub use engine::{AuthorityConfig, AuthorityNode, DeviceEngine};
pub use error::SyncError;
pub use model::{
    AcceptedChange, Actor, ActorRole, ApplyOutcome, ChangeBatch, Entity, EntityDelta, EntityId,
    EntityKind, EntityPayload, OpId, OpState, Operation, OperationKind, SubmitRequest,
};
pub use outbox::{Outbox, OutboxConfig};
pub use record_store::{RecordStore, RecordStoreConfig};
pub use replica::{Replica, ReplicaSnapshot};
pub use transport::{InProcessTransport, Transport};
