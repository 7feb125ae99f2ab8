//! Error types for gramitra-sync

use thiserror::Error;

use crate::model::OpId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local queue storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("Version conflict on entity {entity_id}: expected base {expected}, got {actual}")]
    VersionConflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Operation {0} needs manual review")]
    NeedsManualReview(OpId),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Rejected by policy: {0}")]
    RejectedByPolicy(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Operation not found in outbox: {0}")]
    OperationNotFound(OpId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for SyncError {
    fn from(e: sled::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}
