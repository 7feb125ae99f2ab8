//! Transport seam between device and authority roles
//!
//! The engine only needs two retry-safe calls; the underlying channel may
//! duplicate or drop messages, which is why both are idempotent (push by
//! op_id, pull by cursor). Concrete network transports live outside this
//! crate; [`InProcessTransport`] binds a device directly to an authority
//! node for embedded and test use.

use async_trait::async_trait;
use std::sync::Arc;

use crate::engine::AuthorityNode;
use crate::error::SyncError;
use crate::model::{ApplyOutcome, ChangeBatch, Cursor, Operation};

/// Bidirectional message channel to the authority role
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one operation. Safe to retry verbatim: a previously seen
    /// op_id returns the original result without re-mutating state.
    async fn push_operation(&self, op: Operation) -> Result<ApplyOutcome, SyncError>;

    /// Fetch accepted changes after `cursor`. Safe to re-issue any
    /// previously returned cursor.
    async fn pull_changes(&self, cursor: Cursor) -> Result<ChangeBatch, SyncError>;
}

/// Direct in-process binding to an authority node
pub struct InProcessTransport {
    node: Arc<AuthorityNode>,
}

impl InProcessTransport {
    pub fn new(node: Arc<AuthorityNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn push_operation(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        self.node.apply(op).await
    }

    async fn pull_changes(&self, cursor: Cursor) -> Result<ChangeBatch, SyncError> {
        self.node.changes_since(cursor)
    }
}
