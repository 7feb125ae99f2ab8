//! Authority role - applies inbound operations and broadcasts accepted state
//!
//! The broadcast-heavy mirror of the device role: every operation pushed by
//! a device goes through the record store here, and freshly accepted changes
//! fan out to all subscribed device roles so citizen replicas see
//! authority-issued updates (status changes, new announcements) without
//! polling. Conflicts are returned to the device, which owns the rebase.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{
    AcceptedChange, Actor, ApplyOutcome, ChangeBatch, Cursor, Entity, EntityDelta, EntityId,
    EntityPayload, Operation, StatusChange,
};
use crate::record_store::RecordStore;

/// Configuration for the authority node
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Broadcast channel capacity (slow subscribers miss and re-pull)
    pub broadcast_capacity: usize,
    /// Page size for changes_since batches
    pub pull_batch: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            pull_batch: 256,
        }
    }
}

/// Authority-side sync role wrapping the record store
pub struct AuthorityNode {
    store: Arc<RecordStore>,
    config: AuthorityConfig,
    change_tx: broadcast::Sender<AcceptedChange>,
}

impl AuthorityNode {
    pub fn new(store: Arc<RecordStore>, config: AuthorityConfig) -> Self {
        let (change_tx, _) = broadcast::channel(config.broadcast_capacity);
        info!("AuthorityNode initialized");
        Self {
            store,
            config,
            change_tx,
        }
    }

    /// Subscribe to accepted-change pushes
    pub fn subscribe(&self) -> broadcast::Receiver<AcceptedChange> {
        self.change_tx.subscribe()
    }

    /// Apply one inbound operation. Replays return the recorded result and
    /// are not re-broadcast.
    pub async fn apply(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        let op_id = op.op_id;
        let (outcome, change) = self.store.apply_with_change(op).await?;

        match &outcome {
            ApplyOutcome::Accepted { .. } => {
                if let Some(change) = change {
                    if self.change_tx.receiver_count() > 0 {
                        if let Err(e) = self.change_tx.send(change) {
                            warn!(error = %e, "Failed to broadcast accepted change");
                        }
                    }
                }
            }
            ApplyOutcome::Conflict { current } => {
                debug!(
                    op_id = %op_id,
                    entity_id = %current.entity_id,
                    current_version = current.version,
                    "Returning version conflict to device"
                );
            }
            ApplyOutcome::Rejected { reason } => {
                warn!(op_id = %op_id, reason = ?reason, "Operation rejected");
            }
        }

        Ok(outcome)
    }

    /// Pull path: accepted changes after `cursor`
    pub fn changes_since(&self, cursor: Cursor) -> Result<ChangeBatch, SyncError> {
        self.store.changes_since(cursor, self.config.pull_batch)
    }

    /// Authority-side direct write: create an entity (e.g. a new
    /// announcement or project) and broadcast it
    pub async fn publish(
        &self,
        actor: Actor,
        payload: EntityPayload,
    ) -> Result<(EntityId, u64), SyncError> {
        let op = Operation::create(actor, payload);
        let entity_id = op.entity_id;
        match self.apply(op).await? {
            ApplyOutcome::Accepted { version } => Ok((entity_id, version)),
            outcome => Err(SyncError::Internal(format!(
                "create of fresh entity did not accept: {:?}",
                outcome
            ))),
        }
    }

    /// Authority-side status transition (e.g. grievance moved to
    /// in-progress by an officer). Bases itself on the current authoritative
    /// version, which cannot race locally because apply is serialized per
    /// entity and this node is the only writer issuing from `current`.
    pub async fn transition_status(
        &self,
        actor: Actor,
        entity_id: EntityId,
        change: StatusChange,
    ) -> Result<u64, SyncError> {
        let base = self.store.current_version(&entity_id)?;
        let op = Operation::status_transition(actor, entity_id, base, change);
        self.expect_accept(op).await
    }

    /// Authority-side field update on the current version
    pub async fn update(
        &self,
        actor: Actor,
        entity_id: EntityId,
        delta: EntityDelta,
    ) -> Result<u64, SyncError> {
        let base = self.store.current_version(&entity_id)?;
        let op = Operation::update(actor, entity_id, base, delta);
        self.expect_accept(op).await
    }

    /// Current authoritative entity state
    pub fn get(&self, entity_id: &EntityId) -> Result<Option<Entity>, SyncError> {
        self.store.get(entity_id)
    }

    /// All current entities
    pub fn list_entities(&self) -> Result<Vec<Entity>, SyncError> {
        self.store.list_entities()
    }

    /// Total accepted operations
    pub fn accepted_count(&self) -> u64 {
        self.store.accepted_count()
    }

    async fn expect_accept(&self, op: Operation) -> Result<u64, SyncError> {
        let entity_id = op.entity_id;
        let base = op.base_version;
        match self.apply(op).await? {
            ApplyOutcome::Accepted { version } => Ok(version),
            ApplyOutcome::Conflict { current } => Err(SyncError::VersionConflict {
                entity_id: entity_id.to_string(),
                expected: current.version,
                actual: base,
            }),
            ApplyOutcome::Rejected { reason } => {
                Err(SyncError::RejectedByPolicy(format!("{:?}", reason)))
            }
        }
    }
}
