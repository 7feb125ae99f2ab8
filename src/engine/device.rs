//! Device role - sequential outbox drain with bounded conflict rebase
//!
//! One drain loop per device, one operation in flight at a time, so
//! operations from a single device can never race each other. The loop
//! suspends while offline (the outbox simply accumulates) and aborts an
//! in-flight submission when connectivity drops; the operation reverts to
//! queued and is safe to retry verbatim because apply is idempotent on
//! op_id.
//!
//! Per-operation state machine:
//! `Queued → InFlight → {Accepted | ConflictRebased → InFlight | NeedsManualReview}`
//! An operation gets exactly one rebase retry; a second conflict parks it
//! for manual review instead of feeding a retry storm.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use crate::connectivity::LinkState;
use crate::error::SyncError;
use crate::model::{
    AcceptedChange, Actor, ApplyOutcome, EntityId, EntityPayload, OpId, OpState, Operation,
    SubmitRequest,
};
use crate::outbox::Outbox;
use crate::replica::{Replica, ReplicaSnapshot};
use crate::resolver;
use crate::transport::Transport;

/// Device-side sync engine
pub struct DeviceEngine {
    actor: Actor,
    outbox: Arc<Outbox>,
    replica: Arc<Replica>,
    transport: Arc<dyn Transport>,
    link_rx: watch::Receiver<LinkState>,
    /// Woken by submit so an online drain picks up new work immediately
    wake: Notify,
}

impl DeviceEngine {
    pub fn new(
        actor: Actor,
        outbox: Arc<Outbox>,
        replica: Arc<Replica>,
        transport: Arc<dyn Transport>,
        link_rx: watch::Receiver<LinkState>,
    ) -> Self {
        info!(device = %actor.device_id, "DeviceEngine initialized");
        Self {
            actor,
            outbox,
            replica,
            transport,
            link_rx,
            wake: Notify::new(),
        }
    }

    /// The UI's single write entry point. Enqueues durably and returns the
    /// operation id immediately; never blocks on the network.
    pub async fn submit(&self, request: SubmitRequest) -> Result<OpId, SyncError> {
        let op = match request {
            SubmitRequest::Create(payload) => Operation::create(self.actor.clone(), payload),
            SubmitRequest::Update(entity_id, delta) => {
                let base = self.next_base_version(&entity_id).await?;
                Operation::update(self.actor.clone(), entity_id, base, delta)
            }
            SubmitRequest::StatusTransition(entity_id, change) => {
                let base = self.next_base_version(&entity_id).await?;
                Operation::status_transition(self.actor.clone(), entity_id, base, change)
            }
        };

        let op_id = op.op_id;
        self.outbox.enqueue(op).await?;
        self.wake.notify_one();
        Ok(op_id)
    }

    /// Like [`submit`](Self::submit) for creates, also returning the
    /// client-generated entity id so the UI can show the record right away
    pub async fn submit_create(
        &self,
        payload: EntityPayload,
    ) -> Result<(EntityId, OpId), SyncError> {
        let op = Operation::create(self.actor.clone(), payload);
        let ids = (op.entity_id, op.op_id);
        self.outbox.enqueue(op).await?;
        self.wake.notify_one();
        Ok(ids)
    }

    /// Read-only state for the rendering layer
    pub async fn snapshot(&self) -> Result<ReplicaSnapshot, SyncError> {
        Ok(ReplicaSnapshot {
            entities: self.replica.entities().await,
            outbox_len: self.outbox.len(),
            needs_review: self.outbox.needs_review()?,
        })
    }

    pub fn replica(&self) -> Arc<Replica> {
        Arc::clone(&self.replica)
    }

    pub fn outbox(&self) -> Arc<Outbox> {
        Arc::clone(&self.outbox)
    }

    /// Run the engine: drain whenever online and new work or connectivity
    /// arrives. Returns when the connectivity monitor is dropped.
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut link_rx = self.link_rx.clone();
        loop {
            while !link_rx.borrow().is_online() {
                if link_rx.changed().await.is_err() {
                    return Ok(());
                }
            }

            self.drain_cycle().await?;

            tokio::select! {
                _ = self.wake.notified() => {}
                changed = link_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fold authority-side pushes into the replica. Runs until the sender
    /// side is dropped; a lagged subscriber just waits for the next pull to
    /// catch up.
    pub async fn consume_pushes(&self, mut rx: broadcast::Receiver<AcceptedChange>) {
        loop {
            match rx.recv().await {
                Ok(change) => self.replica.fold(&change).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed = missed, "Push subscriber lagged; pull will catch up");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// One full drain: push queued operations front-to-back, then pull
    /// remote changes into the replica. Returns early (without error) when
    /// connectivity drops mid-cycle.
    pub async fn drain_cycle(&self) -> Result<(), SyncError> {
        let mut link_rx = self.link_rx.clone();

        while let Some(op) = self.outbox.peek_front()? {
            if !link_rx.borrow().is_online() {
                return Ok(());
            }

            let was_rebased =
                self.outbox.state_of(&op.op_id)? == Some(OpState::ConflictRebased);
            if !was_rebased {
                self.outbox.mark_in_flight(&op.op_id)?;
            }

            let outcome = tokio::select! {
                biased;
                changed = link_rx.changed() => {
                    if changed.is_err() || !link_rx.borrow().is_online() {
                        // Abort without side effects; the op replays verbatim
                        if !was_rebased {
                            self.outbox.mark_queued(&op.op_id)?;
                        }
                        debug!(op_id = %op.op_id, "In-flight submission aborted by connectivity loss");
                        return Ok(());
                    }
                    continue;
                }
                result = self.transport.push_operation(op.clone()) => result,
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(SyncError::TransportUnavailable(reason)) => {
                    if !was_rebased {
                        self.outbox.mark_queued(&op.op_id)?;
                    }
                    debug!(op_id = %op.op_id, reason = %reason, "Transport unavailable, keeping operation queued");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match outcome {
                ApplyOutcome::Accepted { version } => {
                    debug!(op_id = %op.op_id, version = version, "Operation accepted");
                    self.outbox.dequeue_confirmed(&op.op_id).await?;
                }
                ApplyOutcome::Conflict { current } => {
                    if was_rebased {
                        // Second conflict for this op: bounded retry, hand
                        // it to a human instead of looping
                        self.outbox.park(&op.op_id).await?;
                        continue;
                    }
                    match resolver::rebase(op.clone(), &current) {
                        Ok(rebased) => {
                            self.outbox.replace_rebased(&rebased).await?;
                        }
                        Err(e) => {
                            warn!(op_id = %op.op_id, error = %e, "Conflict not rebasable, parking");
                            self.outbox.park(&op.op_id).await?;
                        }
                    }
                }
                ApplyOutcome::Rejected { reason } => {
                    // Never silently dropped: parked and surfaced to the UI
                    warn!(op_id = %op.op_id, reason = ?reason, "Operation rejected, parking for review");
                    self.outbox.park(&op.op_id).await?;
                }
            }
        }

        self.pull_remote().await
    }

    /// Pull accepted changes until the acceptance log is exhausted
    async fn pull_remote(&self) -> Result<(), SyncError> {
        loop {
            let cursor = self.replica.cursor().await;
            let batch = match self.transport.pull_changes(cursor).await {
                Ok(batch) => batch,
                Err(SyncError::TransportUnavailable(reason)) => {
                    debug!(reason = %reason, "Pull skipped, transport unavailable");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if batch.changes.is_empty() {
                return Ok(());
            }
            self.replica.fold_batch(&batch).await;
        }
    }

    /// Base version for a new local operation: the replica's view plus any
    /// not-yet-confirmed queued ops for the same entity, which logically
    /// apply first.
    async fn next_base_version(&self, entity_id: &EntityId) -> Result<u64, SyncError> {
        let replica_version = self.replica.version_of(entity_id).await;
        let pending = self.outbox.pending_for(entity_id)?;
        Ok(replica_version + pending)
    }
}
