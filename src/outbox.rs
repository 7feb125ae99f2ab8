//! Outbox Queue - durable per-device FIFO of unconfirmed operations
//!
//! Every UI write lands here first, immediately and without touching the
//! network. The sync engine drains the queue front-to-back once online;
//! operations leave only through an explicit confirmed dequeue or by being
//! parked for manual review. The queue survives process restarts.
//!
//! Keys in the `ops` tree are big-endian sequence numbers, so sled's ordered
//! iteration gives back enqueue order for free.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{EntityId, OpId, OpState, Operation};

/// Configuration for the outbox
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Path to sled database
    pub db_path: std::path::PathBuf,
    /// Maximum queued operations (0 = unlimited)
    pub capacity: u64,
    /// Cache size in bytes
    pub cache_size: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            db_path: crate::config::default_data_dir().join("outbox.sled"),
            capacity: 10_000,
            cache_size: 16 * 1024 * 1024,
        }
    }
}

/// Durable FIFO of operations awaiting confirmation by the record store
pub struct Outbox {
    db: sled::Db,
    /// seq (big-endian u64) -> Operation
    ops: sled::Tree,
    /// op_id -> OpState
    states: sled::Tree,
    /// op_id -> seq, for dequeue/park lookups
    index: sled::Tree,
    next_seq: AtomicU64,
    capacity: u64,
}

impl Outbox {
    /// Open (or create) an outbox. Any operation left `InFlight` by a crash
    /// reverts to `Queued`; replay is safe because apply is idempotent on
    /// op_id.
    pub async fn open(config: OutboxConfig) -> Result<Self, SyncError> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::Config::new()
            .path(&config.db_path)
            .cache_capacity(config.cache_size)
            .open()?;

        let ops = db.open_tree("ops")?;
        let states = db.open_tree("states")?;
        let index = db.open_tree("index")?;

        let next_seq = match ops.last()? {
            Some((key, _)) => decode_seq(&key)? + 1,
            None => 0,
        };

        let outbox = Self {
            db,
            ops,
            states,
            index,
            next_seq: AtomicU64::new(next_seq),
            capacity: config.capacity,
        };

        let reverted = outbox.revert_in_flight()?;
        if reverted > 0 {
            warn!(count = reverted, "Reverted in-flight operations to queued after restart");
        }

        info!(
            path = %config.db_path.display(),
            pending = outbox.len(),
            "Outbox opened"
        );
        Ok(outbox)
    }

    /// Open an outbox at a specific path with default limits
    pub async fn at_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        Self::open(OutboxConfig {
            db_path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
        .await
    }

    /// Append an operation durably. Returns immediately; never touches the
    /// network. Fails with `StorageExhausted` when the queue is full or the
    /// durable append itself fails, so the UI can surface it instead of
    /// silently losing the citizen's report.
    pub async fn enqueue(&self, op: Operation) -> Result<(), SyncError> {
        if self.capacity > 0 && self.len() >= self.capacity {
            return Err(SyncError::StorageExhausted(format!(
                "outbox at capacity ({} operations)",
                self.capacity
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let op_bytes = rmp_serde::to_vec_named(&op)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let state_bytes = rmp_serde::to_vec_named(&OpState::Queued)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        self.ops
            .insert(encode_seq(seq), op_bytes)
            .map_err(storage_exhausted)?;
        self.states
            .insert(op.op_id.as_bytes(), state_bytes)
            .map_err(storage_exhausted)?;
        self.index
            .insert(op.op_id.as_bytes(), encode_seq(seq).to_vec())
            .map_err(storage_exhausted)?;

        self.db.flush_async().await.map_err(storage_exhausted)?;

        debug!(op_id = %op.op_id, entity_id = %op.entity_id, seq = seq, "Operation enqueued");
        Ok(())
    }

    /// First operation in enqueue order that is not parked for review
    pub fn peek_front(&self) -> Result<Option<Operation>, SyncError> {
        for item in self.ops.iter() {
            let (_, value) = item?;
            let op: Operation = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if self.state_of(&op.op_id)? != Some(OpState::NeedsManualReview) {
                return Ok(Some(op));
            }
        }
        Ok(None)
    }

    /// Remove a confirmed operation. The only way an operation leaves the
    /// queue besides parking.
    pub async fn dequeue_confirmed(&self, op_id: &OpId) -> Result<(), SyncError> {
        let seq_bytes = self
            .index
            .remove(op_id.as_bytes())?
            .ok_or(SyncError::OperationNotFound(*op_id))?;
        self.ops.remove(seq_bytes)?;
        self.states.remove(op_id.as_bytes())?;
        self.db.flush_async().await?;

        debug!(op_id = %op_id, "Operation confirmed and dequeued");
        Ok(())
    }

    /// Park an operation for manual review. It stays in the queue,
    /// observable but skipped by the drain.
    pub async fn park(&self, op_id: &OpId) -> Result<(), SyncError> {
        self.set_state(op_id, OpState::NeedsManualReview)?;
        self.db.flush_async().await?;
        warn!(op_id = %op_id, "Operation parked for manual review");
        Ok(())
    }

    /// Mark an operation as submitted to the record store
    pub fn mark_in_flight(&self, op_id: &OpId) -> Result<(), SyncError> {
        self.set_state(op_id, OpState::InFlight)
    }

    /// Revert an in-flight operation to queued (connectivity lost mid-submit)
    pub fn mark_queued(&self, op_id: &OpId) -> Result<(), SyncError> {
        self.set_state(op_id, OpState::Queued)
    }

    /// Replace a conflicted operation with its rebased form, in place
    /// (same queue position, same op_id)
    pub async fn replace_rebased(&self, rebased: &Operation) -> Result<(), SyncError> {
        let seq_bytes = self
            .index
            .get(rebased.op_id.as_bytes())?
            .ok_or(SyncError::OperationNotFound(rebased.op_id))?;
        let op_bytes = rmp_serde::to_vec_named(rebased)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.ops.insert(seq_bytes, op_bytes)?;
        self.set_state(&rebased.op_id, OpState::ConflictRebased)?;
        self.db.flush_async().await?;

        debug!(op_id = %rebased.op_id, base_version = rebased.base_version, "Operation rebased in place");
        Ok(())
    }

    /// Current state of an operation, if still queued
    pub fn state_of(&self, op_id: &OpId) -> Result<Option<OpState>, SyncError> {
        match self.states.get(op_id.as_bytes())? {
            Some(bytes) => {
                let state: OpState = rmp_serde::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Operations parked for manual review, in enqueue order
    pub fn needs_review(&self) -> Result<Vec<Operation>, SyncError> {
        let mut parked = Vec::new();
        for item in self.ops.iter() {
            let (_, value) = item?;
            let op: Operation = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if self.state_of(&op.op_id)? == Some(OpState::NeedsManualReview) {
                parked.push(op);
            }
        }
        Ok(parked)
    }

    /// Queued operation count (including parked), for backpressure and UI
    pub fn len(&self) -> u64 {
        self.ops.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Count of not-yet-parked operations targeting one entity. A new
    /// operation for that entity bases itself on the replica version plus
    /// this count, since earlier queued ops logically apply first.
    pub fn pending_for(&self, entity_id: &EntityId) -> Result<u64, SyncError> {
        let mut count = 0;
        for item in self.ops.iter() {
            let (_, value) = item?;
            let op: Operation = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if op.entity_id == *entity_id
                && self.state_of(&op.op_id)? != Some(OpState::NeedsManualReview)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn set_state(&self, op_id: &OpId, state: OpState) -> Result<(), SyncError> {
        if self.index.get(op_id.as_bytes())?.is_none() {
            return Err(SyncError::OperationNotFound(*op_id));
        }
        let bytes = rmp_serde::to_vec_named(&state)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.states.insert(op_id.as_bytes(), bytes)?;
        Ok(())
    }

    fn revert_in_flight(&self) -> Result<u64, SyncError> {
        let mut reverted = 0;
        for item in self.states.iter() {
            let (key, value) = item?;
            let state: OpState = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if matches!(state, OpState::InFlight | OpState::ConflictRebased) {
                let bytes = rmp_serde::to_vec_named(&OpState::Queued)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                self.states.insert(key, bytes)?;
                reverted += 1;
            }
        }
        Ok(reverted)
    }
}

fn encode_seq(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn decode_seq(bytes: &[u8]) -> Result<u64, SyncError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SyncError::Database("malformed outbox sequence key".into()))?;
    Ok(u64::from_be_bytes(arr))
}

fn storage_exhausted(e: sled::Error) -> SyncError {
    SyncError::StorageExhausted(e.to_string())
}
