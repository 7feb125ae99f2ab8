//! Record Store - authoritative versioned entity state plus accepted-op history
//!
//! Single source of truth on the authority side. Accepts an operation only
//! when its `base_version` matches the entity's current version (or the
//! entity is unseen, for creates); every accepted operation bumps the version
//! by exactly one and lands in an append-only acceptance log that feeds the
//! pull path.
//!
//! Concurrency discipline: one async mutex per entity, held in a `DashMap`
//! arena, so the version-check-and-increment is atomic per entity while
//! unrelated entities never block each other. This is the only true
//! mutual-exclusion boundary in the system.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::model::{
    AcceptedChange, ApplyOutcome, ChangeBatch, Cursor, Entity, EntityId, OpId, Operation,
    OperationKind, RejectReason,
};

/// Configuration for the record store
#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    /// Path to sled database
    pub db_path: std::path::PathBuf,
    /// Cache size in bytes
    pub cache_size: u64,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            db_path: crate::config::default_data_dir().join("records.sled"),
            cache_size: 16 * 1024 * 1024,
        }
    }
}

/// Authoritative entity store backed by sled
pub struct RecordStore {
    db: sled::Db,
    /// entity_id -> Entity
    entities: sled::Tree,
    /// op_id -> resulting version, for idempotent replay
    history: sled::Tree,
    /// acceptance seq (big-endian u64) -> AcceptedChange
    log: sled::Tree,
    /// Per-entity critical sections
    slots: DashMap<EntityId, Arc<Mutex<()>>>,
    /// Serializes acceptance-log appends so seq order matches append order
    log_guard: Mutex<()>,
    next_seq: AtomicU64,
}

impl RecordStore {
    /// Open (or create) a record store
    pub async fn open(config: RecordStoreConfig) -> Result<Self, SyncError> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::Config::new()
            .path(&config.db_path)
            .cache_capacity(config.cache_size)
            .open()?;

        let entities = db.open_tree("entities")?;
        let history = db.open_tree("history")?;
        let log = db.open_tree("log")?;

        let next_seq = match log.last()? {
            Some((key, _)) => decode_seq(&key)? + 1,
            None => 0,
        };

        info!(
            path = %config.db_path.display(),
            entities = entities.len(),
            accepted = next_seq,
            "RecordStore opened"
        );

        Ok(Self {
            db,
            entities,
            history,
            log,
            slots: DashMap::new(),
            log_guard: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Open a record store at a specific path
    pub async fn at_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        Self::open(RecordStoreConfig {
            db_path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
        .await
    }

    /// Apply one operation atomically.
    ///
    /// Replaying an op_id already in history returns the original
    /// `Accepted` without re-applying, so duplicate pushes under retry have
    /// exactly one effect.
    pub async fn apply(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        let (outcome, _) = self.apply_with_change(op).await?;
        Ok(outcome)
    }

    /// Like [`apply`](Self::apply), but also returns the acceptance-log
    /// entry when the operation was freshly accepted (None on replay, so
    /// callers broadcasting changes never re-announce a duplicate).
    pub async fn apply_with_change(
        &self,
        op: Operation,
    ) -> Result<(ApplyOutcome, Option<AcceptedChange>), SyncError> {
        let slot = self.slot(op.entity_id);
        let _guard = slot.lock().await;

        // Idempotent replay
        if let Some(bytes) = self.history.get(op.op_id.as_bytes())? {
            let version: u64 = rmp_serde::from_slice(&bytes)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            debug!(op_id = %op.op_id, version = version, "Replayed operation, returning recorded result");
            return Ok((ApplyOutcome::Accepted { version }, None));
        }

        let current = self.get(&op.entity_id)?;

        let new_entity = match (&op.kind, current) {
            (OperationKind::Create(payload), None) => Entity {
                entity_id: op.entity_id,
                version: 1,
                owner: op.actor.clone(),
                payload: payload.clone(),
                last_mutated_by: op.actor.clone(),
                last_mutated_at: Utc::now(),
            },
            (OperationKind::Create(_), Some(existing)) => {
                // A different create raced us on the same id
                return Ok((
                    ApplyOutcome::Conflict {
                        current: Box::new(existing),
                    },
                    None,
                ));
            }
            (_, None) => {
                return Ok((
                    ApplyOutcome::Rejected {
                        reason: RejectReason::UnknownEntity,
                    },
                    None,
                ));
            }
            (_, Some(existing)) => {
                if op.base_version != existing.version {
                    return Ok((
                        ApplyOutcome::Conflict {
                            current: Box::new(existing),
                        },
                        None,
                    ));
                }
                let mut next = existing;
                if let Err(e) = next.apply_kind(&op.kind) {
                    return Ok((
                        ApplyOutcome::Rejected {
                            reason: RejectReason::KindMismatch {
                                detail: e.to_string(),
                            },
                        },
                        None,
                    ));
                }
                next.version += 1;
                next.last_mutated_by = op.actor.clone();
                next.last_mutated_at = Utc::now();
                next
            }
        };

        let version = new_entity.version;
        let change = self.record_accepted(op, new_entity).await?;
        Ok((ApplyOutcome::Accepted { version }, Some(change)))
    }

    /// Current state of an entity
    pub fn get(&self, entity_id: &EntityId) -> Result<Option<Entity>, SyncError> {
        match self.entities.get(entity_id.as_bytes())? {
            Some(bytes) => {
                let entity: Entity = rmp_serde::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Current version of an entity, 0 if unseen
    pub fn current_version(&self, entity_id: &EntityId) -> Result<u64, SyncError> {
        Ok(self.get(entity_id)?.map(|e| e.version).unwrap_or(0))
    }

    /// Whether an op_id has already been accepted
    pub fn recorded(&self, op_id: &OpId) -> Result<bool, SyncError> {
        Ok(self.history.get(op_id.as_bytes())?.is_some())
    }

    /// Accepted changes after `cursor`, in acceptance order. Finite;
    /// restartable from any previously returned cursor.
    pub fn changes_since(&self, cursor: Cursor, limit: u64) -> Result<ChangeBatch, SyncError> {
        let mut changes = Vec::new();
        let mut next_cursor = cursor;

        for item in self.log.range(encode_seq(cursor)..) {
            if changes.len() as u64 >= limit {
                break;
            }
            let (_, value) = item?;
            let change: AcceptedChange = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            next_cursor = change.seq + 1;
            changes.push(change);
        }

        Ok(ChangeBatch {
            changes,
            next_cursor,
        })
    }

    /// All current entities (authority-side listings and stats)
    pub fn list_entities(&self) -> Result<Vec<Entity>, SyncError> {
        let mut out = Vec::new();
        for item in self.entities.iter() {
            let (_, value) = item?;
            let entity: Entity = rmp_serde::from_slice(&value)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            out.push(entity);
        }
        Ok(out)
    }

    /// Total accepted operations
    pub fn accepted_count(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Flush changes to disk
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn record_accepted(&self, op: Operation, entity: Entity) -> Result<AcceptedChange, SyncError> {
        let _log_guard = self.log_guard.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let change = AcceptedChange {
            seq,
            operation: op,
            new_version: entity.version,
            entity,
        };

        let entity_bytes = rmp_serde::to_vec_named(&change.entity)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let version_bytes = rmp_serde::to_vec_named(&change.new_version)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let change_bytes = rmp_serde::to_vec_named(&change)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        self.entities
            .insert(change.entity.entity_id.as_bytes(), entity_bytes)?;
        self.history
            .insert(change.operation.op_id.as_bytes(), version_bytes)?;
        self.log.insert(encode_seq(seq), change_bytes)?;
        self.db.flush_async().await?;

        debug!(
            op_id = %change.operation.op_id,
            entity_id = %change.entity.entity_id,
            kind = change.operation.entity_kind().as_str(),
            version = change.new_version,
            seq = seq,
            "Operation accepted"
        );
        Ok(change)
    }

    fn slot(&self, entity_id: EntityId) -> Arc<Mutex<()>> {
        self.slots
            .entry(entity_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn encode_seq(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn decode_seq(bytes: &[u8]) -> Result<u64, SyncError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SyncError::Database("malformed acceptance log key".into()))?;
    Ok(u64::from_be_bytes(arr))
}
