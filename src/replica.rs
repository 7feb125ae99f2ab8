//! Local replica - the device-side read model the UI subscribes to
//!
//! Holds the device's view of entity state, folded from accepted changes
//! (its own confirmed operations and authority-issued updates alike). The
//! replica is a cache: it is rebuilt from cursor 0 on restart, while the
//! outbox carries the durable not-yet-confirmed writes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::model::{AcceptedChange, ChangeBatch, Cursor, Entity, EntityId, Operation};

/// Read-only snapshot handed to the rendering layer
#[derive(Debug, Clone)]
pub struct ReplicaSnapshot {
    /// Current entities, unordered
    pub entities: Vec<Entity>,
    /// Operations still awaiting confirmation
    pub outbox_len: u64,
    /// Operations parked as needs-attention, for UI surfacing
    pub needs_review: Vec<Operation>,
}

/// Device-local entity view plus pull cursor
pub struct Replica {
    entities: Arc<RwLock<HashMap<EntityId, Entity>>>,
    cursor: RwLock<Cursor>,
    /// Bumped on every fold so the UI can re-render without polling
    changed_tx: watch::Sender<u64>,
}

impl Replica {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
            cursor: RwLock::new(0),
            changed_tx,
        }
    }

    /// Subscribe to change notifications (value is a generation counter)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    /// Fold one accepted change. Stale deliveries (broadcast catching up
    /// behind a pull, or vice versa) are ignored by version.
    pub async fn fold(&self, change: &AcceptedChange) {
        let mut entities = self.entities.write().await;
        let apply = match entities.get(&change.entity.entity_id) {
            Some(existing) => change.entity.version > existing.version,
            None => true,
        };
        if apply {
            debug!(
                entity_id = %change.entity.entity_id,
                version = change.entity.version,
                "Replica advanced"
            );
            entities.insert(change.entity.entity_id, change.entity.clone());
            drop(entities);
            self.changed_tx.send_modify(|generation| *generation += 1);
        }
    }

    /// Fold a pulled batch and advance the cursor
    pub async fn fold_batch(&self, batch: &ChangeBatch) {
        for change in &batch.changes {
            self.fold(change).await;
        }
        let mut cursor = self.cursor.write().await;
        if batch.next_cursor > *cursor {
            *cursor = batch.next_cursor;
        }
    }

    /// Cursor to resume pulling from
    pub async fn cursor(&self) -> Cursor {
        *self.cursor.read().await
    }

    /// Version this replica holds for an entity, 0 if unknown
    pub async fn version_of(&self, entity_id: &EntityId) -> u64 {
        self.entities
            .read()
            .await
            .get(entity_id)
            .map(|e| e.version)
            .unwrap_or(0)
    }

    pub async fn get(&self, entity_id: &EntityId) -> Option<Entity> {
        self.entities.read().await.get(entity_id).cloned()
    }

    pub async fn entities(&self) -> Vec<Entity> {
        self.entities.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}
