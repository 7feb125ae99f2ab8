//! Core data model - entities, operations, and apply outcomes
//!
//! The civic-record kinds form a closed tagged set so the conflict resolver
//! can dispatch exhaustively. Every record is wrapped in an [`Entity`]
//! envelope carrying the store-assigned version; every proposed mutation
//! travels as an [`Operation`] carrying the version it was based on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Globally unique entity identifier, client-generated so records can be
/// created offline without a server round-trip.
pub type EntityId = Uuid;

/// Unique operation identifier, the idempotency key for replay.
pub type OpId = Uuid;

/// Position in the record store's acceptance log.
pub type Cursor = u64;

/// Opaque reference to an attachment held by the media collaborator.
/// The engine never inspects or transports attachment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(pub String);

/// Who produced an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Opaque identity (device id or authority login)
    pub device_id: String,
    pub role: ActorRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Citizen,
    Authority,
}

impl Actor {
    pub fn citizen(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            role: ActorRole::Citizen,
        }
    }

    pub fn authority(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            role: ActorRole::Authority,
        }
    }
}

/// Grievance lifecycle - a strict monotonic lattice. Closure is a status
/// transition, never a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrievanceStatus {
    Pending,
    InProgress,
    Resolved,
}

/// Project lifecycle, same advancing-state rule as grievances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    Planned,
    Started,
    InProgress,
    Completed,
}

/// Announcement priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// One answered survey question (option-value answers, e.g. "good" / "none")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyAnswer {
    pub question: u32,
    pub value: String,
}

/// Kind-specific record state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Project {
        name: String,
        /// Progress percentage, 0-100, monotonic (work does not regress)
        progress: u8,
        status: ProjectStatus,
        location: String,
        /// Count of photo references attached by field workers
        image_count: u32,
    },
    Grievance {
        title: String,
        description: String,
        location: String,
        status: GrievanceStatus,
        attachment: Option<AttachmentRef>,
    },
    /// Authority-only: citizens never mutate announcements
    Announcement {
        title: String,
        body: String,
        priority: Priority,
    },
    SurveyResponse {
        /// Catalog key, e.g. "healthcare", "education", "water"
        survey_key: String,
        answers: Vec<SurveyAnswer>,
    },
}

/// Discriminant for logging and resolver dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Grievance,
    Announcement,
    SurveyResponse,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Grievance => "grievance",
            EntityKind::Announcement => "announcement",
            EntityKind::SurveyResponse => "survey_response",
        }
    }
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Project { .. } => EntityKind::Project,
            EntityPayload::Grievance { .. } => EntityKind::Grievance,
            EntityPayload::Announcement { .. } => EntityKind::Announcement,
            EntityPayload::SurveyResponse { .. } => EntityKind::SurveyResponse,
        }
    }
}

/// Partial mutation against one payload kind. Status changes travel as
/// [`StatusChange`], not as delta fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityDelta {
    Project {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_count: Option<u32>,
    },
    Grievance {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentRef>,
    },
    Announcement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
    },
    SurveyResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answers: Option<Vec<SurveyAnswer>>,
    },
}

impl EntityDelta {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityDelta::Project { .. } => EntityKind::Project,
            EntityDelta::Grievance { .. } => EntityKind::Grievance,
            EntityDelta::Announcement { .. } => EntityKind::Announcement,
            EntityDelta::SurveyResponse { .. } => EntityKind::SurveyResponse,
        }
    }
}

/// A status transition for the kinds that have a lifecycle lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "to", rename_all = "snake_case")]
pub enum StatusChange {
    Grievance(GrievanceStatus),
    Project(ProjectStatus),
}

impl StatusChange {
    pub fn kind(&self) -> EntityKind {
        match self {
            StatusChange::Grievance(_) => EntityKind::Grievance,
            StatusChange::Project(_) => EntityKind::Project,
        }
    }
}

/// The three mutation shapes the outbox carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum OperationKind {
    Create(EntityPayload),
    Update(EntityDelta),
    StatusTransition(StatusChange),
}

/// A single proposed mutation against one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-generated, used for idempotent replay
    pub op_id: OpId,
    pub entity_id: EntityId,
    pub actor: Actor,
    /// Version the producer believed was current
    pub base_version: u64,
    pub kind: OperationKind,
}

impl Operation {
    /// Build a create operation for a fresh entity (id generated here)
    pub fn create(actor: Actor, payload: EntityPayload) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            actor,
            base_version: 0,
            kind: OperationKind::Create(payload),
        }
    }

    pub fn update(actor: Actor, entity_id: EntityId, base_version: u64, delta: EntityDelta) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            entity_id,
            actor,
            base_version,
            kind: OperationKind::Update(delta),
        }
    }

    pub fn status_transition(
        actor: Actor,
        entity_id: EntityId,
        base_version: u64,
        change: StatusChange,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            entity_id,
            actor,
            base_version,
            kind: OperationKind::StatusTransition(change),
        }
    }

    /// Rebase onto a new authoritative version, keeping the op_id so replay
    /// of the original submission stays idempotent
    pub fn rebased(mut self, base_version: u64) -> Self {
        self.base_version = base_version;
        self
    }

    pub fn entity_kind(&self) -> EntityKind {
        match &self.kind {
            OperationKind::Create(p) => p.kind(),
            OperationKind::Update(d) => d.kind(),
            OperationKind::StatusTransition(s) => s.kind(),
        }
    }
}

/// Versioned record envelope held by the record store and local replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    /// Store-assigned, +1 per accepted operation; clients never set it
    pub version: u64,
    /// Creator; never changes after the create
    pub owner: Actor,
    pub payload: EntityPayload,
    /// Actor whose operation produced the current version; the resolver
    /// uses this to tell cross-role conflicts apart
    pub last_mutated_by: Actor,
    /// Store-assigned, authoritative ordering key for display
    pub last_mutated_at: DateTime<Utc>,
}

impl Entity {
    /// Apply an operation's payload effect in place. The caller has already
    /// settled version checks; this only folds the mutation.
    pub fn apply_kind(&mut self, kind: &OperationKind) -> Result<(), SyncError> {
        match kind {
            OperationKind::Create(_) => Err(SyncError::Internal(
                "create cannot be applied to an existing entity".into(),
            )),
            OperationKind::Update(delta) => self.apply_delta(delta),
            OperationKind::StatusTransition(change) => self.apply_status(change),
        }
    }

    fn apply_delta(&mut self, delta: &EntityDelta) -> Result<(), SyncError> {
        match (&mut self.payload, delta) {
            (
                EntityPayload::Project {
                    name,
                    progress,
                    location,
                    image_count,
                    ..
                },
                EntityDelta::Project {
                    name: d_name,
                    progress: d_progress,
                    location: d_location,
                    image_count: d_images,
                },
            ) => {
                if let Some(v) = d_name {
                    *name = v.clone();
                }
                if let Some(v) = d_progress {
                    *progress = (*v).min(100);
                }
                if let Some(v) = d_location {
                    *location = v.clone();
                }
                if let Some(v) = d_images {
                    *image_count = *v;
                }
                Ok(())
            }
            (
                EntityPayload::Grievance {
                    title,
                    description,
                    location,
                    attachment,
                    ..
                },
                EntityDelta::Grievance {
                    title: d_title,
                    description: d_description,
                    location: d_location,
                    attachment: d_attachment,
                },
            ) => {
                if let Some(v) = d_title {
                    *title = v.clone();
                }
                if let Some(v) = d_description {
                    *description = v.clone();
                }
                if let Some(v) = d_location {
                    *location = v.clone();
                }
                if let Some(v) = d_attachment {
                    *attachment = Some(v.clone());
                }
                Ok(())
            }
            (
                EntityPayload::Announcement {
                    title,
                    body,
                    priority,
                },
                EntityDelta::Announcement {
                    title: d_title,
                    body: d_body,
                    priority: d_priority,
                },
            ) => {
                if let Some(v) = d_title {
                    *title = v.clone();
                }
                if let Some(v) = d_body {
                    *body = v.clone();
                }
                if let Some(v) = d_priority {
                    *priority = *v;
                }
                Ok(())
            }
            (
                EntityPayload::SurveyResponse { answers, .. },
                EntityDelta::SurveyResponse { answers: d_answers },
            ) => {
                if let Some(v) = d_answers {
                    *answers = v.clone();
                }
                Ok(())
            }
            (payload, delta) => Err(SyncError::Internal(format!(
                "delta kind {} does not match entity kind {}",
                delta.kind().as_str(),
                payload.kind().as_str()
            ))),
        }
    }

    fn apply_status(&mut self, change: &StatusChange) -> Result<(), SyncError> {
        match (&mut self.payload, change) {
            (EntityPayload::Grievance { status, .. }, StatusChange::Grievance(to)) => {
                *status = *to;
                Ok(())
            }
            (EntityPayload::Project { status, .. }, StatusChange::Project(to)) => {
                *status = *to;
                Ok(())
            }
            (payload, change) => Err(SyncError::Internal(format!(
                "status change kind {} does not match entity kind {}",
                change.kind().as_str(),
                payload.kind().as_str()
            ))),
        }
    }
}

/// Result of submitting an operation to the record store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Applied; `version` is the entity's new authoritative version
    Accepted { version: u64 },
    /// base_version was stale; carries the current authoritative entity so
    /// the caller can rebase
    Conflict { current: Box<Entity> },
    /// Not applied and not retryable as-is
    Rejected { reason: RejectReason },
}

/// Distinguishable rejection codes, carried for forward compatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    /// Reserved for future authorization failures
    Policy { detail: String },
    /// Update or status op against an entity the store has never seen
    UnknownEntity,
    /// Operation payload kind does not match the stored entity kind
    KindMismatch { detail: String },
}

/// One accepted operation plus the entity state it produced, as recorded in
/// the acceptance log and broadcast to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedChange {
    /// Global acceptance sequence number (cursor space)
    pub seq: Cursor,
    pub operation: Operation,
    pub new_version: u64,
    pub entity: Entity,
}

/// A page of the acceptance log, from `pull_changes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<AcceptedChange>,
    /// Pass back to resume; issuing the same cursor twice is safe
    pub next_cursor: Cursor,
}

/// Per-operation lifecycle inside the outbox.
/// `Queued → InFlight → {dequeued | ConflictRebased → InFlight | NeedsManualReview}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Queued,
    InFlight,
    ConflictRebased,
    NeedsManualReview,
}

/// What the UI hands to `submit` - the single write entry point
#[derive(Debug, Clone)]
pub enum SubmitRequest {
    Create(EntityPayload),
    Update(EntityId, EntityDelta),
    StatusTransition(EntityId, StatusChange),
}
