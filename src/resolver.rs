//! Conflict Resolver - pure per-kind merge policy
//!
//! Invoked by the device engine when the record store reports a version
//! conflict. Takes the conflicted operation and the current authoritative
//! entity and synthesizes a rebased operation with `base_version` set to the
//! current version. Applying the rebased operation succeeds at the device's
//! synchronous retry point unless yet another writer raced in between.
//!
//! Policy:
//! - Status fields follow their monotonic lattice: the more-advanced state
//!   wins, so an authority moving a grievance forward is never undone by a
//!   stale citizen edit.
//! - Project progress resolves to the maximum value (work does not regress).
//! - Grievance description edits from the same role that produced the
//!   current version win outright; cross-role edits concatenate both texts
//!   with provenance markers so nothing is silently overwritten.
//! - Announcements are authority-only; citizens cannot mutate them, so a
//!   citizen-origin announcement conflict is unreachable by construction.

use tracing::debug;

use crate::error::SyncError;
use crate::model::{
    ActorRole, Entity, EntityDelta, EntityPayload, Operation, OperationKind, StatusChange,
};

/// Rebase a conflicted operation onto the current authoritative entity.
///
/// The op_id is kept so an eventual replay of the original submission still
/// hits the recorded result.
pub fn rebase(op: Operation, current: &Entity) -> Result<Operation, SyncError> {
    if op.entity_id != current.entity_id {
        return Err(SyncError::Internal(
            "rebase called with mismatched entity".into(),
        ));
    }

    let kind = match op.kind.clone() {
        OperationKind::Create(_) => {
            // A create can only conflict if another create claimed the same
            // client-generated id; there is no meaningful merge
            return Err(SyncError::Internal(format!(
                "create operation {} raced an existing entity",
                op.op_id
            )));
        }
        OperationKind::StatusTransition(change) => {
            OperationKind::StatusTransition(merge_status(change, current)?)
        }
        OperationKind::Update(delta) => OperationKind::Update(merge_delta(delta, &op, current)?),
    };

    debug!(
        op_id = %op.op_id,
        entity_id = %current.entity_id,
        base_version = current.version,
        "Operation rebased onto current version"
    );

    let mut rebased = op.rebased(current.version);
    rebased.kind = kind;
    Ok(rebased)
}

/// Status conflicts take the more-advanced lattice state
fn merge_status(change: StatusChange, current: &Entity) -> Result<StatusChange, SyncError> {
    match (change, &current.payload) {
        (StatusChange::Grievance(proposed), EntityPayload::Grievance { status, .. }) => {
            Ok(StatusChange::Grievance(proposed.max(*status)))
        }
        (StatusChange::Project(proposed), EntityPayload::Project { status, .. }) => {
            Ok(StatusChange::Project(proposed.max(*status)))
        }
        (change, payload) => Err(SyncError::Internal(format!(
            "status change kind {} against entity kind {}",
            change.kind().as_str(),
            payload.kind().as_str()
        ))),
    }
}

fn merge_delta(
    delta: EntityDelta,
    op: &Operation,
    current: &Entity,
) -> Result<EntityDelta, SyncError> {
    match (delta, &current.payload) {
        (
            EntityDelta::Project {
                name,
                progress,
                location,
                image_count,
            },
            EntityPayload::Project {
                progress: current_progress,
                ..
            },
        ) => Ok(EntityDelta::Project {
            name,
            // Monotonic progress: never regress below what the store holds
            progress: progress.map(|p| p.max(*current_progress)),
            location,
            image_count,
        }),
        (
            EntityDelta::Grievance {
                title,
                description,
                location,
                attachment,
            },
            EntityPayload::Grievance {
                description: current_description,
                ..
            },
        ) => {
            let description = description.map(|incoming| {
                merge_description(
                    current_description,
                    current.last_mutated_by.role,
                    &incoming,
                    op.actor.role,
                )
            });
            Ok(EntityDelta::Grievance {
                title,
                description,
                location,
                attachment,
            })
        }
        // Authority-only kind: citizens cannot mutate announcements, so the
        // only writers that can race here are authority sessions, and
        // re-targeting the delta is the whole policy
        (delta @ EntityDelta::Announcement { .. }, EntityPayload::Announcement { .. }) => Ok(delta),
        // Survey responses are created once and rarely edited; re-target
        (delta @ EntityDelta::SurveyResponse { .. }, EntityPayload::SurveyResponse { .. }) => {
            Ok(delta)
        }
        (delta, payload) => Err(SyncError::Internal(format!(
            "delta kind {} against entity kind {}",
            delta.kind().as_str(),
            payload.kind().as_str()
        ))),
    }
}

/// Free-text merge for grievance descriptions. An edit from the same role
/// that produced the current version wins; a cross-role conflict keeps both
/// texts, each tagged with its writer's role, for human review.
fn merge_description(
    current: &str,
    current_role: ActorRole,
    incoming: &str,
    incoming_role: ActorRole,
) -> String {
    if incoming_role == current_role || current.is_empty() {
        return incoming.to_string();
    }
    format!(
        "{} {}\n{} {}",
        provenance_marker(current_role),
        current,
        provenance_marker(incoming_role),
        incoming
    )
}

fn provenance_marker(role: ActorRole) -> &'static str {
    match role {
        ActorRole::Citizen => "[citizen]",
        ActorRole::Authority => "[authority]",
    }
}
