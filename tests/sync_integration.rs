//! Integration tests for the device/authority sync protocol
//!
//! These tests wire device engines to an authority node through the
//! in-process transport and drive connectivity transitions synthetically,
//! without any real network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use gramitra_sync::{
    Actor, ApplyOutcome, AuthorityConfig, AuthorityNode, ChangeBatch, ConnectivityMonitor,
    DeviceEngine, EntityDelta, EntityPayload, InProcessTransport, LinkState, OpState, Operation,
    Outbox, RecordStore, Replica, SubmitRequest, SyncError, Transport,
};
use gramitra_sync::model::{Cursor, GrievanceStatus, Priority, ProjectStatus, StatusChange};

async fn authority(temp: &TempDir, name: &str) -> Arc<AuthorityNode> {
    let store = Arc::new(
        RecordStore::at_path(temp.path().join(format!("{}.sled", name)))
            .await
            .unwrap(),
    );
    Arc::new(AuthorityNode::new(store, AuthorityConfig::default()))
}

async fn device(
    temp: &TempDir,
    name: &str,
    actor: Actor,
    transport: Arc<dyn Transport>,
    monitor: &ConnectivityMonitor,
) -> DeviceEngine {
    let outbox = Arc::new(
        Outbox::at_path(temp.path().join(format!("{}-outbox.sled", name)))
            .await
            .unwrap(),
    );
    DeviceEngine::new(
        actor,
        outbox,
        Arc::new(Replica::new()),
        transport,
        monitor.subscribe(),
    )
}

fn grievance_payload() -> EntityPayload {
    EntityPayload::Grievance {
        title: "Street Light Issue".into(),
        description: "Street lights not working in our area".into(),
        location: "Ward 3".into(),
        status: GrievanceStatus::Pending,
        attachment: None,
    }
}

/// Test that offline submissions accumulate and drain on reconnect
#[tokio::test]
async fn test_offline_accumulate_then_drain() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Offline);
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));
    let engine = device(&temp, "device-1", Actor::citizen("device-1"), transport, &monitor).await;

    for _ in 0..2 {
        engine
            .submit(SubmitRequest::Create(grievance_payload()))
            .await
            .unwrap();
    }
    engine
        .submit(SubmitRequest::Create(EntityPayload::SurveyResponse {
            survey_key: "water".into(),
            answers: vec![gramitra_sync::model::SurveyAnswer {
                question: 0,
                value: "intermittent".into(),
            }],
        }))
        .await
        .unwrap();

    // Offline is a mode, not an error: the queue simply holds the reports
    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 3);
    assert_eq!(node.accepted_count(), 0);

    monitor.set_online();
    engine.drain_cycle().await.unwrap();

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.outbox_len, 0);
    assert_eq!(snapshot.entities.len(), 3);
    assert!(snapshot.entities.iter().all(|e| e.version == 1));
    assert_eq!(node.accepted_count(), 3);
}

/// Draining a single device's sequence against itself can never conflict:
/// versions come out equal to the sequence position
#[tokio::test]
async fn test_self_drain_yields_sequential_versions() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));
    let engine = device(&temp, "device-1", Actor::citizen("device-1"), transport, &monitor).await;

    let (entity_id, _) = engine.submit_create(grievance_payload()).await.unwrap();
    // Later ops assume all earlier queued ops already applied
    engine
        .submit(SubmitRequest::Update(
            entity_id,
            EntityDelta::Grievance {
                title: None,
                description: Some("Now the whole street is dark at night".into()),
                location: None,
                attachment: None,
            },
        ))
        .await
        .unwrap();
    engine
        .submit(SubmitRequest::StatusTransition(
            entity_id,
            StatusChange::Grievance(GrievanceStatus::InProgress),
        ))
        .await
        .unwrap();

    engine.drain_cycle().await.unwrap();

    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 0);
    let entity = node.get(&entity_id).unwrap().unwrap();
    assert_eq!(entity.version, 3);
    assert_eq!(engine.replica().version_of(&entity_id).await, 3);
}

/// The §8-style two-writer grievance race: an authority status transition
/// and a citizen description edit, both based on version 1, converge to
/// version 3 with the advanced status and a provenance-marked merge
#[tokio::test]
async fn test_concurrent_grievance_edits_converge() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));

    let citizen = device(
        &temp,
        "device-1",
        Actor::citizen("device-1"),
        Arc::clone(&transport),
        &monitor,
    )
    .await;
    let officer = device(
        &temp,
        "officer-1",
        Actor::authority("officer-1"),
        Arc::clone(&transport),
        &monitor,
    )
    .await;

    // Citizen files the grievance and syncs it
    let (entity_id, _) = citizen.submit_create(grievance_payload()).await.unwrap();
    citizen.drain_cycle().await.unwrap();

    // Officer's replica catches up to version 1
    officer.drain_cycle().await.unwrap();
    assert_eq!(officer.replica().version_of(&entity_id).await, 1);

    // Both produce operations based on version 1, offline from each other
    officer
        .submit(SubmitRequest::StatusTransition(
            entity_id,
            StatusChange::Grievance(GrievanceStatus::InProgress),
        ))
        .await
        .unwrap();
    citizen
        .submit(SubmitRequest::Update(
            entity_id,
            EntityDelta::Grievance {
                title: None,
                description: Some("Now the whole street is dark at night".into()),
                location: None,
                attachment: None,
            },
        ))
        .await
        .unwrap();

    officer.drain_cycle().await.unwrap();
    citizen.drain_cycle().await.unwrap();

    let entity = node.get(&entity_id).unwrap().unwrap();
    assert_eq!(entity.version, 3);
    match &entity.payload {
        EntityPayload::Grievance {
            status,
            description,
            ..
        } => {
            assert_eq!(*status, GrievanceStatus::InProgress);
            assert!(description.contains("[authority] Street lights not working in our area"));
            assert!(description.contains("[citizen] Now the whole street is dark at night"));
        }
        _ => panic!("kind changed"),
    }
    // Nothing left queued, nothing parked
    let snapshot = citizen.snapshot().await.unwrap();
    assert_eq!(snapshot.outbox_len, 0);
    assert!(snapshot.needs_review.is_empty());
}

/// Project progress resolves to the maximum proposal regardless of which
/// writer reaches the store first
#[tokio::test]
async fn test_project_progress_max_wins_either_order() {
    for first_is_larger in [true, false] {
        let temp = TempDir::new().unwrap();
        let node = authority(&temp, "records").await;
        let monitor = ConnectivityMonitor::new(LinkState::Online);
        let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));

        let (entity_id, _) = node
            .publish(
                Actor::authority("engineer-1"),
                EntityPayload::Project {
                    name: "Road Construction - Main Street".into(),
                    progress: 40,
                    status: ProjectStatus::InProgress,
                    location: "Village Center".into(),
                    image_count: 3,
                },
            )
            .await
            .unwrap();

        let dev_a = device(
            &temp,
            "engineer-2",
            Actor::authority("engineer-2"),
            Arc::clone(&transport),
            &monitor,
        )
        .await;
        let dev_b = device(
            &temp,
            "engineer-3",
            Actor::authority("engineer-3"),
            Arc::clone(&transport),
            &monitor,
        )
        .await;
        dev_a.drain_cycle().await.unwrap();
        dev_b.drain_cycle().await.unwrap();

        let progress_update = |p: u8| {
            SubmitRequest::Update(
                entity_id,
                EntityDelta::Project {
                    name: None,
                    progress: Some(p),
                    location: None,
                    image_count: None,
                },
            )
        };
        let (first, second) = if first_is_larger { (55, 30) } else { (30, 55) };
        dev_a.submit(progress_update(first)).await.unwrap();
        dev_b.submit(progress_update(second)).await.unwrap();

        dev_a.drain_cycle().await.unwrap();
        dev_b.drain_cycle().await.unwrap();

        let entity = node.get(&entity_id).unwrap().unwrap();
        assert_eq!(entity.version, 3);
        match entity.payload {
            EntityPayload::Project { progress, .. } => assert_eq!(progress, 55),
            _ => panic!("kind changed"),
        }
    }
}

/// Transport that applies the push but drops the acknowledgement once,
/// simulating connectivity loss mid-submission
struct AckDroppingTransport {
    node: Arc<AuthorityNode>,
    drop_next_ack: AtomicBool,
}

#[async_trait]
impl Transport for AckDroppingTransport {
    async fn push_operation(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        let outcome = self.node.apply(op).await?;
        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(SyncError::TransportUnavailable(
                "connection dropped before acknowledgement".into(),
            ));
        }
        Ok(outcome)
    }

    async fn pull_changes(&self, cursor: Cursor) -> Result<ChangeBatch, SyncError> {
        self.node.changes_since(cursor)
    }
}

/// Losing the acknowledgement and replaying the same op_id produces the
/// identical end state as an uninterrupted submission
#[tokio::test]
async fn test_replay_after_lost_ack_has_one_effect() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);
    let transport = Arc::new(AckDroppingTransport {
        node: Arc::clone(&node),
        drop_next_ack: AtomicBool::new(true),
    });
    let engine = device(&temp, "device-1", Actor::citizen("device-1"), transport, &monitor).await;

    let (entity_id, op_id) = engine.submit_create(grievance_payload()).await.unwrap();

    // First drain: the store applied the op, but the ack was lost, so the
    // operation stays queued
    engine.drain_cycle().await.unwrap();
    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 1);
    assert_eq!(
        engine.outbox().state_of(&op_id).unwrap(),
        Some(OpState::Queued)
    );
    assert_eq!(node.accepted_count(), 1);

    // Second drain replays the same op_id verbatim; the recorded result
    // comes back and state mutates exactly once
    engine.drain_cycle().await.unwrap();
    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 0);
    assert_eq!(node.accepted_count(), 1);

    let entity = node.get(&entity_id).unwrap().unwrap();
    assert_eq!(entity.version, 1);
    assert_eq!(engine.replica().version_of(&entity_id).await, 1);
}

/// Transport that advances the entity by an authority write before every
/// push, so each submission attempt finds a newer version than it based on
struct RacingTransport {
    node: Arc<AuthorityNode>,
}

#[async_trait]
impl Transport for RacingTransport {
    async fn push_operation(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        self.node
            .transition_status(
                Actor::authority("collector-office"),
                op.entity_id,
                StatusChange::Grievance(GrievanceStatus::InProgress),
            )
            .await?;
        self.node.apply(op).await
    }

    async fn pull_changes(&self, cursor: Cursor) -> Result<ChangeBatch, SyncError> {
        self.node.changes_since(cursor)
    }
}

/// An operation whose rebase retry conflicts again is parked for manual
/// review within the same drain cycle, never retried indefinitely
#[tokio::test]
async fn test_double_conflict_parks_for_review() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);

    // Seed the grievance through a well-behaved transport
    let seed: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));
    let seeder = device(&temp, "device-0", Actor::citizen("device-0"), seed, &monitor).await;
    let (entity_id, _) = seeder.submit_create(grievance_payload()).await.unwrap();
    seeder.drain_cycle().await.unwrap();

    let racing = Arc::new(RacingTransport {
        node: Arc::clone(&node),
    });
    let engine = device(&temp, "device-1", Actor::citizen("device-1"), racing, &monitor).await;
    engine.drain_cycle().await.unwrap(); // pull version 1

    let op_id = engine
        .submit(SubmitRequest::Update(
            entity_id,
            EntityDelta::Grievance {
                title: None,
                description: Some("It is still broken".into()),
                location: None,
                attachment: None,
            },
        ))
        .await
        .unwrap();

    // One drain cycle: first attempt conflicts, the rebase retry conflicts
    // again, and the op is parked - the cycle terminates
    engine.drain_cycle().await.unwrap();

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.needs_review.len(), 1);
    assert_eq!(snapshot.needs_review[0].op_id, op_id);
    assert_eq!(
        engine.outbox().state_of(&op_id).unwrap(),
        Some(OpState::NeedsManualReview)
    );
    // The citizen's text was never accepted behind their back
    let entity = node.get(&entity_id).unwrap().unwrap();
    match entity.payload {
        EntityPayload::Grievance { description, .. } => {
            assert_eq!(description, "Street lights not working in our area")
        }
        _ => panic!("kind changed"),
    }
}

/// Authority-issued updates reach subscribed device replicas without polling
#[tokio::test]
async fn test_broadcast_reaches_device_replica() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));
    let engine = Arc::new(
        device(&temp, "device-1", Actor::citizen("device-1"), transport, &monitor).await,
    );

    let pushes = node.subscribe();
    let push_consumer = Arc::clone(&engine);
    tokio::spawn(async move {
        push_consumer.consume_pushes(pushes).await;
    });

    let mut changed = engine.replica().subscribe();
    let (entity_id, _) = node
        .publish(
            Actor::authority("collector-office"),
            EntityPayload::Announcement {
                title: "Water Supply Maintenance".into(),
                body: "Scheduled maintenance on January 18th from 10 AM to 2 PM".into(),
                priority: Priority::Medium,
            },
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), changed.changed())
        .await
        .expect("replica never saw the broadcast")
        .unwrap();

    let entity = engine.replica().get(&entity_id).await.unwrap();
    assert_eq!(entity.version, 1);
    match entity.payload {
        EntityPayload::Announcement { priority, .. } => assert_eq!(priority, Priority::Medium),
        _ => panic!("kind changed"),
    }
}

/// A connectivity-lost event between drains leaves queued work untouched;
/// the next online drain completes it
#[tokio::test]
async fn test_drain_cycle_respects_offline() {
    let temp = TempDir::new().unwrap();
    let node = authority(&temp, "records").await;
    let monitor = ConnectivityMonitor::new(LinkState::Online);
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(Arc::clone(&node)));
    let engine = device(&temp, "device-1", Actor::citizen("device-1"), transport, &monitor).await;

    engine
        .submit(SubmitRequest::Create(grievance_payload()))
        .await
        .unwrap();

    monitor.set_offline();
    engine.drain_cycle().await.unwrap();
    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 1);
    assert_eq!(node.accepted_count(), 0);

    monitor.set_online();
    engine.drain_cycle().await.unwrap();
    assert_eq!(engine.snapshot().await.unwrap().outbox_len, 0);
    assert_eq!(node.accepted_count(), 1);
}
