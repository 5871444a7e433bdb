//! Control Plane Integration Tests
//!
//! Drives the scheduler, reconciler, registry and store together against
//! simulated node agents:
//! - Volume lifecycle: create, delete, rollback and retries
//! - Publish / unpublish
//! - Repair of volumes after node failures
//! - Pool administration
//! - Persistence across restarts
//! - REST inventory and node ingress

mod common;

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use tokio_test::assert_ok;

use common::{test_config, Harness, GIB};
use couchestor_cp::bus::protocol::AgentErrorKind;
use couchestor_cp::domain::events::DomainEvent;
use couchestor_cp::domain::model::{
    NexusState, NodeId, PoolId, Replica, ReplicaState, Volume, VolumeId, VolumeSpec, VolumeState,
};
use couchestor_cp::Error;

async fn create(harness: &Harness, name: &str, size: u64, replicas: usize) -> Volume {
    harness
        .scheduler()
        .create_volume(VolumeSpec::new(name, size, replicas))
        .await
        .expect("create should succeed")
}

fn replica_nodes(harness: &Harness, volume: &VolumeId) -> BTreeSet<NodeId> {
    harness
        .snapshot()
        .replicas_of(volume)
        .into_iter()
        .map(|r| r.node.clone())
        .collect()
}

/// Node hosting the volume's nexus.
fn nexus_node(harness: &Harness, volume: &VolumeId) -> NodeId {
    harness
        .snapshot()
        .nexus_of(volume)
        .map(|n| n.node.clone())
        .expect("volume should have a nexus")
}

/// A replica node that does not host the nexus.
fn replica_only_node(harness: &Harness, volume: &VolumeId) -> NodeId {
    let host = nexus_node(harness, volume);
    replica_nodes(harness, volume)
        .into_iter()
        .find(|n| n != &host)
        .expect("volume should have a replica away from its nexus")
}

// =============================================================================
// Volume Lifecycle
// =============================================================================

mod volume_lifecycle_tests {
    use super::*;
    use couchestor_cp::adapters::MemoryBackend;
    use couchestor_cp::bus::Command;
    use couchestor_cp::domain::ports::PersistedState;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_places_replicas_on_distinct_nodes() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;

        assert_eq!(volume.state, VolumeState::Online);
        assert_eq!(volume.size, GIB);

        let snapshot = harness.snapshot();
        let replicas = snapshot.replicas_of(&volume.id);
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.state == ReplicaState::Online));
        assert_eq!(replica_nodes(&harness, &volume.id).len(), 2);

        let nexus = snapshot.nexus_of(&volume.id).expect("nexus");
        assert_eq!(volume.nexus.as_ref(), Some(&nexus.id));
        assert_eq!(nexus.children.len(), 2);
        assert!(replicas.iter().all(|r| nexus.has_child(&r.id)));
        assert!(replica_nodes(&harness, &volume.id).contains(&nexus.node));

        let host = harness.node(nexus.node.as_str());
        assert_eq!(host.nexus_children(&nexus.id).map(|c| c.len()), Some(2));

        // Pool accounting covers both replicas
        let used: u64 = snapshot.pools().map(|p| p.used).sum();
        assert_eq!(used, 2 * GIB);
        assert_eq!(harness.events.count("VolumeCreated"), 1);
        assert_eq!(harness.events.count("ReplicaAdded"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_command_is_resent() {
        let timed_out = Arc::new(AtomicBool::new(false));
        let harness = Harness::intercepted(2, {
            let timed_out = timed_out.clone();
            move |command| match command {
                Command::CreateNexus { .. } if !timed_out.swap(true, Ordering::SeqCst) => {
                    Some(Error::Timeout {
                        node: "node-1".into(),
                        timeout_ms: 1000,
                    })
                }
                _ => None,
            }
        })
        .await;

        let volume = create(&harness, "pvc-1", GIB, 2).await;
        assert!(timed_out.load(Ordering::SeqCst));
        assert_eq!(volume.state, VolumeState::Online);

        // The lost attempt never reached the agent; the resend did
        let nexus_creates: usize = harness
            .transport
            .nodes()
            .iter()
            .map(|n| {
                n.received()
                    .iter()
                    .filter(|c| matches!(c, Command::CreateNexus { .. }))
                    .count()
            })
            .sum();
        assert_eq!(nexus_creates, 1);
        assert_eq!(harness.snapshot().replicas_of(&volume.id).len(), 2);
        assert_eq!(harness.events.count("VolumeCreated"), 1);
    }

    #[tokio::test]
    async fn test_replica_records_saved_before_agents_create_them() {
        let backend = Arc::new(MemoryBackend::new());
        let at_first_create: Arc<Mutex<Option<PersistedState>>> = Arc::new(Mutex::new(None));
        let harness = Harness::intercepted_with(3, backend.clone(), {
            let at_first_create = at_first_create.clone();
            move |command| {
                if let Command::CreateReplica { .. } = command {
                    let mut seen = at_first_create.lock();
                    if seen.is_none() {
                        *seen = backend.saved();
                    }
                }
                None
            }
        })
        .await;
        let tasks = assert_ok!(harness.control_plane.start());

        let volume = create(&harness, "pvc-1", GIB, 2).await;

        let saved = at_first_create
            .lock()
            .take()
            .expect("state saved before the first replica was created");
        let stored: Vec<_> = saved
            .replicas
            .iter()
            .filter(|r| r.volume == volume.id)
            .collect();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.state == ReplicaState::Creating));

        // The acknowledged volume is durable
        let saved = harness.backend.saved().expect("state saved");
        assert_eq!(
            saved.volumes.iter().find(|v| v.id == volume.id).map(|v| v.state),
            Some(VolumeState::Online)
        );
        assert_ok!(harness.control_plane.shutdown(tasks).await);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_name() {
        let harness = Harness::with_nodes(3).await;
        let first = create(&harness, "pvc-1", GIB, 2).await;
        let second = create(&harness, "pvc-1", GIB, 2).await;

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, VolumeId::from_name("pvc-1"));
        let snapshot = harness.snapshot();
        assert_eq!(snapshot.volumes().count(), 1);
        assert_eq!(snapshot.replicas().count(), 2);
        assert_eq!(harness.events.count("VolumeCreated"), 1);

        let conflicting = harness
            .scheduler()
            .create_volume(VolumeSpec::new("pvc-1", 2 * GIB, 2))
            .await;
        assert_matches!(conflicting, Err(Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec() {
        let harness = Harness::with_nodes(1).await;
        let scheduler = harness.scheduler();

        assert_matches!(
            scheduler.create_volume(VolumeSpec::new("", GIB, 1)).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            scheduler.create_volume(VolumeSpec::new("pvc-1", 0, 1)).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            scheduler.create_volume(VolumeSpec::new("pvc-1", GIB, 0)).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(harness.snapshot().volumes().count(), 0);
    }

    #[tokio::test]
    async fn test_create_without_capacity_leaves_nothing_behind() {
        let harness = Harness::with_nodes(2).await;
        let result = harness
            .scheduler()
            .create_volume(VolumeSpec::new("too-big", 20 * GIB, 1))
            .await;

        assert_matches!(result, Err(Error::InsufficientResources(_)));
        let snapshot = harness.snapshot();
        assert_eq!(snapshot.volumes().count(), 0);
        assert_eq!(snapshot.replicas().count(), 0);
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn test_create_retries_away_from_failing_node() {
        let harness = Harness::with_nodes(3).await;
        harness
            .node("node-1")
            .fail_command("create_replica", AgentErrorKind::Internal);

        let volume = create(&harness, "pvc-1", GIB, 2).await;

        assert_eq!(volume.state, VolumeState::Online);
        let nodes = replica_nodes(&harness, &volume.id);
        assert_eq!(
            nodes,
            BTreeSet::from([NodeId::new("node-2"), NodeId::new("node-3")])
        );
        assert!(harness.node("node-1").replica_ids().is_empty());
        harness.assert_no_orphans();
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_placement_is_exhausted() {
        let harness = Harness::with_nodes(2).await;
        harness
            .node("node-2")
            .fail_command("create_replica", AgentErrorKind::Internal);

        let result = harness
            .scheduler()
            .create_volume(VolumeSpec::new("pvc-1", GIB, 2))
            .await;

        assert_matches!(result, Err(Error::InsufficientResources(_)));
        let snapshot = harness.snapshot();
        assert!(snapshot.volume(&VolumeId::from_name("pvc-1")).is_none());
        assert_eq!(snapshot.replicas().count(), 0);
        assert_eq!(snapshot.nexuses().count(), 0);
        assert!(snapshot.pools().all(|p| p.used == 0));
        assert!(harness.node("node-1").replica_ids().is_empty());
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_nexus_fails() {
        let harness = Harness::with_nodes(3).await;
        for node in harness.transport.nodes() {
            node.fail_command("create_nexus", AgentErrorKind::Internal);
        }

        let result = harness
            .scheduler()
            .create_volume(VolumeSpec::new("pvc-1", GIB, 2))
            .await;

        assert_matches!(result, Err(Error::NodeRejected { .. }));
        let snapshot = harness.snapshot();
        assert_eq!(snapshot.volumes().count(), 0);
        assert_eq!(snapshot.replicas().count(), 0);
        assert_eq!(snapshot.nexuses().count(), 0);
        for node in harness.transport.nodes() {
            assert!(node.replica_ids().is_empty());
        }
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;

        assert_ok!(harness.scheduler().delete_volume(&volume.id).await);

        let snapshot = harness.snapshot();
        assert!(snapshot.volume(&volume.id).is_none());
        assert_eq!(snapshot.replicas().count(), 0);
        assert_eq!(snapshot.nexuses().count(), 0);
        assert!(snapshot.pools().all(|p| p.used == 0));
        for node in harness.transport.nodes() {
            assert!(node.replica_ids().is_empty());
            assert!(node.nexus_ids().is_empty());
            assert!(node.pool_reports().iter().all(|p| p.used == 0));
        }
        assert_eq!(harness.events.count("VolumeDeleted"), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_volume_has_no_side_effects() {
        let harness = Harness::with_nodes(2).await;
        let revision = harness.control_plane.store().revision();

        assert_ok!(
            harness
                .scheduler()
                .delete_volume(&VolumeId::new("never-created"))
                .await
        );
        assert_eq!(harness.control_plane.store().revision(), revision);
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_create_and_delete_leave_no_orphans() {
        let harness = Harness::with_nodes(3).await;
        let scheduler = harness.scheduler();

        for i in 0..5 {
            let name = format!("pvc-{}", i);
            let id = VolumeId::from_name(&name);
            let (created, deleted) = tokio::join!(
                scheduler.create_volume(VolumeSpec::new(name.clone(), GIB, 2)),
                scheduler.delete_volume(&id),
            );
            assert_ok!(deleted);
            if let Err(e) = created {
                assert_matches!(e, Error::Cancelled(_));
            }
        }

        harness.control_plane.reconciler().tick().await;
        harness.assert_no_orphans();

        let snapshot = harness.snapshot();
        for volume in snapshot.volumes() {
            assert_eq!(volume.state, VolumeState::Online);
            assert_eq!(snapshot.replicas_of(&volume.id).len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_with_offline_node_finishes_when_it_returns() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let victim = replica_only_node(&harness, &volume.id);

        harness.take_offline(victim.as_str()).await;
        assert_ok!(harness.scheduler().delete_volume(&volume.id).await);

        // The replica on the silent node cannot be destroyed yet
        let pending = harness.volume(&volume.id).expect("volume pending cleanup");
        assert_eq!(pending.state, VolumeState::Destroying);
        let leftovers: Vec<Replica> = harness
            .snapshot()
            .replicas_of(&volume.id)
            .into_iter()
            .cloned()
            .collect();
        assert_eq!(leftovers.len(), 1);
        assert_eq!(leftovers[0].node, victim);
        assert_eq!(leftovers[0].state, ReplicaState::Destroying);

        harness.control_plane.reconciler().tick().await;
        assert!(harness.volume(&volume.id).is_some());

        harness.node(victim.as_str()).set_reachable(true);
        harness.register_all().await;
        harness.control_plane.reconciler().tick().await;

        assert!(harness.volume(&volume.id).is_none());
        assert!(harness.node(victim.as_str()).replica_ids().is_empty());
        harness.assert_no_orphans();
    }
}

// =============================================================================
// Publish / Unpublish
// =============================================================================

mod publish_tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_is_idempotent_and_exclusive() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let scheduler = harness.scheduler();

        let uri = assert_ok!(scheduler.publish_volume(&volume.id, "worker-1").await);
        assert!(uri.starts_with("nvmf://"));
        let again = assert_ok!(scheduler.publish_volume(&volume.id, "worker-1").await);
        assert_eq!(uri, again);

        assert_matches!(
            scheduler.publish_volume(&volume.id, "worker-2").await,
            Err(Error::FailedPrecondition(_))
        );

        let stored = harness.volume(&volume.id).expect("volume");
        let publication = stored.publication.expect("publication");
        assert_eq!(publication.node, "worker-1");
        assert_eq!(publication.uri, uri);

        let nexus = harness
            .snapshot()
            .nexus_of(&volume.id)
            .cloned()
            .expect("nexus");
        assert_eq!(nexus.share_uri.as_deref(), Some(uri.as_str()));
        assert!(harness.node(nexus.node.as_str()).is_shared(&nexus.id));
        assert_eq!(harness.events.count("VolumePublished"), 1);
    }

    #[tokio::test]
    async fn test_unpublish_clears_share() {
        let harness = Harness::with_nodes(2).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let scheduler = harness.scheduler();
        assert_ok!(scheduler.publish_volume(&volume.id, "worker-1").await);

        // A different node's unpublish does not touch the publication
        assert_ok!(scheduler.unpublish_volume(&volume.id, "worker-2").await);
        assert!(harness.volume(&volume.id).unwrap().publication.is_some());

        assert_ok!(scheduler.unpublish_volume(&volume.id, "worker-1").await);
        assert_ok!(scheduler.unpublish_volume(&volume.id, "worker-1").await);

        assert!(harness.volume(&volume.id).unwrap().publication.is_none());
        let nexus = harness
            .snapshot()
            .nexus_of(&volume.id)
            .cloned()
            .expect("nexus");
        assert!(nexus.share_uri.is_none());
        assert!(!harness.node(nexus.node.as_str()).is_shared(&nexus.id));
        assert_eq!(harness.events.count("VolumeUnpublished"), 1);

        // Another node can take it over now
        assert_ok!(scheduler.publish_volume(&volume.id, "worker-2").await);
    }

    #[tokio::test]
    async fn test_publish_unknown_volume_is_not_found() {
        let harness = Harness::with_nodes(1).await;
        assert_matches!(
            harness
                .scheduler()
                .publish_volume(&VolumeId::new("missing"), "worker-1")
                .await,
            Err(Error::NotFound { .. })
        );
        assert_ok!(
            harness
                .scheduler()
                .unpublish_volume(&VolumeId::new("missing"), "worker-1")
                .await
        );
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

mod reconcile_tests {
    use super::*;
    use couchestor_cp::domain::model::Pool;
    use couchestor_cp::store::Txn;

    #[tokio::test(start_paused = true)]
    async fn test_replica_node_failure_is_repaired() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let victim = replica_only_node(&harness, &volume.id);

        harness.take_offline(victim.as_str()).await;
        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 5).await);

        let snapshot = harness.snapshot();
        let nexus = snapshot.nexus_of(&volume.id).expect("nexus");
        assert_eq!(nexus.children.len(), 2);
        let serving: BTreeSet<NodeId> = nexus
            .children
            .iter()
            .filter_map(|c| snapshot.replica(c))
            .map(|r| r.node.clone())
            .collect();
        assert_eq!(serving.len(), 2);
        assert!(!serving.contains(&victim));

        assert!(harness.events.count("ReplicaFaulted") >= 1);
        assert_eq!(harness.events.count("RebuildStarted"), 1);
        assert_eq!(harness.events.count("RebuildCompleted"), 1);
        // Online -> Degraded -> Online
        assert!(harness.events.count("VolumeStateChanged") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returning_node_loses_its_retired_replica() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let victim = replica_only_node(&harness, &volume.id);

        harness.take_offline(victim.as_str()).await;
        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 5).await);
        assert!(!harness.node(victim.as_str()).replica_ids().is_empty());

        harness.node(victim.as_str()).set_reachable(true);
        harness.register_all().await;
        harness.control_plane.reconciler().tick().await;

        assert!(harness.node(victim.as_str()).replica_ids().is_empty());
        assert_eq!(harness.snapshot().replicas_of(&volume.id).len(), 2);
        assert_eq!(harness.volume(&volume.id).unwrap().state, VolumeState::Online);
        harness.assert_no_orphans();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nexus_host_failure_recreates_and_reshares_nexus() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let old_uri = assert_ok!(
            harness
                .scheduler()
                .publish_volume(&volume.id, "worker-1")
                .await
        );
        let victim = nexus_node(&harness, &volume.id);

        harness.take_offline(victim.as_str()).await;
        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 5).await);

        let stored = harness.volume(&volume.id).expect("volume");
        let nexus = harness
            .snapshot()
            .nexus_of(&volume.id)
            .cloned()
            .expect("nexus");
        assert_ne!(nexus.node, victim);
        assert_eq!(stored.nexus.as_ref(), Some(&nexus.id));
        assert!(harness.node(nexus.node.as_str()).is_shared(&nexus.id));

        let publication = stored.publication.expect("still published");
        assert_eq!(publication.node, "worker-1");
        assert_ne!(publication.uri, old_uri);
        assert_eq!(nexus.share_uri.as_deref(), Some(publication.uri.as_str()));
        assert_eq!(harness.events.count("NexusRecreated"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nexus_host_failure_degrades_without_faulting() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let victim = nexus_node(&harness, &volume.id);

        harness.take_offline(victim.as_str()).await;
        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 5).await);

        let transitions: Vec<(String, String)> = harness
            .events
            .events_of_type("VolumeStateChanged")
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::VolumeStateChanged {
                    old_state,
                    new_state,
                    ..
                } => Some((old_state, new_state)),
                _ => None,
            })
            .collect();
        assert!(!transitions.is_empty());
        assert_eq!(transitions[0], ("Online".to_string(), "Degraded".to_string()));
        assert!(transitions.iter().all(|(_, to)| to != "Faulted"));

        let nexus = harness.snapshot().nexus_of(&volume.id).cloned().expect("nexus");
        assert_ne!(nexus.node, victim);
        assert_eq!(nexus.state, NexusState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_spans_several_ticks() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        for node in harness.transport.nodes() {
            node.set_rebuild_step(2);
        }
        let victim = replica_only_node(&harness, &volume.id);
        harness.take_offline(victim.as_str()).await;

        harness.control_plane.reconciler().tick().await;
        assert_eq!(harness.volume(&volume.id).unwrap().state, VolumeState::Degraded);
        let snapshot = harness.snapshot();
        let rebuilding: Vec<&Replica> = snapshot
            .replicas_of(&volume.id)
            .into_iter()
            .filter(|r| r.rebuilding)
            .collect();
        assert_eq!(rebuilding.len(), 1);
        assert!(!snapshot
            .nexus_of(&volume.id)
            .unwrap()
            .has_child(&rebuilding[0].id));

        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 10).await);
        assert_eq!(harness.events.count("RebuildStarted"), 1);
        assert_eq!(harness.events.count("RebuildCompleted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rebuild_discards_replacement() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let host = nexus_node(&harness, &volume.id);
        harness.node(host.as_str()).fail_rebuilds(true);
        let victim = replica_only_node(&harness, &volume.id);
        harness.take_offline(victim.as_str()).await;

        harness.control_plane.reconciler().tick().await;

        assert_eq!(harness.volume(&volume.id).unwrap().state, VolumeState::Degraded);
        assert_eq!(harness.events.count("RebuildFailed"), 1);
        let spare = harness
            .transport
            .nodes()
            .into_iter()
            .find(|n| n.id() != &host && n.id() != &victim)
            .expect("third node");
        assert!(spare.replica_ids().is_empty());
        assert!(harness
            .snapshot()
            .replicas_of(&volume.id)
            .iter()
            .all(|r| !r.rebuilding));

        harness.node(host.as_str()).fail_rebuilds(false);
        assert!(harness.reconcile_until(&volume.id, VolumeState::Online, 5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_stays_degraded_without_spare_node() {
        let harness = Harness::with_nodes(2).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;
        let victim = replica_only_node(&harness, &volume.id);
        harness.take_offline(victim.as_str()).await;

        for _ in 0..3 {
            harness.control_plane.reconciler().tick().await;
        }
        assert_eq!(harness.volume(&volume.id).unwrap().state, VolumeState::Degraded);
        assert_eq!(harness.events.count("RebuildStarted"), 0);
    }

    #[tokio::test]
    async fn test_orphaned_replica_records_are_swept() {
        let harness = Harness::with_nodes(1).await;
        let pool: Pool = harness
            .snapshot()
            .pool(&PoolId::new("pool-1"))
            .cloned()
            .expect("pool");
        let orphan = Replica::new(VolumeId::new("ghost"), &pool, GIB);
        let mut txn = Txn::new();
        txn.put_replica(orphan.clone());
        assert_ok!(harness.control_plane.store().commit(txn));

        let summary = harness.control_plane.reconciler().tick().await;

        assert_eq!(summary.reconciled, 1);
        assert!(harness.snapshot().replica(&orphan.id).is_none());
        assert!(harness
            .node("node-1")
            .received()
            .iter()
            .any(|c| c.name() == "destroy_replica"));
    }

    #[tokio::test]
    async fn test_busy_volume_is_skipped() {
        let harness = Harness::with_nodes(2).await;
        let volume = create(&harness, "pvc-1", GIB, 1).await;

        let guard = assert_ok!(harness.control_plane.locks().lock(&volume.id).await);
        let summary = harness.control_plane.reconciler().tick().await;
        assert_eq!(summary.skipped, 1);
        drop(guard);

        let summary = harness.control_plane.reconciler().tick().await;
        assert_eq!(summary.reconciled, 1);
    }
}

// =============================================================================
// Pools
// =============================================================================

mod pool_tests {
    use super::*;
    use couchestor_cp::adapters::loopback::SIMULATED_DISK_CAPACITY;

    #[tokio::test]
    async fn test_create_and_destroy_pool() {
        let harness = Harness::with_nodes(2).await;
        let scheduler = harness.scheduler();
        let node = NodeId::new("node-1");
        let id = PoolId::new("pool-extra");
        let disks = vec!["/dev/nvme1n1".to_string()];

        let pool = assert_ok!(scheduler.create_pool(&node, &id, &disks).await);
        assert_eq!(pool.node, node);
        assert_eq!(pool.capacity, SIMULATED_DISK_CAPACITY);
        assert_eq!(pool.disks, disks);

        // Same node is idempotent, another node conflicts
        assert_ok!(scheduler.create_pool(&node, &id, &disks).await);
        assert_matches!(
            scheduler
                .create_pool(&NodeId::new("node-2"), &id, &disks)
                .await,
            Err(Error::AlreadyExists { .. })
        );

        assert_ok!(scheduler.destroy_pool(&id).await);
        assert!(harness.snapshot().pool(&id).is_none());
        assert!(harness
            .node("node-1")
            .pool_reports()
            .iter()
            .all(|p| p.id != id));
        assert_ok!(scheduler.destroy_pool(&id).await);

        assert_eq!(harness.events.count("PoolCreated"), 1);
        assert_eq!(harness.events.count("PoolDestroyed"), 1);
    }

    #[tokio::test]
    async fn test_destroy_pool_hosting_replicas_fails() {
        let harness = Harness::with_nodes(1).await;
        create(&harness, "pvc-1", GIB, 1).await;

        assert_matches!(
            harness
                .scheduler()
                .destroy_pool(&PoolId::new("pool-1"))
                .await,
            Err(Error::FailedPrecondition(_))
        );
        assert!(harness.snapshot().pool(&PoolId::new("pool-1")).is_some());
    }

    #[tokio::test]
    async fn test_create_pool_on_unknown_node_fails() {
        let harness = Harness::with_nodes(1).await;
        assert_matches!(
            harness
                .scheduler()
                .create_pool(&NodeId::new("ghost"), &PoolId::new("p"), &[])
                .await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_capacity_reflects_registered_pools() {
        let harness = Harness::with_nodes(3).await;
        let scheduler = harness.scheduler();
        assert_eq!(scheduler.available_capacity(), 30 * GIB);
        assert_eq!(scheduler.max_volume_size(), 10 * GIB);

        create(&harness, "pvc-1", 4 * GIB, 2).await;
        assert_eq!(scheduler.available_capacity(), 22 * GIB);
        assert_eq!(scheduler.max_volume_size(), 10 * GIB);
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence_tests {
    use super::*;
    use couchestor_cp::domain::model::NodeState;
    use couchestor_cp::ControlPlane;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_state_survives_restart() {
        let harness = Harness::with_nodes(3).await;
        let tasks = assert_ok!(harness.control_plane.start());
        assert!(harness.control_plane.is_ready());

        let volume = create(&harness, "pvc-1", GIB, 2).await;
        assert_ok!(
            harness
                .scheduler()
                .publish_volume(&volume.id, "worker-1")
                .await
        );
        assert_ok!(harness.control_plane.shutdown(tasks).await);
        assert!(!harness.control_plane.is_ready());

        // The final save holds the last committed revision
        let saved = harness.backend.saved().expect("state saved");
        assert_eq!(saved, harness.snapshot().to_persisted());
        assert_eq!(saved.volumes.len(), 1);
        assert_eq!(saved.replicas.len(), 2);

        // Restart against the same agents and backend, nodes not yet back
        let events = Arc::new(couchestor_cp::adapters::InMemoryEventCollector::new());
        let restarted = assert_ok!(
            ControlPlane::load(
                test_config(),
                harness.transport.clone(),
                harness.backend.clone(),
                events,
            )
            .await
        );
        let node = assert_ok!(restarted.registry().get_node(&NodeId::new("node-1")));
        assert_eq!(node.state, NodeState::Unknown);

        let snapshot = restarted.store().snapshot();
        let stored = snapshot.volume(&volume.id).expect("volume restored");
        assert_eq!(stored.state, VolumeState::Online);
        assert_eq!(stored.publication.as_ref().map(|p| p.node.as_str()), Some("worker-1"));

        // Unknown nodes are not treated as failed
        restarted.reconciler().tick().await;
        let snapshot = restarted.store().snapshot();
        assert_eq!(snapshot.volume(&volume.id).unwrap().state, VolumeState::Online);
        assert_eq!(snapshot.replicas_of(&volume.id).len(), 2);
    }

    #[tokio::test]
    async fn test_restarted_agents_must_register_before_placement() {
        let harness = Harness::with_nodes(3).await;
        let tasks = assert_ok!(harness.control_plane.start());
        create(&harness, "pvc-1", GIB, 2).await;
        assert_ok!(harness.control_plane.shutdown(tasks).await);

        let events = Arc::new(couchestor_cp::adapters::InMemoryEventCollector::new());
        let restarted = assert_ok!(
            ControlPlane::load(
                test_config(),
                harness.transport.clone(),
                harness.backend.clone(),
                events,
            )
            .await
        );

        // Heartbeats alone cannot bring back a node with no known endpoint
        for node in harness.transport.nodes() {
            assert_matches!(
                restarted.apply_node_event(&node.heartbeat_event()).await,
                Err(Error::NotFound { .. })
            );
        }
        assert!(restarted.registry().online_nodes().is_empty());
        assert_matches!(
            restarted
                .scheduler()
                .create_volume(VolumeSpec::new("pvc-2", GIB, 2))
                .await,
            Err(Error::InsufficientResources(_))
        );

        for node in harness.transport.nodes() {
            assert_ok!(restarted.apply_node_event(&node.register_event()).await);
            assert_ok!(restarted.apply_node_event(&node.heartbeat_event()).await);
            assert!(restarted.bus().endpoint(node.id()).is_some());
        }
        let volume = assert_ok!(
            restarted
                .scheduler()
                .create_volume(VolumeSpec::new("pvc-2", GIB, 2))
                .await
        );
        assert_eq!(volume.state, VolumeState::Online);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let harness = Harness::with_nodes(1).await;
        let tasks = assert_ok!(harness.control_plane.start());
        assert_matches!(
            harness.control_plane.start(),
            Err(Error::FailedPrecondition(_))
        );
        assert_ok!(harness.control_plane.shutdown(tasks).await);
    }

    #[tokio::test]
    async fn test_persister_failure_surfaces_from_tasks() {
        let harness = Harness::with_nodes(2).await;
        harness.backend.fail_saves(true);
        let mut tasks = assert_ok!(harness.control_plane.start());

        let joined = tokio::time::timeout(Duration::from_secs(5), tasks.join_next())
            .await
            .expect("persister should stop")
            .expect("task set not empty")
            .expect("task should not panic");
        assert_matches!(joined, Err(Error::Internal(_)));

        // Nothing is acknowledged once state can no longer be saved
        assert_matches!(
            harness
                .scheduler()
                .create_volume(VolumeSpec::new("pvc-1", GIB, 1))
                .await,
            Err(Error::Internal(_))
        );
        assert!(harness.transport.nodes().iter().all(|n| n.replica_ids().is_empty()));
        harness.control_plane.shutdown_token().cancel();
    }
}

// =============================================================================
// REST
// =============================================================================

mod rest_tests {
    use super::*;
    use couchestor_cp::rest::handle;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper::{Method, Request, StatusCode};

    async fn call(
        harness: &Harness,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let bytes = body
            .map(|b| Bytes::from(b.to_string()))
            .unwrap_or_default();
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(bytes))
            .unwrap();
        let resp = handle(harness.control_plane.clone(), req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let harness = Harness::with_nodes(1).await;
        let (status, _) = call(&harness, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&harness, Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let tasks = harness.control_plane.start().unwrap();
        let (status, _) = call(&harness, Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        harness.control_plane.shutdown(tasks).await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_detail() {
        let harness = Harness::with_nodes(3).await;
        let volume = create(&harness, "pvc-1", GIB, 2).await;

        let (status, json) = call(
            &harness,
            Method::GET,
            &format!("/v0/volumes/{}", volume.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["volume"]["name"], "pvc-1");
        assert_eq!(json["replicas"].as_array().map(|r| r.len()), Some(2));
        assert!(json["nexus"].is_object());

        let (status, json) = call(&harness, Method::GET, "/v0/volumes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(|v| v.len()), Some(1));

        let (status, json) = call(&harness, Method::GET, "/v0/volumes/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_node_inventory_and_pool_admin() {
        let harness = Harness::with_nodes(2).await;

        let (status, json) = call(&harness, Method::GET, "/v0/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(|n| n.len()), Some(2));

        let (status, _) = call(&harness, Method::GET, "/v0/nodes/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = call(
            &harness,
            Method::POST,
            "/v0/nodes/node-1/pools",
            Some(serde_json::json!({ "id": "pool-extra", "disks": ["/dev/nvme1n1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["node"], "node-1");

        let (status, json) = call(&harness, Method::GET, "/v0/pools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(|p| p.len()), Some(3));

        let (status, _) = call(&harness, Method::DELETE, "/v0/pools/pool-extra", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_heartbeat_is_applied_before_reply() {
        let harness = Harness::with_nodes(1).await;

        let (status, _) = call(
            &harness,
            Method::POST,
            "/v0/nodes/heartbeat",
            Some(serde_json::json!({ "node": "node-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Unknown agents are told to register
        let (status, json) = call(
            &harness,
            Method::POST,
            "/v0/nodes/heartbeat",
            Some(serde_json::json!({ "node": "node-9" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_deregister_node_hosting_pools_is_refused() {
        let harness = Harness::with_nodes(1).await;
        let node = NodeId::new("node-1");

        let (status, json) = call(&harness, Method::DELETE, "/v0/nodes/node-1", None).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(json["kind"], "failed_precondition");

        // Still routable
        assert!(harness.control_plane.registry().is_online(&node));
        assert!(harness.control_plane.bus().endpoint(&node).is_some());
        create(&harness, "pvc-1", GIB, 1).await;
    }

    #[tokio::test]
    async fn test_deregister_idle_node() {
        let harness = Harness::with_nodes(1).await;
        let idle = NodeId::new("node-9");
        harness
            .transport
            .add_node(std::sync::Arc::new(couchestor_cp::adapters::SimulatedNode::new("node-9")));
        harness.register_all().await;
        assert!(harness.control_plane.bus().endpoint(&idle).is_some());

        let (status, _) = call(&harness, Method::DELETE, "/v0/nodes/node-9", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_matches!(
            harness.control_plane.registry().get_node(&idle),
            Err(Error::NotFound { .. })
        );
        assert!(harness.control_plane.bus().endpoint(&idle).is_none());

        let (status, _) = call(&harness, Method::DELETE, "/v0/nodes/node-9", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_registration_with_wrong_protocol_is_rejected() {
        let harness = Harness::with_nodes(1).await;
        let (status, _) = call(
            &harness,
            Method::POST,
            "/v0/nodes/register",
            Some(serde_json::json!({
                "node": "node-9",
                "endpoint": "http://10.0.0.9:10124",
                "version": 999,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_registration_reaches_registry_through_bus() {
        let harness = Harness::with_nodes(1).await;
        let tasks = harness.control_plane.start().unwrap();

        let (status, _) = call(
            &harness,
            Method::POST,
            "/v0/nodes/register",
            Some(serde_json::json!({
                "node": "node-9",
                "endpoint": "http://10.0.0.9:10124",
                "pools": [{ "id": "pool-9", "disks": [], "capacity": 1073741824u64, "used": 0 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let registry = harness.control_plane.registry().clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !registry.is_online(&NodeId::new("node-9")) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("node-9 should register");
        assert!(harness.snapshot().pool(&PoolId::new("pool-9")).is_some());

        harness.control_plane.shutdown(tasks).await.unwrap();
    }
}
