//! Volume Reconciler
//!
//! Periodically drives every volume toward its desired state:
//!
//! 1. Replicas on Offline nodes are faulted, atomically with the volume
//!    state they imply.
//! 2. A nexus whose host went Offline is recreated next to a healthy
//!    replica and re-shared if the volume was published.
//! 3. Degraded volumes get one replacement replica per tick on a node that
//!    hosts none of their replicas. The replacement joins the nexus only
//!    after its rebuild completes; then one faulted child is retired.
//! 4. Leftovers are cleaned up: pending destroys, interrupted creates and
//!    records whose volume no longer exists.
//!
//! A volume whose lock is held by a user operation is skipped for the tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::protocol::RebuildState;
use crate::bus::MessageBus;
use crate::domain::events::DomainEvent;
use crate::domain::model::{
    Nexus, NexusState, NodeId, Replica, ReplicaId, ReplicaState, Volume, VolumeId, VolumeState,
};
use crate::domain::ports::EventPublisher;
use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::{NodeRegistry, NodeStateChange};
use crate::scheduler::{select_pools, PlacementRequest, Scheduler, VolumeLocks};
use crate::store::{Tables, Txn, VolumeStore};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the reconciliation tick
    pub reconcile_interval: Duration,
    /// Volumes reconciled in parallel
    pub max_concurrent_reconciles: usize,
    /// Upper bound on one volume's reconcile
    pub volume_reconcile_timeout: Duration,
    /// Time spent polling a rebuild within one tick before deferring it
    pub rebuild_poll_budget: Duration,
    /// Delay between rebuild progress polls
    pub rebuild_poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            max_concurrent_reconciles: 8,
            volume_reconcile_timeout: Duration::from_secs(120),
            rebuild_poll_budget: Duration::from_secs(5),
            rebuild_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Result of reconciling one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reconciled,
    /// A user operation held the volume lock
    Skipped,
    TimedOut,
    Failed,
}

/// Counts of per-volume outcomes for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub reconciled: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub failed: usize,
}

impl PassSummary {
    fn record(mut self, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Reconciled => self.reconciled += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Failed => self.failed += 1,
        }
        self
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    config: ReconcilerConfig,
    scheduler: Arc<Scheduler>,
    events: Arc<dyn EventPublisher>,
    /// Start time of rebuilds in progress, for completion events
    rebuilds: DashMap<ReplicaId, Instant>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        scheduler: Arc<Scheduler>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            scheduler,
            events,
            rebuilds: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn store(&self) -> &Arc<VolumeStore> {
        self.scheduler.store()
    }

    fn registry(&self) -> &Arc<NodeRegistry> {
        self.scheduler.registry()
    }

    fn bus(&self) -> &Arc<MessageBus> {
        self.scheduler.bus()
    }

    fn locks(&self) -> &Arc<VolumeLocks> {
        self.scheduler.locks()
    }

    /// Reconcile until `shutdown`, on the tick and on node state changes.
    pub async fn run(
        self: Arc<Self>,
        mut changes: mpsc::UnboundedReceiver<NodeStateChange>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.reconcile_interval.as_millis() as u64,
            concurrency = self.config.max_concurrent_reconciles,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    debug!(?summary, "Reconcile tick finished");
                }
                Some(change) = changes.recv() => {
                    let volumes = self.store().snapshot().volumes_touching_node(&change.node);
                    info!(
                        node = %change.node,
                        from = %change.old,
                        to = %change.new,
                        volumes = volumes.len(),
                        "Reconciling volumes after node state change"
                    );
                    self.reconcile(volumes).await;
                }
            }
        }
        info!("Reconciler stopped");
    }

    /// One full pass over every volume and every stray record.
    pub async fn tick(&self) -> PassSummary {
        metrics::record_reconcile_tick();
        let snapshot = self.store().snapshot();
        let targets: BTreeSet<VolumeId> = snapshot
            .volumes()
            .map(|v| v.id.clone())
            .chain(snapshot.replicas().map(|r| r.volume.clone()))
            .chain(snapshot.nexuses().map(|n| n.volume.clone()))
            .collect();

        let summary = self.reconcile(targets).await;
        self.update_gauges();
        self.locks().prune();
        summary
    }

    /// Reconcile the given volumes concurrently.
    pub async fn reconcile(&self, volumes: impl IntoIterator<Item = VolumeId>) -> PassSummary {
        stream::iter(volumes)
            .map(|id| async move { self.reconcile_bounded(&id).await })
            .buffer_unordered(self.config.max_concurrent_reconciles.max(1))
            .fold(PassSummary::default(), |summary, outcome| async move {
                summary.record(outcome)
            })
            .await
    }

    async fn reconcile_bounded(&self, id: &VolumeId) -> Outcome {
        let Some(_guard) = self.locks().try_lock(id) else {
            debug!(volume = %id, "Volume busy, skipping this tick");
            return Outcome::Skipped;
        };
        match tokio::time::timeout(self.config.volume_reconcile_timeout, self.reconcile_volume(id))
            .await
        {
            Ok(Ok(())) => Outcome::Reconciled,
            Ok(Err(e)) => {
                warn!(volume = %id, error = %e, "Reconcile failed");
                Outcome::Failed
            }
            Err(_) => {
                warn!(
                    volume = %id,
                    timeout_ms = self.config.volume_reconcile_timeout.as_millis() as u64,
                    "Reconcile timed out"
                );
                Outcome::TimedOut
            }
        }
    }

    /// Reconcile one volume. The caller holds its lock.
    #[instrument(skip(self))]
    async fn reconcile_volume(&self, id: &VolumeId) -> Result<()> {
        let state = self.store().snapshot().volume(id).map(|v| v.state);
        match state {
            None => return self.sweep_orphans(id).await,
            Some(VolumeState::Destroying) => return self.finish_teardown(id).await,
            Some(VolumeState::Creating) => {
                // Creates hold the lock throughout, so this is a crash leftover
                warn!(volume = %id, "Rolling back interrupted create");
                self.scheduler.teardown_locked(id).await?;
                return Ok(());
            }
            Some(_) => {}
        }

        self.converge_health(id).await?;
        self.recover_nexus(id).await?;
        self.converge_health(id).await?;
        self.repair(id).await?;
        self.retire_strays(id).await?;
        self.converge_health(id).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Fault children on Offline nodes and derive volume and nexus state.
    async fn converge_health(&self, id: &VolumeId) -> Result<()> {
        let down = self.registry().offline_nodes();
        let mut faulted: Vec<Replica> = Vec::new();
        let mut transition: Option<(VolumeState, VolumeState)> = None;

        self.store().update(|tables| {
            faulted.clear();
            transition = None;
            let mut txn = Txn::new();
            let Some(volume) = tables.volume(id) else {
                return Ok(txn);
            };
            if matches!(volume.state, VolumeState::Creating | VolumeState::Destroying) {
                return Ok(txn);
            }

            for replica in tables.replicas_of(id) {
                if replica.state == ReplicaState::Online && down.contains(&replica.node) {
                    let mut replica = replica.clone();
                    replica.state = ReplicaState::Faulted;
                    replica.rebuilding = false;
                    faulted.push(replica.clone());
                    txn.put_replica(replica);
                }
            }

            let (state, healthy) = derived_state(tables, volume, &down);
            if state != volume.state {
                transition = Some((volume.state, state));
                let mut volume = volume.clone();
                volume.state = state;
                txn.put_volume(volume);
            }
            if let Some(nexus) = volume.nexus.as_ref().and_then(|n| tables.nexus(n)) {
                let target = nexus_state(nexus, healthy, volume.replica_count, &down);
                if nexus.state != target && nexus.state != NexusState::Destroying {
                    let mut nexus = nexus.clone();
                    nexus.state = target;
                    txn.put_nexus(nexus);
                }
            }
            Ok(txn)
        })?;

        for replica in &faulted {
            warn!(volume = %id, replica = %replica.id, node = %replica.node, "Replica faulted, node offline");
            self.publish(DomainEvent::replica_faulted(replica, "node offline"))
                .await;
        }
        if let Some((old, new)) = transition {
            info!(volume = %id, from = %old, to = %new, "Volume state changed");
            self.publish(DomainEvent::volume_state_changed(id.as_str(), old, new))
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // Nexus recovery
    // =========================================================================

    /// Recreate the nexus on a healthy replica's node if its host is gone.
    async fn recover_nexus(&self, id: &VolumeId) -> Result<()> {
        let snapshot = self.store().snapshot();
        let online = self.registry().online_nodes();
        let down = self.registry().offline_nodes();
        let Some(volume) = snapshot.volume(id) else {
            return Ok(());
        };
        let current = volume.nexus.as_ref().and_then(|n| snapshot.nexus(n));
        if current.is_some_and(|n| !down.contains(&n.node)) {
            return Ok(());
        }

        let healthy: Vec<&Replica> = snapshot
            .replicas_of(id)
            .into_iter()
            .filter(|r| serves(r, &down))
            .filter(|r| current.map_or(true, |n| n.has_child(&r.id)))
            .collect();
        let Some(anchor) = healthy.iter().find(|r| online.contains(&r.node)) else {
            debug!(volume = %id, "No healthy replica on an Online node to host a new nexus");
            return Ok(());
        };
        let host = anchor.node.clone();
        let old_node = current.map(|n| n.node.to_string()).unwrap_or_default();

        let nexus = Nexus::new(
            id.clone(),
            host.clone(),
            volume.size,
            healthy.iter().map(|r| r.id.clone()).collect(),
        );
        let nexus_id = nexus.id.clone();
        let children = healthy.iter().map(|r| r.child_uri(&host)).collect();
        let old_id = current.map(|n| n.id.clone());
        let mut txn = Txn::new();
        txn.put_nexus(nexus);
        let snapshot = self.store().commit(txn)?;
        let nexus = snapshot
            .nexus(&nexus_id)
            .cloned()
            .ok_or_else(|| Error::not_found("nexus", &nexus_id))?;

        if let Err(e) = self.bus().create_nexus(&nexus, children).await {
            warn!(volume = %id, node = %host, error = %e, "Nexus recreation failed");
            self.scheduler.destroy_nexus_record(&nexus).await?;
            return Ok(());
        }

        let share = match volume.publication {
            Some(_) => Some(self.bus().share_nexus(&host, &nexus_id).await?),
            None => None,
        };

        self.store().update(|tables| {
            let mut volume = tables
                .volume(id)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", id))?;
            let mut nexus = tables
                .nexus(&nexus_id)
                .cloned()
                .ok_or_else(|| Error::not_found("nexus", &nexus_id))?;
            nexus.state = NexusState::Online;
            nexus.share_uri = share.clone();
            volume.nexus = Some(nexus_id.clone());
            if let (Some(publication), Some(uri)) = (volume.publication.as_mut(), share.as_ref()) {
                publication.uri = uri.clone();
            }
            let mut txn = Txn::new();
            txn.put_nexus(nexus).put_volume(volume);
            if let Some(old) = old_id.as_ref().and_then(|n| tables.nexus(n)) {
                let mut old = old.clone();
                old.state = NexusState::Destroying;
                old.share_uri = None;
                txn.put_nexus(old);
            }
            Ok(txn)
        })?;

        info!(volume = %id, from = %old_node, to = %host, "Nexus recreated");
        self.publish(DomainEvent::nexus_recreated(
            id.as_str(),
            nexus_id.as_str(),
            old_node,
            host.as_str(),
        ))
        .await;
        Ok(())
    }

    // =========================================================================
    // Repair
    // =========================================================================

    /// Add one replacement replica to a Degraded volume, or advance the
    /// rebuild already in progress.
    async fn repair(&self, id: &VolumeId) -> Result<()> {
        let snapshot = self.store().snapshot();
        let online = self.registry().online_nodes();
        let Some(volume) = snapshot.volume(id).cloned() else {
            return Ok(());
        };
        let Some(nexus) = snapshot.nexus_of(id).cloned() else {
            return Ok(());
        };
        if !online.contains(&nexus.node) {
            return Ok(());
        }

        if let Some(target) = snapshot.replicas_of(id).into_iter().find(|r| r.rebuilding) {
            return self.drive_rebuild(&nexus, target.clone()).await;
        }
        if volume.state != VolumeState::Degraded {
            return Ok(());
        }

        let mut request = PlacementRequest::new(volume.size, 1);
        request.avoid_nodes = snapshot
            .replicas_of(id)
            .iter()
            .map(|r| r.node.clone())
            .collect();
        let placement = match select_pools(snapshot.pools(), &online, &request) {
            Ok(placement) => placement,
            Err(e) => {
                debug!(volume = %id, error = %e, "No eligible node for a replacement replica");
                metrics::record_repair("no_capacity");
                return Ok(());
            }
        };

        let mut reserved = self
            .scheduler
            .reserve_replicas(id, volume.size, &placement)
            .await?;
        let replica = reserved
            .pop()
            .ok_or_else(|| Error::Internal("placement returned no pool".into()))?;

        let uri = match self.bus().create_replica(&replica).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(volume = %id, node = %replica.node, error = %e, "Replacement replica creation failed");
                metrics::record_repair("failed");
                self.scheduler.destroy_replica_record(&replica).await?;
                return Ok(());
            }
        };
        let replica = self.store().update_replica(&replica.id, |r| {
            r.uri = Some(uri.clone());
            r.state = ReplicaState::Online;
            r.rebuilding = true;
            Ok(())
        })?;

        info!(volume = %id, replica = %replica.id, node = %replica.node, "Rebuild started");
        metrics::record_repair("started");
        self.rebuilds.insert(replica.id.clone(), Instant::now());
        self.publish(DomainEvent::rebuild_started(&replica)).await;

        let child = replica.child_uri(&nexus.node);
        match self.bus().start_rebuild(&nexus.node, &nexus.id, child).await {
            Ok(RebuildState::Failed { reason }) => self.abandon_rebuild(&replica, reason).await,
            Ok(_) => self.drive_rebuild(&nexus, replica).await,
            Err(e) => self.abandon_rebuild(&replica, e.to_string()).await,
        }
    }

    /// Poll a rebuild within the tick budget, finishing it on completion.
    async fn drive_rebuild(&self, nexus: &Nexus, target: Replica) -> Result<()> {
        if !self.registry().is_online(&target.node) {
            return self
                .abandon_rebuild(&target, format!("node {} went offline", target.node))
                .await;
        }

        let child = target.child_uri(&nexus.node);
        let deadline = Instant::now() + self.config.rebuild_poll_budget;
        loop {
            match self
                .bus()
                .rebuild_progress(&nexus.node, &nexus.id, child.clone())
                .await
            {
                Ok(RebuildState::Complete) => {
                    return self.complete_rebuild(nexus, &target, child).await;
                }
                Ok(RebuildState::Failed { reason }) => {
                    return self.abandon_rebuild(&target, reason).await;
                }
                Ok(RebuildState::Running { percent }) => {
                    debug!(replica = %target.id, percent, "Rebuild in progress");
                }
                Err(e) if e.is_not_found() => {
                    // Agent lost track of it, e.g. after a restart
                    debug!(replica = %target.id, "Restarting rebuild");
                    if let RebuildState::Failed { reason } = self
                        .bus()
                        .start_rebuild(&nexus.node, &nexus.id, child.clone())
                        .await?
                    {
                        return self.abandon_rebuild(&target, reason).await;
                    }
                }
                Err(e) => {
                    warn!(replica = %target.id, error = %e, "Rebuild progress unavailable, retrying next tick");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                debug!(replica = %target.id, "Rebuild continues on a later tick");
                return Ok(());
            }
            tokio::time::sleep(self.config.rebuild_poll_interval).await;
        }
    }

    /// Attach the rebuilt replica, then retire one unhealthy child.
    async fn complete_rebuild(&self, nexus: &Nexus, target: &Replica, child: String) -> Result<()> {
        self.bus()
            .add_nexus_child(&nexus.node, &nexus.id, child)
            .await?;

        let down = self.registry().offline_nodes();
        let mut victim: Option<Replica> = None;
        let mut dangling: Vec<ReplicaId> = Vec::new();
        self.store().update(|tables| {
            victim = None;
            dangling.clear();
            let mut nexus = tables
                .nexus(&nexus.id)
                .cloned()
                .ok_or_else(|| Error::not_found("nexus", &nexus.id))?;
            let mut target = tables
                .replica(&target.id)
                .cloned()
                .ok_or_else(|| Error::not_found("replica", &target.id))?;

            for child in &nexus.children {
                match tables.replica(child) {
                    None => dangling.push(child.clone()),
                    Some(r) if victim.is_none() && !serves(r, &down) => victim = Some(r.clone()),
                    Some(_) => {}
                }
            }
            let retired = victim.as_ref().map(|v| v.id.clone());
            nexus
                .children
                .retain(|c| !dangling.contains(c) && Some(c) != retired.as_ref());
            if !nexus.has_child(&target.id) {
                nexus.children.push(target.id.clone());
            }
            target.rebuilding = false;

            let mut txn = Txn::new();
            txn.put_nexus(nexus).put_replica(target);
            Ok(txn)
        })?;

        let elapsed = self
            .rebuilds
            .remove(&target.id)
            .map(|(_, started)| started.elapsed())
            .unwrap_or_default();
        info!(replica = %target.id, elapsed_ms = elapsed.as_millis() as u64, "Rebuild complete");
        metrics::record_repair("completed");
        self.publish(DomainEvent::rebuild_completed(target, elapsed))
            .await;
        self.publish(DomainEvent::replica_added(target)).await;

        if let Some(victim) = victim {
            info!(replica = %victim.id, node = %victim.node, "Retiring faulted child");
            let uri = victim.child_uri(&nexus.node);
            if let Err(e) = self
                .bus()
                .remove_nexus_child(&nexus.node, &nexus.id, uri)
                .await
            {
                debug!(replica = %victim.id, error = %e, "Child removal deferred");
            }
            self.scheduler.destroy_replica_record(&victim).await?;
        }
        Ok(())
    }

    async fn abandon_rebuild(&self, target: &Replica, reason: String) -> Result<()> {
        warn!(replica = %target.id, reason = %reason, "Rebuild failed, discarding replacement");
        self.rebuilds.remove(&target.id);
        metrics::record_repair("failed");
        self.publish(DomainEvent::rebuild_failed(target, reason))
            .await;
        self.scheduler.destroy_replica_record(target).await?;
        Ok(())
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Destroy replicas and nexuses of a live volume that no longer serve it.
    async fn retire_strays(&self, id: &VolumeId) -> Result<()> {
        let snapshot = self.store().snapshot();
        let online = self.registry().online_nodes();
        let Some(current) = snapshot.nexus_of(id) else {
            return Ok(());
        };

        for nexus in snapshot.nexuses_of(id) {
            if nexus.id != current.id && online.contains(&nexus.node) {
                debug!(nexus = %nexus.id, "Destroying superseded nexus");
                self.scheduler.destroy_nexus_record(nexus).await?;
            }
        }
        for replica in snapshot.replicas_of(id) {
            let stray = replica.state == ReplicaState::Destroying
                || (!current.has_child(&replica.id)
                    && !replica.rebuilding
                    && replica.state != ReplicaState::Creating
                    && current.state != NexusState::Creating);
            if stray && online.contains(&replica.node) {
                debug!(replica = %replica.id, "Destroying stray replica");
                self.scheduler.destroy_replica_record(replica).await?;
            }
        }
        Ok(())
    }

    /// Retry pending destroys of a deleted volume.
    async fn finish_teardown(&self, id: &VolumeId) -> Result<()> {
        let snapshot = self.store().snapshot();
        let online = self.registry().online_nodes();
        let pending_on: BTreeSet<&NodeId> = snapshot
            .replicas_of(id)
            .into_iter()
            .map(|r| &r.node)
            .chain(snapshot.nexuses_of(id).into_iter().map(|n| &n.node))
            .collect();
        if !pending_on.is_empty() && !pending_on.iter().any(|n| online.contains(*n)) {
            debug!(volume = %id, "Cleanup waiting for nodes to return");
            return Ok(());
        }

        if self.scheduler.teardown_locked(id).await? {
            info!(volume = %id, "Deferred cleanup finished");
        }
        Ok(())
    }

    /// Destroy replica and nexus records whose volume is gone.
    async fn sweep_orphans(&self, id: &VolumeId) -> Result<()> {
        let snapshot = self.store().snapshot();
        let online = self.registry().online_nodes();
        for nexus in snapshot.nexuses_of(id) {
            if online.contains(&nexus.node) {
                warn!(volume = %id, nexus = %nexus.id, "Destroying orphaned nexus");
                self.scheduler.destroy_nexus_record(nexus).await?;
            }
        }
        for replica in snapshot.replicas_of(id) {
            if online.contains(&replica.node) {
                warn!(volume = %id, replica = %replica.id, "Destroying orphaned replica");
                self.scheduler.destroy_replica_record(replica).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn update_gauges(&self) {
        let snapshot = self.store().snapshot();
        let counts: Vec<(VolumeState, usize)> = [
            VolumeState::Creating,
            VolumeState::Online,
            VolumeState::Degraded,
            VolumeState::Faulted,
            VolumeState::Destroying,
        ]
        .into_iter()
        .map(|state| (state, snapshot.volumes().filter(|v| v.state == state).count()))
        .collect();
        metrics::set_volume_counts(&counts);
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("rebuilds", &self.rebuilds.len())
            .finish()
    }
}

/// Whether a replica currently serves I/O for its volume.
///
/// Nodes in Unknown state (not yet re-registered after a restart) are
/// given the benefit of the doubt; only Offline nodes count as down.
fn serves(replica: &Replica, down: &BTreeSet<NodeId>) -> bool {
    replica.state == ReplicaState::Online && !replica.rebuilding && !down.contains(&replica.node)
}

/// Volume state implied by its healthy nexus children, with the count.
///
/// Only the children count: a nexus lost with its host is recovered
/// elsewhere while the surviving replicas keep the volume Degraded.
fn derived_state(
    tables: &Tables,
    volume: &Volume,
    down: &BTreeSet<NodeId>,
) -> (VolumeState, usize) {
    let Some(nexus) = volume.nexus.as_ref().and_then(|n| tables.nexus(n)) else {
        return (VolumeState::Faulted, 0);
    };
    let healthy = nexus
        .children
        .iter()
        .filter_map(|c| tables.replica(c))
        .filter(|r| serves(r, down))
        .count();
    (VolumeState::from_health(healthy, volume.replica_count), healthy)
}

/// Nexus state: Faulted when its host is Offline, otherwise by child health.
fn nexus_state(
    nexus: &Nexus,
    healthy: usize,
    replica_count: usize,
    down: &BTreeSet<NodeId>,
) -> NexusState {
    if down.contains(&nexus.node) {
        return NexusState::Faulted;
    }
    match healthy {
        0 => NexusState::Faulted,
        n if n < replica_count => NexusState::Degraded,
        _ => NexusState::Online,
    }
}
