//! Scheduler Engine
//!
//! Drives volume lifecycle operations against node agents:
//!
//! - CreateVolume places replicas, creates them concurrently, assembles a
//!   nexus on one of their nodes and marks the volume Online. Any failure
//!   after partial progress rolls back everything the call created.
//! - DeleteVolume tears the volume down. Objects on unreachable nodes are
//!   left in Destroying for the reconciler to finish.
//! - Publish and Unpublish share and unshare the nexus.
//! - CreatePool and DestroyPool administer pools through node agents.
//!
//! Each volume operation holds that volume's lock for its entire duration.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::locks::{CreateTicket, VolumeLocks};
use super::placement::{select_pools, Placement, PlacementRequest};
use crate::bus::MessageBus;
use crate::domain::events::DomainEvent;
use crate::domain::model::{
    Nexus, NexusId, NexusState, NodeId, Pool, PoolId, Publication, Replica, ReplicaId,
    ReplicaState, Volume, VolumeId, VolumeSpec, VolumeState,
};
use crate::domain::ports::EventPublisher;
use crate::error::{Error, Result};
use crate::registry::NodeRegistry;
use crate::store::{Snapshot, Txn, VolumeStore};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Placement rounds before CreateVolume gives up
    pub max_placement_attempts: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_placement_attempts: 3,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<VolumeStore>,
    registry: Arc<NodeRegistry>,
    bus: Arc<MessageBus>,
    locks: Arc<VolumeLocks>,
    events: Arc<dyn EventPublisher>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<VolumeStore>,
        registry: Arc<NodeRegistry>,
        bus: Arc<MessageBus>,
        locks: Arc<VolumeLocks>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            bus,
            locks,
            events,
        }
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    /// Free bytes across pools on Online nodes.
    pub fn available_capacity(&self) -> u64 {
        let online = self.registry.online_nodes();
        self.store
            .snapshot()
            .free_capacity(|node| online.contains(node))
    }

    /// Largest volume a single pool on an Online node could hold.
    pub fn max_volume_size(&self) -> u64 {
        let online = self.registry.online_nodes();
        self.store
            .snapshot()
            .max_pool_free(|node| online.contains(node))
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    /// Create a volume, or return the existing one for the same name.
    #[instrument(skip(self, spec), fields(name = %spec.name, size = spec.size, replicas = spec.replica_count))]
    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        validate_spec(&spec)?;
        let id = spec.volume_id();

        if let Some(existing) = existing_volume(&self.store.snapshot(), &spec)? {
            return Ok(existing);
        }

        let ticket = self.locks.begin_create(&id)?;
        let _guard = self.locks.lock(&id).await?;
        ticket.check()?;

        // Re-check under the lock
        let snapshot = self.store.snapshot();
        if let Some(existing) = existing_volume(&snapshot, &spec)? {
            return Ok(existing);
        }
        match snapshot.volume(&id).map(|v| v.state) {
            Some(VolumeState::Destroying) => {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is being deleted",
                    spec.name
                )));
            }
            Some(_) => {
                warn!(volume = %id, "Rolling back leftovers of an interrupted create");
                if !self.teardown_locked(&id).await? {
                    return Err(Error::FailedPrecondition(format!(
                        "volume {} still has objects pending cleanup",
                        spec.name
                    )));
                }
            }
            None => {}
        }

        let mut txn = Txn::new();
        txn.put_volume(Volume::new(&spec));
        self.store.commit(txn)?;

        match self.provision(&spec, &ticket).await {
            Ok(volume) => {
                info!(volume = %volume.id, nexus = ?volume.nexus, "Volume online");
                self.publish(DomainEvent::volume_created(
                    volume.id.as_str(),
                    volume.size,
                    volume.replica_count,
                ))
                .await;
                Ok(volume)
            }
            Err(e) => {
                warn!(volume = %id, error = %e, "Create failed, rolling back");
                match self.teardown_locked(&id).await {
                    Ok(true) => debug!(volume = %id, "Rollback complete"),
                    Ok(false) => warn!(volume = %id, "Rollback left objects pending cleanup"),
                    Err(rollback) => warn!(volume = %id, error = %rollback, "Rollback failed"),
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, spec: &VolumeSpec, ticket: &CreateTicket<'_>) -> Result<Volume> {
        let id = spec.volume_id();
        let replicas = self.place_replicas(spec, ticket).await?;

        ticket.check()?;
        // Local-first: host the nexus next to the best-ranked replica
        let host = replicas[0].node.clone();
        let nexus = Nexus::new(
            id.clone(),
            host.clone(),
            spec.size,
            replicas.iter().map(|r| r.id.clone()).collect(),
        );
        let nexus_id = nexus.id.clone();
        let mut txn = Txn::new();
        txn.put_nexus(nexus);
        let snapshot = self.store.commit(txn)?;
        let nexus = snapshot
            .nexus(&nexus_id)
            .cloned()
            .ok_or_else(|| Error::not_found("nexus", &nexus_id))?;

        let children = replicas.iter().map(|r| r.child_uri(&host)).collect();
        self.bus.create_nexus(&nexus, children).await?;
        ticket.check()?;

        let snapshot = self.store.update(|tables| {
            let mut volume = tables
                .volume(&id)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", &id))?;
            let mut nexus = tables
                .nexus(&nexus_id)
                .cloned()
                .ok_or_else(|| Error::not_found("nexus", &nexus_id))?;
            nexus.state = NexusState::Online;
            volume.state = VolumeState::Online;
            volume.nexus = Some(nexus_id.clone());
            let mut txn = Txn::new();
            txn.put_nexus(nexus).put_volume(volume);
            Ok(txn)
        })?;

        self.store.flush(snapshot.revision()).await?;

        for replica in &replicas {
            self.publish(DomainEvent::replica_added(replica)).await;
        }
        snapshot
            .volume(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", &id))
    }

    /// Create `replica_count` Online replicas, retrying placement away from
    /// nodes that failed.
    async fn place_replicas(
        &self,
        spec: &VolumeSpec,
        ticket: &CreateTicket<'_>,
    ) -> Result<Vec<Replica>> {
        let id = spec.volume_id();
        let mut excluded: BTreeSet<NodeId> = BTreeSet::new();
        let mut last_error: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            ticket.check()?;

            let mut request = PlacementRequest::new(spec.size, spec.replica_count);
            request.exclude_nodes = excluded.clone();
            request.allow_colocation = true;

            let placement = select_pools(
                self.store.snapshot().pools(),
                &self.registry.online_nodes(),
                &request,
            )
            .map_err(|e| match &last_error {
                Some(last) => Error::InsufficientResources(format!("{}; last failure: {}", e, last)),
                None => e,
            })?;

            if placement.relaxed {
                warn!(
                    volume = %id,
                    nodes = placement.distinct_nodes(),
                    replicas = spec.replica_count,
                    "Not enough nodes for anti-affinity, co-locating replicas"
                );
            }

            let reserved = self
                .reserve_replicas(&id, spec.size, &placement)
                .await?;
            let results = join_all(reserved.iter().map(|r| self.bus.create_replica(r))).await;

            let mut created = Vec::new();
            let mut failed = Vec::new();
            for (replica, result) in reserved.into_iter().zip(results) {
                match result {
                    Ok(uri) => created.push(self.mark_replica_online(&replica.id, uri)?),
                    Err(e) => failed.push((replica, e)),
                }
            }
            ticket.check()?;

            if failed.is_empty() {
                debug!(volume = %id, attempt, "Replicas created");
                return Ok(created);
            }

            for (replica, e) in &failed {
                warn!(volume = %id, node = %replica.node, attempt, error = %e, "Replica creation failed");
                excluded.insert(replica.node.clone());
            }
            last_error = failed.last().map(|(_, e)| e.to_string());

            let discard = created.iter().chain(failed.iter().map(|(r, _)| r));
            for replica in discard {
                self.destroy_replica_record(replica).await?;
            }

            if attempt >= self.config.max_placement_attempts {
                return Err(Error::InsufficientResources(format!(
                    "could not place {} replicas after {} attempts: {}",
                    spec.replica_count,
                    attempt,
                    last_error.unwrap_or_default()
                )));
            }
        }
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    /// Delete a volume. Unknown volumes succeed without side effects.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, id: &VolumeId) -> Result<()> {
        if self.locks.cancel_create(id) {
            info!(volume = %id, "Delete superseded an in-flight create");
        }
        let _guard = self.locks.lock(id).await?;

        let snapshot = self.store.snapshot();
        if snapshot.volume(id).is_none()
            && snapshot.replicas_of(id).is_empty()
            && snapshot.nexuses_of(id).is_empty()
        {
            debug!(volume = %id, "Volume already gone");
            return Ok(());
        }

        let complete = self.teardown_locked(id).await?;
        if complete {
            info!(volume = %id, "Volume deleted");
        } else {
            warn!(volume = %id, "Volume deleted, cleanup pending on unreachable nodes");
        }
        self.publish(DomainEvent::volume_deleted(id.as_str(), !complete))
            .await;
        Ok(())
    }

    /// Destroy the nexus and replicas of `id`, then its record.
    ///
    /// The caller must hold the volume lock. Returns `false` when some
    /// objects could not be destroyed; they stay in Destroying.
    pub(crate) async fn teardown_locked(&self, id: &VolumeId) -> Result<bool> {
        let snapshot = self.store.update(|tables| {
            let mut txn = Txn::new();
            if let Some(volume) = tables.volume(id) {
                if volume.state != VolumeState::Destroying {
                    let mut volume = volume.clone();
                    volume.state = VolumeState::Destroying;
                    txn.put_volume(volume);
                }
            }
            for nexus in tables.nexuses_of(id) {
                if nexus.state != NexusState::Destroying {
                    let mut nexus = nexus.clone();
                    nexus.state = NexusState::Destroying;
                    txn.put_nexus(nexus);
                }
            }
            for replica in tables.replicas_of(id) {
                if replica.state != ReplicaState::Destroying {
                    let mut replica = replica.clone();
                    replica.state = ReplicaState::Destroying;
                    txn.put_replica(replica);
                }
            }
            Ok(txn)
        })?;

        let mut pending = 0;
        for nexus in snapshot.nexuses_of(id) {
            if !self.destroy_nexus_record(nexus).await? {
                pending += 1;
            }
        }
        for replica in snapshot.replicas_of(id) {
            if !self.destroy_replica_record(replica).await? {
                pending += 1;
            }
        }

        if pending > 0 {
            return Ok(false);
        }
        self.store.update(|tables| {
            let mut txn = Txn::new();
            if let Some(volume) = tables.volume(id) {
                txn.delete_volume(volume);
            }
            Ok(txn)
        })?;
        Ok(true)
    }

    // =========================================================================
    // Publish / Unpublish
    // =========================================================================

    /// Share the volume's nexus for `node`, returning the target URI.
    #[instrument(skip(self))]
    pub async fn publish_volume(&self, id: &VolumeId, node: &str) -> Result<String> {
        let _guard = self.locks.lock(id).await?;
        let snapshot = self.store.snapshot();
        let volume = snapshot
            .volume(id)
            .ok_or_else(|| Error::not_found("volume", id))?;

        if let Some(publication) = &volume.publication {
            if publication.node == node {
                return Ok(publication.uri.clone());
            }
            return Err(Error::FailedPrecondition(format!(
                "volume {} is already published to {}",
                id, publication.node
            )));
        }
        if !volume.state.is_servable() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {}",
                id, volume.state
            )));
        }
        let nexus = snapshot
            .nexus_of(id)
            .ok_or_else(|| Error::FailedPrecondition(format!("volume {} has no nexus", id)))?;

        let uri = self.bus.share_nexus(&nexus.node, &nexus.id).await?;
        let nexus_id = nexus.id.clone();
        self.store.update(|tables| {
            let mut volume = tables
                .volume(id)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", id))?;
            let mut nexus = tables
                .nexus(&nexus_id)
                .cloned()
                .ok_or_else(|| Error::not_found("nexus", &nexus_id))?;
            nexus.share_uri = Some(uri.clone());
            volume.publication = Some(Publication {
                node: node.to_string(),
                uri: uri.clone(),
            });
            let mut txn = Txn::new();
            txn.put_nexus(nexus).put_volume(volume);
            Ok(txn)
        })?;

        info!(volume = %id, node, uri = %uri, "Volume published");
        self.publish(DomainEvent::volume_published(id.as_str(), node, uri.as_str()))
            .await;
        Ok(uri)
    }

    /// Unshare the nexus. An empty `node` matches any publication.
    #[instrument(skip(self))]
    pub async fn unpublish_volume(&self, id: &VolumeId, node: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await?;
        let snapshot = self.store.snapshot();
        let Some(volume) = snapshot.volume(id) else {
            return Ok(());
        };
        let Some(publication) = &volume.publication else {
            return Ok(());
        };
        if !node.is_empty() && publication.node != node {
            debug!(volume = %id, published_to = %publication.node, "Unpublish for another node ignored");
            return Ok(());
        }
        let published_to = publication.node.clone();

        let nexus_id = match snapshot.nexus_of(id) {
            Some(nexus) if self.registry.is_online(&nexus.node) => {
                self.bus.unshare_nexus(&nexus.node, &nexus.id).await?;
                Some(nexus.id.clone())
            }
            Some(nexus) => {
                warn!(volume = %id, node = %nexus.node, "Nexus host offline, clearing publication only");
                Some(nexus.id.clone())
            }
            None => None,
        };

        self.store.update(|tables| {
            let mut txn = Txn::new();
            let mut volume = tables
                .volume(id)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", id))?;
            volume.publication = None;
            txn.put_volume(volume);
            if let Some(nexus) = nexus_id.as_ref().and_then(|n| tables.nexus(n)) {
                let mut nexus = nexus.clone();
                nexus.share_uri = None;
                txn.put_nexus(nexus);
            }
            Ok(txn)
        })?;

        info!(volume = %id, node = %published_to, "Volume unpublished");
        self.publish(DomainEvent::volume_unpublished(id.as_str(), published_to))
            .await;
        Ok(())
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Create a pool on an Online node. Idempotent for the same node.
    #[instrument(skip(self, disks))]
    pub async fn create_pool(&self, node: &NodeId, id: &PoolId, disks: &[String]) -> Result<Pool> {
        if id.as_str().is_empty() {
            return Err(Error::InvalidArgument("pool id must not be empty".into()));
        }
        if let Some(existing) = self.store.snapshot().pool(id) {
            if &existing.node == node {
                return Ok(existing.clone());
            }
            return Err(Error::already_exists("pool", id));
        }
        let target = self.registry.get_node(node)?;
        if !target.is_online() {
            return Err(Error::FailedPrecondition(format!(
                "node {} is {}",
                node, target.state
            )));
        }

        let report = self.bus.create_pool(node, id, disks).await?;
        let pool = self.store.upsert_pool(id, |existing| {
            let mut pool = existing.unwrap_or_else(|| Pool::new(id.clone(), node.clone(), 0));
            pool.node = node.clone();
            pool.disks = report.disks.clone();
            pool.capacity = report.capacity;
            pool.used = report.used;
            pool
        })?;

        info!(pool = %id, node = %node, capacity = pool.capacity, "Pool created");
        self.publish(DomainEvent::pool_created(
            id.as_str(),
            node.as_str(),
            pool.capacity,
        ))
        .await;
        Ok(pool)
    }

    /// Destroy an empty pool. Unknown pools succeed.
    #[instrument(skip(self))]
    pub async fn destroy_pool(&self, id: &PoolId) -> Result<()> {
        let snapshot = self.store.snapshot();
        let Some(pool) = snapshot.pool(id) else {
            return Ok(());
        };
        let hosted = snapshot.replicas_in_pool(id).len();
        if hosted > 0 {
            return Err(Error::FailedPrecondition(format!(
                "pool {} still hosts {} replicas",
                id, hosted
            )));
        }

        self.bus.destroy_pool(&pool.node, id).await?;
        self.store.update(|tables| {
            let mut txn = Txn::new();
            if let Some(pool) = tables.pool(id) {
                if !tables.replicas_in_pool(id).is_empty() {
                    return Err(Error::FailedPrecondition(format!(
                        "pool {} gained replicas while being destroyed",
                        id
                    )));
                }
                txn.delete_pool(pool);
            }
            Ok(txn)
        })?;

        info!(pool = %id, node = %pool.node, "Pool destroyed");
        self.publish(DomainEvent::pool_destroyed(id.as_str(), pool.node.as_str()))
            .await;
        Ok(())
    }

    // =========================================================================
    // Record helpers shared with the reconciler
    // =========================================================================

    /// Record new replicas in Creating and reserve their pool capacity.
    ///
    /// Returns once the records are saved, so a restart after the agents
    /// have been asked to create them still finds and cleans them up.
    pub(crate) async fn reserve_replicas(
        &self,
        volume: &VolumeId,
        size: u64,
        placement: &Placement,
    ) -> Result<Vec<Replica>> {
        let replicas: Vec<Replica> = placement
            .pools
            .iter()
            .map(|pool| Replica::new(volume.clone(), pool, size))
            .collect();

        let snapshot = self.store.update(|tables| {
            let mut txn = Txn::new();
            for replica in &replicas {
                let mut pool = tables
                    .pool(&replica.pool)
                    .cloned()
                    .ok_or_else(|| Error::not_found("pool", &replica.pool))?;
                if pool.free() < size {
                    return Err(Error::InsufficientResources(format!(
                        "pool {} has {} free bytes, need {}",
                        pool.id,
                        pool.free(),
                        size
                    )));
                }
                pool.used += size;
                txn.put_pool(pool).put_replica(replica.clone());
            }
            Ok(txn)
        })?;

        let reserved = replicas
            .iter()
            .map(|r| {
                snapshot
                    .replica(&r.id)
                    .cloned()
                    .ok_or_else(|| Error::not_found("replica", &r.id))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.flush(snapshot.revision()).await?;
        Ok(reserved)
    }

    pub(crate) fn mark_replica_online(&self, id: &ReplicaId, uri: String) -> Result<Replica> {
        self.store.update_replica(id, |replica| {
            replica.uri = Some(uri.clone());
            replica.state = ReplicaState::Online;
            Ok(())
        })
    }

    /// Destroy a replica on its node and drop its record, releasing pool
    /// capacity. Returns `false` and leaves it Destroying if the node
    /// cannot be reached.
    pub(crate) async fn destroy_replica_record(&self, replica: &Replica) -> Result<bool> {
        match self.bus.destroy_replica(replica).await {
            Ok(()) => {
                self.forget_replica(&replica.id)?;
                self.publish(DomainEvent::replica_removed(replica)).await;
                Ok(true)
            }
            Err(e) => {
                debug!(replica = %replica.id, node = %replica.node, error = %e, "Replica destroy pending");
                match self.store.update_replica(&replica.id, |r| {
                    r.state = ReplicaState::Destroying;
                    Ok(())
                }) {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Destroy a nexus on its node and drop its record.
    pub(crate) async fn destroy_nexus_record(&self, nexus: &Nexus) -> Result<bool> {
        match self.bus.destroy_nexus(&nexus.node, &nexus.id).await {
            Ok(()) => {
                self.forget_nexus(&nexus.id)?;
                Ok(true)
            }
            Err(e) => {
                debug!(nexus = %nexus.id, node = %nexus.node, error = %e, "Nexus destroy pending");
                match self.store.update_nexus(&nexus.id, |n| {
                    n.state = NexusState::Destroying;
                    Ok(())
                }) {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub(crate) fn forget_replica(&self, id: &ReplicaId) -> Result<()> {
        self.store.update(|tables| {
            let mut txn = Txn::new();
            let Some(replica) = tables.replica(id) else {
                return Ok(txn);
            };
            txn.delete_replica(replica);
            if let Some(pool) = tables.pool(&replica.pool) {
                let mut pool = pool.clone();
                pool.used = pool.used.saturating_sub(replica.size);
                txn.put_pool(pool);
            }
            Ok(txn)
        })?;
        Ok(())
    }

    pub(crate) fn forget_nexus(&self, id: &NexusId) -> Result<()> {
        self.store.update(|tables| {
            let mut txn = Txn::new();
            if let Some(nexus) = tables.nexus(id) {
                txn.delete_nexus(nexus);
            }
            Ok(txn)
        })?;
        Ok(())
    }

    pub(crate) async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish()
    }
}

fn validate_spec(spec: &VolumeSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(Error::InvalidArgument("volume name must not be empty".into()));
    }
    if spec.size == 0 {
        return Err(Error::InvalidArgument("volume size must be positive".into()));
    }
    if spec.replica_count == 0 {
        return Err(Error::InvalidArgument(
            "replica count must be at least 1".into(),
        ));
    }
    Ok(())
}

/// The stored volume for `spec` if it is finished, `AlreadyExists` if the
/// name is taken with different parameters.
fn existing_volume(snapshot: &Snapshot, spec: &VolumeSpec) -> Result<Option<Volume>> {
    let Some(volume) = snapshot.volume(&spec.volume_id()) else {
        return Ok(None);
    };
    if !volume.matches(spec) {
        return Err(Error::already_exists("volume", &spec.name));
    }
    match volume.state {
        VolumeState::Online | VolumeState::Degraded | VolumeState::Faulted => {
            Ok(Some(volume.clone()))
        }
        VolumeState::Creating | VolumeState::Destroying => Ok(None),
    }
}
