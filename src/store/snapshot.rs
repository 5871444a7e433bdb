//! Immutable store snapshots and secondary lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::model::{
    Nexus, NexusId, NexusState, NodeId, Pool, PoolId, Replica, ReplicaId, ReplicaState, Volume,
    VolumeId,
};
use crate::domain::ports::PersistedState;

/// Record tables at one store revision.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub(crate) revision: u64,
    pub(crate) pools: BTreeMap<PoolId, Pool>,
    pub(crate) volumes: BTreeMap<VolumeId, Volume>,
    pub(crate) replicas: BTreeMap<ReplicaId, Replica>,
    pub(crate) nexuses: BTreeMap<NexusId, Nexus>,
}

/// A consistent read-only view of the store.
///
/// Snapshots are cheap to take and never observe a partially applied
/// transaction.
pub type Snapshot = Arc<Tables>;

impl Tables {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn volume(&self, id: &VolumeId) -> Option<&Volume> {
        self.volumes.get(id)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn volume_by_name(&self, name: &str) -> Option<&Volume> {
        self.volumes
            .get(&VolumeId::from_name(name))
            .filter(|v| v.name == name)
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub fn pool(&self, id: &PoolId) -> Option<&Pool> {
        self.pools.get(id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn pools_on_node<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Pool> + 'a {
        self.pools.values().filter(move |p| &p.node == node)
    }

    /// Free bytes across pools whose node satisfies `include`.
    pub fn free_capacity(&self, include: impl Fn(&NodeId) -> bool) -> u64 {
        self.pools
            .values()
            .filter(|p| include(&p.node))
            .map(Pool::free)
            .sum()
    }

    /// Largest free extent in a single pool whose node satisfies `include`.
    pub fn max_pool_free(&self, include: impl Fn(&NodeId) -> bool) -> u64 {
        self.pools
            .values()
            .filter(|p| include(&p.node))
            .map(Pool::free)
            .max()
            .unwrap_or(0)
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    pub fn replica(&self, id: &ReplicaId) -> Option<&Replica> {
        self.replicas.get(id)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn replicas_of(&self, volume: &VolumeId) -> Vec<&Replica> {
        self.replicas
            .values()
            .filter(|r| &r.volume == volume)
            .collect()
    }

    pub fn replicas_on_node(&self, node: &NodeId) -> Vec<&Replica> {
        self.replicas.values().filter(|r| &r.node == node).collect()
    }

    pub fn replicas_in_pool(&self, pool: &PoolId) -> Vec<&Replica> {
        self.replicas.values().filter(|r| &r.pool == pool).collect()
    }

    /// Online replicas of `volume` that are children of its nexus.
    pub fn healthy_children(&self, volume: &Volume) -> Vec<&Replica> {
        let Some(nexus) = volume.nexus.as_ref().and_then(|id| self.nexuses.get(id)) else {
            return Vec::new();
        };
        nexus
            .children
            .iter()
            .filter_map(|id| self.replicas.get(id))
            .filter(|r| r.state == ReplicaState::Online)
            .collect()
    }

    // =========================================================================
    // Nexuses
    // =========================================================================

    pub fn nexus(&self, id: &NexusId) -> Option<&Nexus> {
        self.nexuses.get(id)
    }

    pub fn nexuses(&self) -> impl Iterator<Item = &Nexus> {
        self.nexuses.values()
    }

    /// Nexus owned by `volume`, following the volume's reference first.
    pub fn nexus_of(&self, volume: &VolumeId) -> Option<&Nexus> {
        self.volumes
            .get(volume)
            .and_then(|v| v.nexus.as_ref())
            .and_then(|id| self.nexuses.get(id))
            .or_else(|| {
                self.nexuses
                    .values()
                    .find(|n| &n.volume == volume && n.state != NexusState::Destroying)
            })
    }

    pub fn nexuses_of(&self, volume: &VolumeId) -> Vec<&Nexus> {
        self.nexuses
            .values()
            .filter(|n| &n.volume == volume)
            .collect()
    }

    pub fn nexuses_on_node(&self, node: &NodeId) -> Vec<&Nexus> {
        self.nexuses.values().filter(|n| &n.node == node).collect()
    }

    /// Volumes with a replica or nexus on `node`.
    pub fn volumes_touching_node(&self, node: &NodeId) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = self
            .replicas
            .values()
            .filter(|r| &r.node == node)
            .map(|r| r.volume.clone())
            .chain(
                self.nexuses
                    .values()
                    .filter(|n| &n.node == node)
                    .map(|n| n.volume.clone()),
            )
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Whether anything in the store still references `node`.
    pub fn node_referenced(&self, node: &NodeId) -> bool {
        self.pools.values().any(|p| &p.node == node)
            || self.replicas.values().any(|r| &r.node == node)
            || self.nexuses.values().any(|n| &n.node == node)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            revision: self.revision,
            pools: self.pools.values().cloned().collect(),
            volumes: self.volumes.values().cloned().collect(),
            replicas: self.replicas.values().cloned().collect(),
            nexuses: self.nexuses.values().cloned().collect(),
        }
    }

    pub(crate) fn from_persisted(state: PersistedState) -> Self {
        Self {
            revision: state.revision,
            pools: state.pools.into_iter().map(|p| (p.id.clone(), p)).collect(),
            volumes: state
                .volumes
                .into_iter()
                .map(|v| (v.id.clone(), v))
                .collect(),
            replicas: state
                .replicas
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            nexuses: state
                .nexuses
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect(),
        }
    }
}
