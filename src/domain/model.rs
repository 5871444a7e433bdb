//! Domain Model
//!
//! Entities tracked by the control plane: nodes, pools, replicas, nexuses
//! and volumes. Every entity carries a `version` used for optimistic
//! concurrency in the volume store; a version of `0` means "not yet stored".

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Storage node identifier (the node agent's name).
    NodeId
);
string_id!(
    /// Pool identifier, unique across the fleet.
    PoolId
);
string_id!(
    /// Volume identifier, derived from the CSI volume name.
    VolumeId
);
string_id!(
    /// Replica identifier.
    ReplicaId
);
string_id!(
    /// Nexus identifier.
    NexusId
);

/// Namespace for deriving volume ids from CSI names.
const VOLUME_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c0b_3f2e_8a4d_4e6b_9f1a_2d7c_5e8b_1a3f);

impl VolumeId {
    /// Derive the stable volume id for a CSI volume name.
    ///
    /// The same name always yields the same id, which makes CreateVolume
    /// idempotent without a separate name index lookup.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&VOLUME_ID_NAMESPACE, name.as_bytes()).to_string())
    }
}

impl ReplicaId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl NexusId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// =============================================================================
// Node
// =============================================================================

/// Node health as seen by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Online => write!(f, "Online"),
            NodeState::Offline => write!(f, "Offline"),
            NodeState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A storage node running a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Address the node agent accepts commands on
    pub endpoint: String,
    pub state: NodeState,
    pub pools: BTreeSet<PoolId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
    pub version: u64,
}

impl Node {
    pub fn new(id: NodeId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            state: NodeState::Unknown,
            pools: BTreeSet::new(),
            last_heartbeat: None,
            missed_heartbeats: 0,
            version: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Node-local aggregation of block devices providing replica capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub node: NodeId,
    #[serde(default)]
    pub disks: Vec<String>,
    /// Total capacity in bytes
    pub capacity: u64,
    /// Used capacity in bytes
    pub used: u64,
    #[serde(default)]
    pub version: u64,
}

impl Pool {
    pub fn new(id: PoolId, node: NodeId, capacity: u64) -> Self {
        Self {
            id,
            node,
            disks: Vec::new(),
            capacity,
            used: 0,
            version: 0,
        }
    }

    /// Free capacity in bytes.
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Fraction of the pool in use; an empty pool reports fully used.
    pub fn usage_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

// =============================================================================
// Replica
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    Creating,
    Online,
    Faulted,
    Destroying,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Creating => write!(f, "Creating"),
            ReplicaState::Online => write!(f, "Online"),
            ReplicaState::Faulted => write!(f, "Faulted"),
            ReplicaState::Destroying => write!(f, "Destroying"),
        }
    }
}

/// A per-node backing slice of a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub volume: VolumeId,
    pub pool: PoolId,
    pub node: NodeId,
    pub size: u64,
    /// NVMe-oF share URI returned by the node agent
    pub uri: Option<String>,
    pub state: ReplicaState,
    /// Set while the replica is being filled by a rebuild
    #[serde(default)]
    pub rebuilding: bool,
    #[serde(default)]
    pub version: u64,
}

impl Replica {
    pub fn new(volume: VolumeId, pool: &Pool, size: u64) -> Self {
        Self {
            id: ReplicaId::generate(),
            volume,
            pool: pool.id.clone(),
            node: pool.node.clone(),
            size,
            uri: None,
            state: ReplicaState::Creating,
            rebuilding: false,
            version: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == ReplicaState::Online
    }

    /// URI the nexus uses to open this replica from `nexus_node`.
    ///
    /// A replica on the nexus host is opened locally; remote replicas are
    /// reached through their NVMe-oF share.
    pub fn child_uri(&self, nexus_node: &NodeId) -> String {
        match (&self.node == nexus_node, &self.uri) {
            (false, Some(uri)) => uri.clone(),
            _ => format!("bdev:///{}", self.id),
        }
    }
}

// =============================================================================
// Nexus
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NexusState {
    Creating,
    Online,
    Degraded,
    Faulted,
    Destroying,
}

impl std::fmt::Display for NexusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NexusState::Creating => write!(f, "Creating"),
            NexusState::Online => write!(f, "Online"),
            NexusState::Degraded => write!(f, "Degraded"),
            NexusState::Faulted => write!(f, "Faulted"),
            NexusState::Destroying => write!(f, "Destroying"),
        }
    }
}

/// Per-volume frontend aggregating replicas into one servable target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nexus {
    pub id: NexusId,
    pub volume: VolumeId,
    pub node: NodeId,
    pub size: u64,
    /// Ordered child replicas; the volume owns their lifecycle
    pub children: Vec<ReplicaId>,
    pub state: NexusState,
    /// NVMe-oF target URI while the volume is published
    pub share_uri: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl Nexus {
    pub fn new(volume: VolumeId, node: NodeId, size: u64, children: Vec<ReplicaId>) -> Self {
        Self {
            id: NexusId::generate(),
            volume,
            node,
            size,
            children,
            state: NexusState::Creating,
            share_uri: None,
            version: 0,
        }
    }

    pub fn has_child(&self, replica: &ReplicaId) -> bool {
        self.children.contains(replica)
    }
}

// =============================================================================
// Volume
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Creating,
    Online,
    Degraded,
    Faulted,
    Destroying,
}

impl VolumeState {
    /// State implied by the number of healthy nexus children.
    pub fn from_health(healthy: usize, desired: usize) -> Self {
        if healthy == 0 {
            VolumeState::Faulted
        } else if healthy < desired {
            VolumeState::Degraded
        } else {
            VolumeState::Online
        }
    }

    pub fn is_servable(&self) -> bool {
        matches!(self, VolumeState::Online | VolumeState::Degraded)
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Creating => write!(f, "Creating"),
            VolumeState::Online => write!(f, "Online"),
            VolumeState::Degraded => write!(f, "Degraded"),
            VolumeState::Faulted => write!(f, "Faulted"),
            VolumeState::Destroying => write!(f, "Destroying"),
        }
    }
}

/// Where a volume is attached for I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// CSI node id of the consumer
    pub node: String,
    /// Connection descriptor handed to the node plugin
    pub uri: String,
}

/// Requested shape of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size: u64,
    pub replica_count: usize,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, size: u64, replica_count: usize) -> Self {
        Self {
            name: name.into(),
            size,
            replica_count,
        }
    }

    pub fn volume_id(&self) -> VolumeId {
        VolumeId::from_name(&self.name)
    }
}

/// A replicated block volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size: u64,
    pub replica_count: usize,
    pub state: VolumeState,
    pub nexus: Option<NexusId>,
    pub publication: Option<Publication>,
    #[serde(default)]
    pub version: u64,
}

impl Volume {
    pub fn new(spec: &VolumeSpec) -> Self {
        Self {
            id: spec.volume_id(),
            name: spec.name.clone(),
            size: spec.size,
            replica_count: spec.replica_count,
            state: VolumeState::Creating,
            nexus: None,
            publication: None,
            version: 0,
        }
    }

    /// Whether the stored volume was created with the same parameters.
    pub fn matches(&self, spec: &VolumeSpec) -> bool {
        self.name == spec.name && self.size == spec.size && self.replica_count == spec.replica_count
    }
}
