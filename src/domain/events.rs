//! Domain Events
//!
//! Immutable records of significant occurrences in the control plane:
//! volume lifecycle, replica faults and rebuilds, nexus recovery and node
//! health transitions. They are published through the
//! [`EventPublisher`](super::ports::EventPublisher) port for audit logging
//! and for assertions in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::model::{NodeState, Replica, VolumeState};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Volume Events
    // =========================================================================
    /// A new volume was created and is servable.
    VolumeCreated {
        volume_id: String,
        size_bytes: u64,
        replicas: usize,
        timestamp: DateTime<Utc>,
    },

    /// A volume was deleted (possibly with cleanup still pending).
    VolumeDeleted {
        volume_id: String,
        pending_cleanup: bool,
        timestamp: DateTime<Utc>,
    },

    /// A volume changed state.
    VolumeStateChanged {
        volume_id: String,
        old_state: String,
        new_state: String,
        timestamp: DateTime<Utc>,
    },

    /// A volume was published to a node.
    VolumePublished {
        volume_id: String,
        node: String,
        uri: String,
        timestamp: DateTime<Utc>,
    },

    /// A volume was unpublished.
    VolumeUnpublished {
        volume_id: String,
        node: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Replica Events
    // =========================================================================
    /// A replica was added to a volume.
    ReplicaAdded {
        volume_id: String,
        replica_id: String,
        pool: String,
        node: String,
        timestamp: DateTime<Utc>,
    },

    /// A replica was removed from a volume.
    ReplicaRemoved {
        volume_id: String,
        replica_id: String,
        pool: String,
        timestamp: DateTime<Utc>,
    },

    /// A replica became faulted.
    ReplicaFaulted {
        volume_id: String,
        replica_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild onto a new replica was started.
    RebuildStarted {
        volume_id: String,
        replica_id: String,
        node: String,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild completed and the replica joined the nexus.
    RebuildCompleted {
        volume_id: String,
        replica_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild failed; the target replica is discarded.
    RebuildFailed {
        volume_id: String,
        replica_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Nexus Events
    // =========================================================================
    /// The nexus was recreated on another node.
    NexusRecreated {
        volume_id: String,
        nexus_id: String,
        old_node: String,
        new_node: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Fleet Events
    // =========================================================================
    /// A node changed health state.
    NodeStateChanged {
        node_id: String,
        old_state: String,
        new_state: String,
        timestamp: DateTime<Utc>,
    },

    /// A pool was created on a node.
    PoolCreated {
        pool_id: String,
        node_id: String,
        capacity_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pool was destroyed.
    PoolDestroyed {
        pool_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::VolumeCreated { timestamp, .. }
            | DomainEvent::VolumeDeleted { timestamp, .. }
            | DomainEvent::VolumeStateChanged { timestamp, .. }
            | DomainEvent::VolumePublished { timestamp, .. }
            | DomainEvent::VolumeUnpublished { timestamp, .. }
            | DomainEvent::ReplicaAdded { timestamp, .. }
            | DomainEvent::ReplicaRemoved { timestamp, .. }
            | DomainEvent::ReplicaFaulted { timestamp, .. }
            | DomainEvent::RebuildStarted { timestamp, .. }
            | DomainEvent::RebuildCompleted { timestamp, .. }
            | DomainEvent::RebuildFailed { timestamp, .. }
            | DomainEvent::NexusRecreated { timestamp, .. }
            | DomainEvent::NodeStateChanged { timestamp, .. }
            | DomainEvent::PoolCreated { timestamp, .. }
            | DomainEvent::PoolDestroyed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::VolumeCreated { .. } => "VolumeCreated",
            DomainEvent::VolumeDeleted { .. } => "VolumeDeleted",
            DomainEvent::VolumeStateChanged { .. } => "VolumeStateChanged",
            DomainEvent::VolumePublished { .. } => "VolumePublished",
            DomainEvent::VolumeUnpublished { .. } => "VolumeUnpublished",
            DomainEvent::ReplicaAdded { .. } => "ReplicaAdded",
            DomainEvent::ReplicaRemoved { .. } => "ReplicaRemoved",
            DomainEvent::ReplicaFaulted { .. } => "ReplicaFaulted",
            DomainEvent::RebuildStarted { .. } => "RebuildStarted",
            DomainEvent::RebuildCompleted { .. } => "RebuildCompleted",
            DomainEvent::RebuildFailed { .. } => "RebuildFailed",
            DomainEvent::NexusRecreated { .. } => "NexusRecreated",
            DomainEvent::NodeStateChanged { .. } => "NodeStateChanged",
            DomainEvent::PoolCreated { .. } => "PoolCreated",
            DomainEvent::PoolDestroyed { .. } => "PoolDestroyed",
        }
    }

    /// Get the volume ID if applicable.
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            DomainEvent::VolumeCreated { volume_id, .. }
            | DomainEvent::VolumeDeleted { volume_id, .. }
            | DomainEvent::VolumeStateChanged { volume_id, .. }
            | DomainEvent::VolumePublished { volume_id, .. }
            | DomainEvent::VolumeUnpublished { volume_id, .. }
            | DomainEvent::ReplicaAdded { volume_id, .. }
            | DomainEvent::ReplicaRemoved { volume_id, .. }
            | DomainEvent::ReplicaFaulted { volume_id, .. }
            | DomainEvent::RebuildStarted { volume_id, .. }
            | DomainEvent::RebuildCompleted { volume_id, .. }
            | DomainEvent::RebuildFailed { volume_id, .. }
            | DomainEvent::NexusRecreated { volume_id, .. } => Some(volume_id),
            _ => None,
        }
    }

    /// Node the event concerns, for fleet events and node-scoped replica
    /// events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            DomainEvent::NodeStateChanged { node_id, .. }
            | DomainEvent::PoolCreated { node_id, .. }
            | DomainEvent::PoolDestroyed { node_id, .. } => Some(node_id),
            DomainEvent::ReplicaAdded { node, .. }
            | DomainEvent::RebuildStarted { node, .. }
            | DomainEvent::VolumePublished { node, .. }
            | DomainEvent::VolumeUnpublished { node, .. } => Some(node),
            DomainEvent::NexusRecreated { new_node, .. } => Some(new_node),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    pub fn volume_created(volume_id: impl Into<String>, size_bytes: u64, replicas: usize) -> Self {
        DomainEvent::VolumeCreated {
            volume_id: volume_id.into(),
            size_bytes,
            replicas,
            timestamp: Utc::now(),
        }
    }

    pub fn volume_deleted(volume_id: impl Into<String>, pending_cleanup: bool) -> Self {
        DomainEvent::VolumeDeleted {
            volume_id: volume_id.into(),
            pending_cleanup,
            timestamp: Utc::now(),
        }
    }

    pub fn volume_state_changed(
        volume_id: impl Into<String>,
        old_state: VolumeState,
        new_state: VolumeState,
    ) -> Self {
        DomainEvent::VolumeStateChanged {
            volume_id: volume_id.into(),
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn volume_published(
        volume_id: impl Into<String>,
        node: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        DomainEvent::VolumePublished {
            volume_id: volume_id.into(),
            node: node.into(),
            uri: uri.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn volume_unpublished(volume_id: impl Into<String>, node: impl Into<String>) -> Self {
        DomainEvent::VolumeUnpublished {
            volume_id: volume_id.into(),
            node: node.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn replica_added(replica: &Replica) -> Self {
        DomainEvent::ReplicaAdded {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            pool: replica.pool.to_string(),
            node: replica.node.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn replica_removed(replica: &Replica) -> Self {
        DomainEvent::ReplicaRemoved {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            pool: replica.pool.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn replica_faulted(replica: &Replica, reason: impl Into<String>) -> Self {
        DomainEvent::ReplicaFaulted {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_started(replica: &Replica) -> Self {
        DomainEvent::RebuildStarted {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            node: replica.node.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_completed(replica: &Replica, duration: Duration) -> Self {
        DomainEvent::RebuildCompleted {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_failed(replica: &Replica, reason: impl Into<String>) -> Self {
        DomainEvent::RebuildFailed {
            volume_id: replica.volume.to_string(),
            replica_id: replica.id.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn nexus_recreated(
        volume_id: impl Into<String>,
        nexus_id: impl Into<String>,
        old_node: impl Into<String>,
        new_node: impl Into<String>,
    ) -> Self {
        DomainEvent::NexusRecreated {
            volume_id: volume_id.into(),
            nexus_id: nexus_id.into(),
            old_node: old_node.into(),
            new_node: new_node.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node_state_changed(
        node_id: impl Into<String>,
        old_state: NodeState,
        new_state: NodeState,
    ) -> Self {
        DomainEvent::NodeStateChanged {
            node_id: node_id.into(),
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pool_created(
        pool_id: impl Into<String>,
        node_id: impl Into<String>,
        capacity_bytes: u64,
    ) -> Self {
        DomainEvent::PoolCreated {
            pool_id: pool_id.into(),
            node_id: node_id.into(),
            capacity_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn pool_destroyed(pool_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        DomainEvent::PoolDestroyed {
            pool_id: pool_id.into(),
            node_id: node_id.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
