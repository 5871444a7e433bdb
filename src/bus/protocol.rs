//! Node Agent Protocol
//!
//! Typed messages exchanged with node agents over the message bus. Every
//! command has exactly one explicit shape, and both directions carry the
//! protocol version so a mismatched agent is rejected instead of
//! misinterpreted.
//!
//! All commands are idempotent at the receiver: re-sending `CreateReplica`
//! for an existing replica returns the same reply, destroying a missing
//! object acknowledges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::model::{NexusId, NodeId, PoolId, ReplicaId, VolumeId};
use crate::error::{Error, Result};

/// Version of the node agent protocol spoken by this control plane.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Commands
// =============================================================================

/// A request addressed to a single node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    CreatePool {
        pool: PoolId,
        disks: Vec<String>,
    },
    DestroyPool {
        pool: PoolId,
    },
    /// Create a replica and export it over NVMe-oF
    CreateReplica {
        replica: ReplicaId,
        pool: PoolId,
        volume: VolumeId,
        size: u64,
    },
    DestroyReplica {
        replica: ReplicaId,
        pool: PoolId,
    },
    CreateNexus {
        nexus: NexusId,
        volume: VolumeId,
        size: u64,
        children: Vec<String>,
    },
    DestroyNexus {
        nexus: NexusId,
    },
    /// Export the nexus as an NVMe-oF target
    ShareNexus {
        nexus: NexusId,
    },
    UnshareNexus {
        nexus: NexusId,
    },
    AddNexusChild {
        nexus: NexusId,
        child: String,
    },
    RemoveNexusChild {
        nexus: NexusId,
        child: String,
    },
    /// Copy the nexus contents onto `child` before it joins the nexus
    StartRebuild {
        nexus: NexusId,
        child: String,
    },
    RebuildProgress {
        nexus: NexusId,
        child: String,
    },
}

impl Command {
    /// Command name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreatePool { .. } => "create_pool",
            Command::DestroyPool { .. } => "destroy_pool",
            Command::CreateReplica { .. } => "create_replica",
            Command::DestroyReplica { .. } => "destroy_replica",
            Command::CreateNexus { .. } => "create_nexus",
            Command::DestroyNexus { .. } => "destroy_nexus",
            Command::ShareNexus { .. } => "share_nexus",
            Command::UnshareNexus { .. } => "unshare_nexus",
            Command::AddNexusChild { .. } => "add_nexus_child",
            Command::RemoveNexusChild { .. } => "remove_nexus_child",
            Command::StartRebuild { .. } => "start_rebuild",
            Command::RebuildProgress { .. } => "rebuild_progress",
        }
    }
}

/// Versioned request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// Correlation id echoed in the reply
    pub id: Uuid,
    pub node: NodeId,
    #[serde(flatten)]
    pub command: Command,
}

impl Envelope {
    pub fn new(node: NodeId, command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            node,
            command,
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Pool inventory as reported by a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub id: PoolId,
    #[serde(default)]
    pub disks: Vec<String>,
    pub capacity: u64,
    pub used: u64,
}

/// Progress of a rebuild onto a new child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RebuildState {
    Running { percent: u8 },
    Complete,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    NotFound,
    AlreadyExists,
    NoSpace,
    InvalidArgument,
    Internal,
}

/// Error reported by a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Pool(PoolReport),
    Replica { uri: String },
    Nexus { nexus: NexusId, children: Vec<String> },
    Shared { uri: String },
    Rebuild(RebuildState),
    Error(AgentError),
}

/// Versioned reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub version: u32,
    pub id: Uuid,
    #[serde(flatten)]
    pub reply: Reply,
}

impl ReplyEnvelope {
    pub fn new(id: Uuid, reply: Reply) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            reply,
        }
    }

    /// Validate version and correlation id, then turn agent errors into
    /// control plane errors.
    pub fn into_result(self, request: &Envelope) -> Result<Reply> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "node {} replied with protocol v{}, expected v{}",
                request.node, self.version, PROTOCOL_VERSION
            )));
        }
        if self.id != request.id {
            return Err(Error::Protocol(format!(
                "node {} replied to {} while {} was outstanding",
                request.node, self.id, request.id
            )));
        }

        match self.reply {
            Reply::Error(err) => Err(agent_error(&request.node, &request.command, err)),
            reply => Ok(reply),
        }
    }
}

fn agent_error(node: &NodeId, command: &Command, err: AgentError) -> Error {
    match err.kind {
        AgentErrorKind::NotFound => Error::NotFound {
            kind: "node object",
            id: err.message,
        },
        AgentErrorKind::AlreadyExists => Error::AlreadyExists {
            kind: "node object",
            id: err.message,
        },
        AgentErrorKind::NoSpace => Error::InsufficientResources(format!(
            "node {} has no space for {}: {}",
            node,
            command.name(),
            err.message
        )),
        AgentErrorKind::InvalidArgument | AgentErrorKind::Internal => Error::NodeRejected {
            node: node.to_string(),
            command: command.name().to_string(),
            reason: err.message,
        },
    }
}

// =============================================================================
// Node Events
// =============================================================================

/// Publications from node agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    Register {
        node: NodeId,
        endpoint: String,
        #[serde(default)]
        pools: Vec<PoolReport>,
        #[serde(default = "default_version")]
        version: u32,
    },
    Heartbeat {
        node: NodeId,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        pools: Option<Vec<PoolReport>>,
    },
    Deregister {
        node: NodeId,
    },
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl NodeEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            NodeEvent::Register { node, .. }
            | NodeEvent::Heartbeat { node, .. }
            | NodeEvent::Deregister { node } => node,
        }
    }
}
