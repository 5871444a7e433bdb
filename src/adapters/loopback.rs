//! Loopback Transport Adapter
//!
//! In-process node agents for local development and tests.
//!
//! [`SimulatedNode`] keeps agent state in memory and answers commands the
//! way a node agent does: creates are idempotent, destroying a missing
//! object acknowledges, and a pool refuses replicas it has no room for.
//! [`LoopbackTransport`] routes envelopes to registered simulated nodes.
//! An unreachable node answers nothing, which the transport reports as a
//! timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bus::protocol::{
    AgentError, AgentErrorKind, Command, Envelope, NodeEvent, PoolReport, RebuildState, Reply,
    ReplyEnvelope, PROTOCOL_VERSION,
};
use crate::bus::MessageBus;
use crate::domain::model::{NexusId, NodeId, PoolId, ReplicaId};
use crate::domain::ports::NodeTransport;
use crate::error::{Error, Result};

/// Endpoint scheme of simulated node agents.
pub const LOOPBACK_SCHEME: &str = "loopback://";

/// Capacity a simulated agent reports per disk.
pub const SIMULATED_DISK_CAPACITY: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct SimReplica {
    pool: PoolId,
    size: u64,
    uri: String,
}

#[derive(Debug, Clone, Default)]
struct SimNexus {
    children: Vec<String>,
    share_uri: Option<String>,
}

#[derive(Debug, Default)]
struct AgentState {
    pools: BTreeMap<PoolId, PoolReport>,
    replicas: BTreeMap<ReplicaId, SimReplica>,
    nexuses: BTreeMap<NexusId, SimNexus>,
    rebuilds: BTreeMap<(NexusId, String), u8>,
}

// =============================================================================
// Simulated Node
// =============================================================================

/// An in-memory node agent.
#[derive(Debug)]
pub struct SimulatedNode {
    id: NodeId,
    state: Mutex<AgentState>,
    reachable: AtomicBool,
    failures: Mutex<HashMap<&'static str, AgentErrorKind>>,
    /// Percent added per rebuild progress poll
    rebuild_step: AtomicU8,
    fail_rebuilds: AtomicBool,
    received: Mutex<Vec<Command>>,
}

impl SimulatedNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(AgentState::default()),
            reachable: AtomicBool::new(true),
            failures: Mutex::new(HashMap::new()),
            rebuild_step: AtomicU8::new(100),
            fail_rebuilds: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Add a pool the agent already owns, as if discovered at startup.
    pub fn with_pool(self, pool: impl Into<PoolId>, capacity: u64) -> Self {
        let pool = pool.into();
        self.state.lock().pools.insert(
            pool.clone(),
            PoolReport {
                id: pool,
                disks: Vec::new(),
                capacity,
                used: 0,
            },
        );
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", LOOPBACK_SCHEME, self.id)
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Stop (or resume) answering commands.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Answer every `command` (by [`Command::name`]) with an agent error.
    pub fn fail_command(&self, command: &'static str, kind: AgentErrorKind) {
        self.failures.lock().insert(command, kind);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Percent a rebuild advances per progress poll.
    pub fn set_rebuild_step(&self, percent: u8) {
        self.rebuild_step.store(percent.max(1), Ordering::SeqCst);
    }

    pub fn fail_rebuilds(&self, fail: bool) {
        self.fail_rebuilds.store(fail, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn pool_reports(&self) -> Vec<PoolReport> {
        self.state.lock().pools.values().cloned().collect()
    }

    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.state.lock().replicas.keys().cloned().collect()
    }

    pub fn has_replica(&self, id: &ReplicaId) -> bool {
        self.state.lock().replicas.contains_key(id)
    }

    pub fn nexus_ids(&self) -> Vec<NexusId> {
        self.state.lock().nexuses.keys().cloned().collect()
    }

    pub fn nexus_children(&self, id: &NexusId) -> Option<Vec<String>> {
        self.state.lock().nexuses.get(id).map(|n| n.children.clone())
    }

    pub fn is_shared(&self, id: &NexusId) -> bool {
        self.state
            .lock()
            .nexuses
            .get(id)
            .is_some_and(|n| n.share_uri.is_some())
    }

    /// Commands received so far, in arrival order.
    pub fn received(&self) -> Vec<Command> {
        self.received.lock().clone()
    }

    /// Registration event for this agent.
    pub fn register_event(&self) -> NodeEvent {
        NodeEvent::Register {
            node: self.id.clone(),
            endpoint: self.endpoint(),
            pools: self.pool_reports(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn heartbeat_event(&self) -> NodeEvent {
        NodeEvent::Heartbeat {
            node: self.id.clone(),
            timestamp: Utc::now(),
            pools: Some(self.pool_reports()),
        }
    }

    // =========================================================================
    // Command handling
    // =========================================================================

    fn nvmf_uri(&self, target: impl std::fmt::Display) -> String {
        format!("nvmf://{}:8420/nqn.2019-05.io.couchestor:{}", self.id, target)
    }

    /// Execute one command against the agent state.
    pub fn handle(&self, command: Command) -> Reply {
        self.received.lock().push(command.clone());
        if let Some(kind) = self.failures.lock().get(command.name()).copied() {
            return agent_error(kind, format!("injected failure for {}", command.name()));
        }

        let mut state = self.state.lock();
        match command {
            Command::CreatePool { pool, disks } => {
                let report = state
                    .pools
                    .entry(pool.clone())
                    .or_insert_with(|| PoolReport {
                        id: pool,
                        capacity: SIMULATED_DISK_CAPACITY * disks.len().max(1) as u64,
                        disks,
                        used: 0,
                    });
                Reply::Pool(report.clone())
            }
            Command::DestroyPool { pool } => {
                if state.replicas.values().any(|r| r.pool == pool) {
                    return agent_error(AgentErrorKind::InvalidArgument, format!("pool {} is busy", pool));
                }
                state.pools.remove(&pool);
                Reply::Ack
            }
            Command::CreateReplica {
                replica,
                pool,
                size,
                ..
            } => {
                if let Some(existing) = state.replicas.get(&replica) {
                    return Reply::Replica {
                        uri: existing.uri.clone(),
                    };
                }
                let Some(report) = state.pools.get_mut(&pool) else {
                    return agent_error(AgentErrorKind::NotFound, format!("pool {} not found", pool));
                };
                if report.capacity.saturating_sub(report.used) < size {
                    return agent_error(AgentErrorKind::NoSpace, format!("pool {} is full", pool));
                }
                report.used += size;
                let uri = self.nvmf_uri(&replica);
                state.replicas.insert(
                    replica,
                    SimReplica {
                        pool,
                        size,
                        uri: uri.clone(),
                    },
                );
                Reply::Replica { uri }
            }
            Command::DestroyReplica { replica, .. } => {
                if let Some(removed) = state.replicas.remove(&replica) {
                    if let Some(report) = state.pools.get_mut(&removed.pool) {
                        report.used = report.used.saturating_sub(removed.size);
                    }
                }
                Reply::Ack
            }
            Command::CreateNexus {
                nexus, children, ..
            } => {
                if let Some(existing) = state.nexuses.get(&nexus) {
                    return Reply::Nexus {
                        nexus,
                        children: existing.children.clone(),
                    };
                }
                for child in &children {
                    if let Some(local) = child.strip_prefix("bdev:///") {
                        if !state.replicas.contains_key(&ReplicaId::new(local)) {
                            return agent_error(
                                AgentErrorKind::NotFound,
                                format!("local replica {} not found", local),
                            );
                        }
                    }
                }
                state.nexuses.insert(
                    nexus.clone(),
                    SimNexus {
                        children: children.clone(),
                        share_uri: None,
                    },
                );
                Reply::Nexus { nexus, children }
            }
            Command::DestroyNexus { nexus } => {
                state.nexuses.remove(&nexus);
                state.rebuilds.retain(|(n, _), _| n != &nexus);
                Reply::Ack
            }
            Command::ShareNexus { nexus } => {
                let uri = self.nvmf_uri(format_args!("nexus-{}", nexus));
                match state.nexuses.get_mut(&nexus) {
                    Some(entry) => {
                        entry.share_uri = Some(uri.clone());
                        Reply::Shared { uri }
                    }
                    None => agent_error(AgentErrorKind::NotFound, format!("nexus {} not found", nexus)),
                }
            }
            Command::UnshareNexus { nexus } => {
                if let Some(entry) = state.nexuses.get_mut(&nexus) {
                    entry.share_uri = None;
                }
                Reply::Ack
            }
            Command::AddNexusChild { nexus, child } => match state.nexuses.get_mut(&nexus) {
                Some(entry) => {
                    if !entry.children.contains(&child) {
                        entry.children.push(child);
                    }
                    Reply::Ack
                }
                None => agent_error(AgentErrorKind::NotFound, format!("nexus {} not found", nexus)),
            },
            Command::RemoveNexusChild { nexus, child } => {
                if let Some(entry) = state.nexuses.get_mut(&nexus) {
                    entry.children.retain(|c| c != &child);
                }
                Reply::Ack
            }
            Command::StartRebuild { nexus, child } => {
                if !state.nexuses.contains_key(&nexus) {
                    return agent_error(AgentErrorKind::NotFound, format!("nexus {} not found", nexus));
                }
                if self.fail_rebuilds.load(Ordering::SeqCst) {
                    return Reply::Rebuild(RebuildState::Failed {
                        reason: "source read error".into(),
                    });
                }
                let percent = *state.rebuilds.entry((nexus, child)).or_insert(0);
                Reply::Rebuild(RebuildState::Running { percent })
            }
            Command::RebuildProgress { nexus, child } => {
                let step = self.rebuild_step.load(Ordering::SeqCst);
                let failing = self.fail_rebuilds.load(Ordering::SeqCst);
                let Some(percent) = state.rebuilds.get_mut(&(nexus.clone(), child.clone())) else {
                    return agent_error(
                        AgentErrorKind::NotFound,
                        format!("no rebuild of {} on nexus {}", child, nexus),
                    );
                };
                if failing {
                    return Reply::Rebuild(RebuildState::Failed {
                        reason: "target write error".into(),
                    });
                }
                *percent = percent.saturating_add(step).min(100);
                if *percent >= 100 {
                    Reply::Rebuild(RebuildState::Complete)
                } else {
                    Reply::Rebuild(RebuildState::Running { percent: *percent })
                }
            }
        }
    }
}

fn agent_error(kind: AgentErrorKind, message: String) -> Reply {
    Reply::Error(AgentError { kind, message })
}

// =============================================================================
// Transport
// =============================================================================

/// Routes envelopes to simulated nodes by endpoint.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    nodes: DashMap<String, Arc<SimulatedNode>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a simulated node; returns its endpoint.
    pub fn add_node(&self, node: Arc<SimulatedNode>) -> String {
        let endpoint = node.endpoint();
        self.nodes.insert(endpoint.clone(), node);
        endpoint
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<SimulatedNode>> {
        self.nodes
            .get(&format!("{}{}", LOOPBACK_SCHEME, id))
            .map(|n| n.value().clone())
    }

    pub fn nodes(&self) -> Vec<Arc<SimulatedNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }
}

#[async_trait]
impl NodeTransport for LoopbackTransport {
    async fn send(&self, endpoint: &str, envelope: Envelope) -> Result<ReplyEnvelope> {
        let unreachable = || Error::Timeout {
            node: envelope.node.to_string(),
            timeout_ms: 0,
        };
        let node = self
            .nodes
            .get(endpoint)
            .map(|n| n.value().clone())
            .ok_or_else(unreachable)?;
        if !node.is_reachable() {
            return Err(unreachable());
        }

        // Let other tasks interleave as they would around a network hop
        tokio::task::yield_now().await;
        trace!(node = %envelope.node, command = envelope.command.name(), "Loopback request");
        let reply = node.handle(envelope.command.clone());
        Ok(ReplyEnvelope::new(envelope.id, reply))
    }
}

/// Publish registration and periodic heartbeats for every reachable
/// simulated node until `shutdown` fires.
pub async fn run_simulated_fleet(
    transport: Arc<LoopbackTransport>,
    bus: Arc<MessageBus>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    for node in transport.nodes() {
        debug!(node = %node.id(), "Registering simulated node");
        bus.publish(node.register_event());
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for node in transport.nodes().into_iter().filter(|n| n.is_reachable()) {
                    bus.publish(node.heartbeat_event());
                }
            }
        }
    }
}
