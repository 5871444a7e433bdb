//! Shared fixtures for the integration tests.
//!
//! A [`Harness`] wires a control plane to simulated node agents over the
//! loopback transport, with in-memory persistence and an event collector.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use couchestor_cp::adapters::{
    InMemoryEventCollector, LoopbackTransport, MemoryBackend, SimulatedNode,
};
use couchestor_cp::bus::{BusConfig, Command, Envelope, ReplyEnvelope, RetryPolicy};
use couchestor_cp::controller::{ControlPlane, ControlPlaneConfig, ReconcilerConfig};
use couchestor_cp::domain::model::{NodeId, Volume, VolumeId, VolumeState};
use couchestor_cp::domain::ports::NodeTransport;
use couchestor_cp::registry::RegistryConfig;
use couchestor_cp::store::Snapshot;
use couchestor_cp::{Error, Result, Scheduler};

pub const GIB: u64 = 1 << 30;

/// Control plane settings scaled down for tests.
pub fn test_config() -> ControlPlaneConfig {
    ControlPlaneConfig {
        bus: BusConfig {
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            ..Default::default()
        },
        registry: RegistryConfig {
            heartbeat_interval: Duration::from_secs(1),
            missed_heartbeats: 3,
        },
        reconciler: ReconcilerConfig {
            reconcile_interval: Duration::from_millis(100),
            rebuild_poll_interval: Duration::from_millis(10),
            rebuild_poll_budget: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Loopback transport that shows each command to a test hook before it
/// reaches the agent. A hook returning an error fails the send.
pub struct InterceptingTransport {
    inner: Arc<LoopbackTransport>,
    hook: Box<dyn Fn(&Command) -> Option<Error> + Send + Sync>,
}

impl InterceptingTransport {
    pub fn new(
        inner: Arc<LoopbackTransport>,
        hook: impl Fn(&Command) -> Option<Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            hook: Box::new(hook),
        }
    }
}

#[async_trait]
impl NodeTransport for InterceptingTransport {
    async fn send(&self, endpoint: &str, envelope: Envelope) -> Result<ReplyEnvelope> {
        if let Some(e) = (self.hook)(&envelope.command) {
            return Err(e);
        }
        self.inner.send(endpoint, envelope).await
    }
}

fn fleet(count: usize, capacity: u64) -> Arc<LoopbackTransport> {
    let transport = Arc::new(LoopbackTransport::new());
    for i in 1..=count {
        let node = SimulatedNode::new(format!("node-{}", i))
            .with_pool(format!("pool-{}", i), capacity);
        transport.add_node(Arc::new(node));
    }
    transport
}

pub struct Harness {
    pub control_plane: Arc<ControlPlane>,
    pub transport: Arc<LoopbackTransport>,
    pub events: Arc<InMemoryEventCollector>,
    pub backend: Arc<MemoryBackend>,
}

impl Harness {
    /// `count` registered nodes named `node-N`, each with one 10GiB pool `pool-N`.
    pub async fn with_nodes(count: usize) -> Self {
        Self::build(test_config(), count, 10 * GIB).await
    }

    pub async fn build(config: ControlPlaneConfig, count: usize, capacity: u64) -> Self {
        Self::load(config, fleet(count, capacity), Arc::new(MemoryBackend::new())).await
    }

    /// Like [`Harness::with_nodes`], with every command passed through `hook`
    /// on its way to the agents.
    pub async fn intercepted(
        count: usize,
        hook: impl Fn(&Command) -> Option<Error> + Send + Sync + 'static,
    ) -> Self {
        Self::intercepted_with(count, Arc::new(MemoryBackend::new()), hook).await
    }

    pub async fn intercepted_with(
        count: usize,
        backend: Arc<MemoryBackend>,
        hook: impl Fn(&Command) -> Option<Error> + Send + Sync + 'static,
    ) -> Self {
        let transport = fleet(count, 10 * GIB);
        let wire = Arc::new(InterceptingTransport::new(transport.clone(), hook));
        Self::assemble(test_config(), transport, wire, backend).await
    }

    /// Assemble a control plane over existing agents and state, registering
    /// every reachable agent. Registration events are discarded.
    pub async fn load(
        config: ControlPlaneConfig,
        transport: Arc<LoopbackTransport>,
        backend: Arc<MemoryBackend>,
    ) -> Self {
        let wire: Arc<dyn NodeTransport> = transport.clone();
        Self::assemble(config, transport, wire, backend).await
    }

    async fn assemble(
        config: ControlPlaneConfig,
        transport: Arc<LoopbackTransport>,
        wire: Arc<dyn NodeTransport>,
        backend: Arc<MemoryBackend>,
    ) -> Self {
        let events = Arc::new(InMemoryEventCollector::new());
        let control_plane = ControlPlane::load(
            config,
            wire,
            backend.clone(),
            events.clone(),
        )
        .await
        .expect("control plane should load");

        let harness = Self {
            control_plane,
            transport,
            events,
            backend,
        };
        harness.register_all().await;
        harness.events.clear();
        harness
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.control_plane.scheduler()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.control_plane.store().snapshot()
    }

    pub fn node(&self, id: &str) -> Arc<SimulatedNode> {
        self.transport
            .node(&NodeId::new(id))
            .unwrap_or_else(|| panic!("no simulated node {}", id))
    }

    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.snapshot().volume(id).cloned()
    }

    pub async fn register_all(&self) {
        for node in self.transport.nodes().into_iter().filter(|n| n.is_reachable()) {
            self.control_plane
                .apply_node_event(&node.register_event())
                .await
                .expect("registration should succeed");
        }
    }

    /// Heartbeat every reachable agent.
    pub async fn heartbeat_reachable(&self) {
        for node in self.transport.nodes().into_iter().filter(|n| n.is_reachable()) {
            self.control_plane
                .apply_node_event(&node.heartbeat_event())
                .await
                .expect("heartbeat should succeed");
        }
    }

    /// Silence `id` and let it miss enough heartbeats to go Offline.
    ///
    /// Moves the clock, so the calling test must run with paused time.
    pub async fn take_offline(&self, id: &str) {
        self.node(id).set_reachable(false);
        let registry = self.control_plane.registry();
        let window = registry.config().heartbeat_interval * registry.config().missed_heartbeats;
        tokio::time::advance(window).await;
        self.heartbeat_reachable().await;
        registry.evaluate_liveness().await;
        assert!(
            registry.offline_nodes().contains(&NodeId::new(id)),
            "{} should be Offline",
            id
        );
    }

    /// Run reconcile passes until `id` reaches `state`, up to `ticks` passes.
    pub async fn reconcile_until(&self, id: &VolumeId, state: VolumeState, ticks: usize) -> bool {
        for _ in 0..ticks {
            self.control_plane.reconciler().tick().await;
            if self.volume(id).map(|v| v.state) == Some(state) {
                return true;
            }
        }
        false
    }

    /// Every replica held by a reachable agent has a record, and every
    /// replica or nexus record belongs to a stored volume.
    pub fn assert_no_orphans(&self) {
        let snapshot = self.snapshot();
        for node in self.transport.nodes().into_iter().filter(|n| n.is_reachable()) {
            for replica in node.replica_ids() {
                assert!(
                    snapshot.replica(&replica).is_some(),
                    "agent {} holds untracked replica {}",
                    node.id(),
                    replica
                );
            }
        }
        for replica in snapshot.replicas() {
            assert!(
                snapshot.volume(&replica.volume).is_some(),
                "replica {} outlived volume {}",
                replica.id,
                replica.volume
            );
        }
        for nexus in snapshot.nexuses() {
            assert!(
                snapshot.volume(&nexus.volume).is_some(),
                "nexus {} outlived volume {}",
                nexus.id,
                nexus.volume
            );
        }
    }
}
