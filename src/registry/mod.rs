//! Node Registry
//!
//! Tracks storage nodes, their pools and their health. Health is derived
//! from heartbeats: a node that misses `missed_heartbeats` consecutive
//! intervals goes Offline, and the next heartbeat or registration brings it
//! back Online. Every transition is sent to the reconciler as a
//! [`NodeStateChange`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::protocol::{NodeEvent, PoolReport};
use crate::domain::events::DomainEvent;
use crate::domain::model::{Node, NodeId, NodeState, Pool};
use crate::domain::ports::EventPublisher;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::VolumeStore;

/// Configuration for the node registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Expected interval between node heartbeats
    pub heartbeat_interval: Duration,
    /// Consecutive missed intervals before a node is marked Offline
    pub missed_heartbeats: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
        }
    }
}

/// A node health transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateChange {
    pub node: NodeId,
    pub old: NodeState,
    pub new: NodeState,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    last_seen: Instant,
}

pub struct NodeRegistry {
    config: RegistryConfig,
    nodes: DashMap<NodeId, NodeEntry>,
    store: Arc<VolumeStore>,
    changes: mpsc::UnboundedSender<NodeStateChange>,
    events: Arc<dyn EventPublisher>,
}

impl NodeRegistry {
    pub fn new(
        config: RegistryConfig,
        store: Arc<VolumeStore>,
        events: Arc<dyn EventPublisher>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeStateChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let registry = Self {
            config,
            nodes: DashMap::new(),
            store,
            changes,
            events,
        };
        (registry, rx)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create or refresh a node and merge its pool inventory.
    #[instrument(skip(self, pools), fields(pools = pools.len()))]
    pub async fn register_node(
        &self,
        id: &NodeId,
        endpoint: &str,
        pools: &[PoolReport],
    ) -> Result<Node> {
        if id.as_str().is_empty() {
            return Err(Error::InvalidArgument("node id must not be empty".into()));
        }

        self.merge_pools(id, pools)?;
        let pool_ids: BTreeSet<_> = self
            .store
            .snapshot()
            .pools_on_node(id)
            .map(|p| p.id.clone())
            .collect();

        let now = Instant::now();
        let (node, old) = {
            let mut entry = self.nodes.entry(id.clone()).or_insert_with(|| NodeEntry {
                node: Node::new(id.clone(), endpoint),
                last_seen: now,
            });
            let old = entry.node.state;
            entry.last_seen = now;
            entry.node.endpoint = endpoint.to_string();
            entry.node.state = NodeState::Online;
            entry.node.pools = pool_ids;
            entry.node.last_heartbeat = Some(Utc::now());
            entry.node.missed_heartbeats = 0;
            entry.node.version += 1;
            (entry.node.clone(), old)
        };

        info!(node = %id, endpoint, "Node registered");
        self.transition(id, old, NodeState::Online).await;
        Ok(node)
    }

    /// Refresh liveness.
    ///
    /// Fails with NotFound for nodes that never registered and for nodes
    /// seeded from persisted state, whose command endpoint is not known
    /// until the agent registers again.
    pub async fn heartbeat(
        &self,
        id: &NodeId,
        timestamp: DateTime<Utc>,
        pools: Option<&[PoolReport]>,
    ) -> Result<Node> {
        let registered = self
            .nodes
            .get(id)
            .is_some_and(|e| !e.node.endpoint.is_empty());
        if !registered {
            return Err(Error::not_found("node", id));
        }
        if let Some(pools) = pools {
            self.merge_pools(id, pools)?;
        }

        let (node, old) = {
            let mut entry = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::not_found("node", id))?;
            let old = entry.node.state;
            entry.last_seen = Instant::now();
            entry.node.last_heartbeat = Some(timestamp);
            entry.node.missed_heartbeats = 0;
            if old != NodeState::Online {
                entry.node.state = NodeState::Online;
                entry.node.version += 1;
            }
            (entry.node.clone(), old)
        };

        debug!(node = %id, "Heartbeat");
        self.transition(id, old, NodeState::Online).await;
        Ok(node)
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.node.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Node> {
        self.nodes
            .get(id)
            .map(|e| e.node.clone())
            .ok_or_else(|| Error::not_found("node", id))
    }

    pub fn is_online(&self, id: &NodeId) -> bool {
        self.nodes
            .get(id)
            .map(|e| e.node.is_online())
            .unwrap_or(false)
    }

    pub fn online_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|e| e.node.is_online())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Nodes known to be Offline. Unknown nodes are not included.
    pub fn offline_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|e| e.node.state == NodeState::Offline)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove a node nothing references any more. Unknown ids succeed.
    pub fn deregister_node(&self, id: &NodeId) -> Result<()> {
        if self.store.snapshot().node_referenced(id) {
            return Err(Error::FailedPrecondition(format!(
                "node {} still hosts pools or replicas",
                id
            )));
        }
        if self.nodes.remove(id).is_some() {
            info!(node = %id, "Node deregistered");
            metrics::set_online_nodes(self.online_nodes().len());
        }
        Ok(())
    }

    /// Track a node known from persisted state before it has registered.
    ///
    /// The node starts Unknown with a full heartbeat window, so its replicas
    /// are not faulted merely because the control plane restarted.
    pub fn seed_node(&self, id: &NodeId) {
        let now = Instant::now();
        let pools = self
            .store
            .snapshot()
            .pools_on_node(id)
            .map(|p| p.id.clone())
            .collect();
        self.nodes.entry(id.clone()).or_insert_with(|| {
            debug!(node = %id, "Seeded node from persisted state");
            let mut node = Node::new(id.clone(), "");
            node.pools = pools;
            NodeEntry {
                node,
                last_seen: now,
            }
        });
    }

    /// Seed every node referenced by a stored pool.
    pub fn seed_from_store(&self) -> usize {
        let nodes: BTreeSet<NodeId> = self
            .store
            .snapshot()
            .pools()
            .map(|p| p.node.clone())
            .collect();
        for node in &nodes {
            self.seed_node(node);
        }
        nodes.len()
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    pub async fn evaluate_liveness(&self) -> Vec<NodeStateChange> {
        self.evaluate_liveness_at(Instant::now()).await
    }

    /// Recount missed heartbeats as of `now` and take nodes Offline.
    pub async fn evaluate_liveness_at(&self, now: Instant) -> Vec<NodeStateChange> {
        let interval = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut went_offline = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            let elapsed = now.saturating_duration_since(entry.last_seen);
            let missed = (elapsed.as_nanos() / interval.as_nanos()) as u32;
            entry.node.missed_heartbeats = missed;

            if missed >= self.config.missed_heartbeats && entry.node.state != NodeState::Offline {
                let old = entry.node.state;
                entry.node.state = NodeState::Offline;
                entry.node.version += 1;
                went_offline.push(NodeStateChange {
                    node: entry.key().clone(),
                    old,
                    new: NodeState::Offline,
                });
            }
        }

        for change in &went_offline {
            warn!(
                node = %change.node,
                missed = self.config.missed_heartbeats,
                "Node missed heartbeats, marking Offline"
            );
            self.emit(change.clone()).await;
        }
        metrics::set_online_nodes(self.online_nodes().len());
        went_offline
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Apply one node agent event.
    pub async fn handle_event(&self, event: &NodeEvent) -> Result<()> {
        match event {
            NodeEvent::Register {
                node,
                endpoint,
                pools,
                version,
            } => {
                if *version != crate::bus::protocol::PROTOCOL_VERSION {
                    return Err(Error::Protocol(format!(
                        "node {} registered with protocol v{}",
                        node, version
                    )));
                }
                self.register_node(node, endpoint, pools).await.map(|_| ())
            }
            NodeEvent::Heartbeat {
                node,
                timestamp,
                pools,
            } => self
                .heartbeat(node, *timestamp, pools.as_deref())
                .await
                .map(|_| ()),
            NodeEvent::Deregister { node } => self.deregister_node(node),
        }
    }

    /// Consume node agent events and sweep liveness until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<NodeEvent>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.config.heartbeat_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            missed = self.config.missed_heartbeats,
            "Node registry started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.evaluate_liveness().await;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            warn!(node = %event.node(), error = %e, "Rejected node event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Node registry lagged behind node events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Node registry stopped");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn merge_pools(&self, node: &NodeId, reports: &[PoolReport]) -> Result<()> {
        for report in reports {
            self.store.upsert_pool(&report.id, |existing| match existing {
                Some(mut pool) => {
                    if pool.node != *node {
                        warn!(pool = %pool.id, from = %pool.node, to = %node, "Pool moved between nodes");
                    }
                    pool.node = node.clone();
                    pool.disks = report.disks.clone();
                    pool.capacity = report.capacity;
                    pool.used = report.used;
                    pool
                }
                None => {
                    let mut pool = Pool::new(report.id.clone(), node.clone(), report.capacity);
                    pool.disks = report.disks.clone();
                    pool.used = report.used;
                    pool
                }
            })?;
        }
        if !reports.is_empty() {
            if let Some(mut entry) = self.nodes.get_mut(node) {
                entry
                    .node
                    .pools
                    .extend(reports.iter().map(|r| r.id.clone()));
            }
        }
        Ok(())
    }

    async fn transition(&self, node: &NodeId, old: NodeState, new: NodeState) {
        if old == new {
            return;
        }
        info!(node = %node, from = %old, to = %new, "Node state changed");
        self.emit(NodeStateChange {
            node: node.clone(),
            old,
            new,
        })
        .await;
        metrics::set_online_nodes(self.online_nodes().len());
    }

    async fn emit(&self, change: NodeStateChange) {
        let event = DomainEvent::node_state_changed(change.node.as_str(), change.old, change.new);
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish node event");
        }
        if self.changes.send(change).is_err() {
            debug!("No reconciler listening for node state changes");
        }
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("config", &self.config)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::domain::model::PoolId;
    use assert_matches::assert_matches;

    fn registry() -> (
        NodeRegistry,
        mpsc::UnboundedReceiver<NodeStateChange>,
        Arc<VolumeStore>,
        Arc<InMemoryEventCollector>,
    ) {
        let store = Arc::new(VolumeStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let (registry, rx) = NodeRegistry::new(
            RegistryConfig {
                heartbeat_interval: Duration::from_secs(1),
                missed_heartbeats: 3,
            },
            store.clone(),
            events.clone(),
        );
        (registry, rx, store, events)
    }

    fn report(id: &str, capacity: u64, used: u64) -> PoolReport {
        PoolReport {
            id: PoolId::new(id),
            disks: vec!["/dev/nvme0n1".into()],
            capacity,
            used,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_merges_pools() {
        let (registry, mut rx, store, _) = registry();
        let id = NodeId::new("n1");

        registry
            .register_node(&id, "http://n1", &[report("p1", 100, 10)])
            .await
            .unwrap();
        let node = registry
            .register_node(&id, "http://n1", &[report("p1", 100, 20)])
            .await
            .unwrap();

        assert!(node.is_online());
        assert!(node.pools.contains(&PoolId::new("p1")));
        assert_eq!(registry.list_nodes().len(), 1);
        assert_eq!(store.snapshot().pool(&PoolId::new("p1")).unwrap().used, 20);

        // only the first registration is a transition
        assert_matches!(rx.try_recv(), Ok(NodeStateChange { new: NodeState::Online, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_node_is_not_found() {
        let (registry, _, _, _) = registry();
        let result = registry
            .heartbeat(&NodeId::new("ghost"), Utc::now(), None)
            .await;
        assert_matches!(result, Err(Error::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_take_node_offline_and_back() {
        let (registry, mut rx, _, events) = registry();
        let id = NodeId::new("n1");
        registry.register_node(&id, "http://n1", &[]).await.unwrap();
        rx.try_recv().unwrap();

        let start = Instant::now();
        assert!(registry
            .evaluate_liveness_at(start + Duration::from_millis(2500))
            .await
            .is_empty());
        assert!(registry.is_online(&id));

        let changes = registry
            .evaluate_liveness_at(start + Duration::from_secs(3))
            .await;
        assert_eq!(changes.len(), 1);
        assert_eq!(registry.get_node(&id).unwrap().state, NodeState::Offline);
        assert_matches!(rx.try_recv(), Ok(NodeStateChange { new: NodeState::Offline, .. }));

        registry.heartbeat(&id, Utc::now(), None).await.unwrap();
        assert!(registry.is_online(&id));
        assert_matches!(
            rx.try_recv(),
            Ok(NodeStateChange { old: NodeState::Offline, new: NodeState::Online, .. })
        );
        assert_eq!(events.events_of_type("NodeStateChanged").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_node_starts_unknown() {
        let (registry, mut rx, store, _) = registry();
        let mut txn = crate::store::Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p1"), NodeId::new("n9"), 100));
        store.commit(txn).unwrap();

        assert_eq!(registry.seed_from_store(), 1);
        let node = registry.get_node(&NodeId::new("n9")).unwrap();
        assert_eq!(node.state, NodeState::Unknown);
        assert!(!registry.is_online(&NodeId::new("n9")));

        let changes = registry
            .evaluate_liveness_at(Instant::now() + Duration::from_secs(3))
            .await;
        assert_eq!(changes[0].old, NodeState::Unknown);
        assert_matches!(rx.try_recv(), Ok(NodeStateChange { new: NodeState::Offline, .. }));
    }

    #[tokio::test]
    async fn test_seeded_node_must_register_before_heartbeats() {
        let (registry, _, store, _) = registry();
        let mut txn = crate::store::Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p1"), NodeId::new("n9"), 100));
        store.commit(txn).unwrap();
        registry.seed_from_store();

        let id = NodeId::new("n9");
        assert_matches!(
            registry.heartbeat(&id, Utc::now(), None).await,
            Err(Error::NotFound { .. })
        );
        assert_eq!(registry.get_node(&id).unwrap().state, NodeState::Unknown);

        registry.register_node(&id, "http://n9", &[]).await.unwrap();
        let node = registry.heartbeat(&id, Utc::now(), None).await.unwrap();
        assert!(node.is_online());
        assert_eq!(node.endpoint, "http://n9");
    }

    #[tokio::test]
    async fn test_deregister_referenced_node_fails() {
        let (registry, _, _, _) = registry();
        let id = NodeId::new("n1");
        registry
            .register_node(&id, "http://n1", &[report("p1", 100, 0)])
            .await
            .unwrap();

        assert_matches!(
            registry.deregister_node(&id),
            Err(Error::FailedPrecondition(_))
        );

        registry
            .register_node(&NodeId::new("n2"), "http://n2", &[])
            .await
            .unwrap();
        registry.deregister_node(&NodeId::new("n2")).unwrap();
        assert_matches!(
            registry.get_node(&NodeId::new("n2")),
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_register_event_with_wrong_protocol_is_rejected() {
        let (registry, _, _, _) = registry();
        let event = NodeEvent::Register {
            node: NodeId::new("n1"),
            endpoint: "http://n1".into(),
            pools: vec![],
            version: 99,
        };
        assert_matches!(registry.handle_event(&event).await, Err(Error::Protocol(_)));
        assert!(registry.list_nodes().is_empty());
    }
}
