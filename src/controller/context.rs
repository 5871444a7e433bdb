//! Control Plane Context
//!
//! Wires the store, message bus, node registry, scheduler and reconciler
//! together and owns their background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::reconciler::{Reconciler, ReconcilerConfig};
use crate::bus::{BusConfig, MessageBus, NodeEvent};
use crate::domain::ports::{EventPublisher, NodeTransport, StateBackend};
use crate::error::{Error, Result};
use crate::registry::{NodeRegistry, NodeStateChange, RegistryConfig};
use crate::scheduler::{Scheduler, SchedulerConfig, VolumeLocks};
use crate::store::{run_persister, VolumeStore};

/// Configuration for the whole control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub bus: BusConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    /// Replica count for CSI volumes that do not ask for one
    pub default_replicas: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            default_replicas: 1,
        }
    }
}

/// The assembled control plane.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    store: Arc<VolumeStore>,
    bus: Arc<MessageBus>,
    registry: Arc<NodeRegistry>,
    locks: Arc<VolumeLocks>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    backend: Arc<dyn StateBackend>,
    node_changes: Mutex<Option<mpsc::UnboundedReceiver<NodeStateChange>>>,
    shutdown: CancellationToken,
    ready: AtomicBool,
}

impl ControlPlane {
    /// Restore state from `backend` and assemble the components.
    ///
    /// Nodes referenced by stored pools are seeded in Unknown state until
    /// they re-register.
    pub async fn load(
        config: ControlPlaneConfig,
        transport: Arc<dyn NodeTransport>,
        backend: Arc<dyn StateBackend>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(VolumeStore::load(backend.as_ref()).await?);
        let bus = Arc::new(MessageBus::new(config.bus.clone(), transport));
        let (registry, node_changes) =
            NodeRegistry::new(config.registry.clone(), store.clone(), events.clone());
        let registry = Arc::new(registry);
        let seeded = registry.seed_from_store();

        let locks = Arc::new(VolumeLocks::new());
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            store.clone(),
            registry.clone(),
            bus.clone(),
            locks.clone(),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            config.reconciler.clone(),
            scheduler.clone(),
            events,
        ));

        let snapshot = store.snapshot();
        info!(
            backend = backend.name(),
            revision = snapshot.revision(),
            volumes = snapshot.volumes().count(),
            seeded_nodes = seeded,
            "Control plane loaded"
        );

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            registry,
            locks,
            scheduler,
            reconciler,
            backend,
            node_changes: Mutex::new(Some(node_changes)),
            shutdown: CancellationToken::new(),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    /// Token cancelled when the control plane shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ready once started and until shutdown begins.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Apply a node agent event directly, bypassing the broadcast hub.
    ///
    /// A node's endpoint is dropped only once the registry has accepted its
    /// deregistration.
    pub async fn apply_node_event(&self, event: &NodeEvent) -> Result<()> {
        self.bus.observe(event);
        self.registry.handle_event(event).await?;
        if let NodeEvent::Deregister { node } = event {
            self.bus.forget_endpoint(node);
        }
        Ok(())
    }

    /// Spawn the registry, reconciler and persister.
    ///
    /// The returned set yields an error if the persister fails, which is
    /// fatal to the process.
    pub fn start(&self) -> Result<JoinSet<Result<()>>> {
        let changes = self
            .node_changes
            .lock()
            .take()
            .ok_or_else(|| Error::FailedPrecondition("control plane already started".into()))?;

        let mut tasks = JoinSet::new();

        let registry = self.registry.clone();
        let events = self.bus.subscribe();
        let token = self.shutdown.clone();
        tasks.spawn(async move {
            registry.run(events, token).await;
            Ok(())
        });

        let reconciler = self.reconciler.clone();
        let token = self.shutdown.clone();
        tasks.spawn(async move {
            reconciler.run(changes, token).await;
            Ok(())
        });

        tasks.spawn(run_persister(
            self.store.clone(),
            self.backend.clone(),
            self.shutdown.clone(),
        ));

        self.ready.store(true, Ordering::SeqCst);
        info!("Control plane started");
        Ok(tasks)
    }

    /// Refuse new work, wait for in-flight volume operations, then stop
    /// background tasks.
    pub async fn shutdown(&self, mut tasks: JoinSet<Result<()>>) -> Result<()> {
        info!("Control plane shutting down");
        self.ready.store(false, Ordering::SeqCst);
        self.locks.drain().await;
        self.shutdown.cancel();

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Background task failed");
                    result = Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Background task panicked");
                    result = Err(Error::Internal(format!("background task panicked: {}", e)));
                }
            }
        }
        info!("Control plane stopped");
        result
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("ready", &self.is_ready())
            .finish()
    }
}
