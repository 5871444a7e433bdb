//! CoucheStor CSI Controller
//!
//! Control plane for replicated NVMe-oF block volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   CoucheStor Control Plane                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  CSI Server  │───▶│  Scheduler   │───▶│ Message Bus  │──▶ agents
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ REST/metrics │───▶│Node Registry │───▶│  Reconciler  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::Client;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchestor_cp::adapters::loopback::{run_simulated_fleet, SIMULATED_DISK_CAPACITY};
use couchestor_cp::adapters::{
    ConfigMapBackend, HttpTransport, HttpTransportConfig, JsonFileBackend, LoggingEventPublisher,
    LoopbackTransport, MemoryBackend, SimulatedNode,
};
use couchestor_cp::bus::BusConfig;
use couchestor_cp::controller::{ControlPlane, ControlPlaneConfig, ReconcilerConfig};
use couchestor_cp::domain::ports::{EventPublisher, NodeTransport, StateBackend};
use couchestor_cp::error::{Error, Result};
use couchestor_cp::registry::RegistryConfig;
use couchestor_cp::scheduler::SchedulerConfig;
use couchestor_cp::{csi, rest};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StateBackendKind {
    /// In-process only; state is lost on restart
    Memory,
    /// JSON file on local disk
    File,
    /// Kubernetes ConfigMap
    Configmap,
}

/// CoucheStor CSI Controller - replicated block volume control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI endpoint (unix socket)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/lib/csi/sockets/pluginproxy/csi.sock")]
    csi_address: String,

    /// Namespace holding the state ConfigMap
    #[arg(long, env = "POD_NAMESPACE", default_value = "couchestor")]
    namespace: String,

    /// REST, health and metrics bind address
    #[arg(long, env = "REST_ADDR", default_value = "0.0.0.0:8080")]
    rest_addr: String,

    /// Node agent transport: a URL scheme (http, https) or `loopback`
    #[arg(long, env = "BUS_ENDPOINT", default_value = "http")]
    bus_endpoint: String,

    /// Where volume state is persisted
    #[arg(long, env = "STATE_BACKEND", value_enum, default_value = "configmap")]
    state_backend: StateBackendKind,

    /// State file for the `file` backend
    #[arg(long, env = "STATE_FILE", default_value = "/var/lib/couchestor/state.json")]
    state_file: String,

    /// ConfigMap name for the `configmap` backend
    #[arg(long, env = "STATE_CONFIGMAP", default_value = "couchestor-control-plane-state")]
    state_configmap: String,

    /// Deadline for a single node agent request
    #[arg(long, env = "NODE_RPC_TIMEOUT_SECONDS", default_value = "30")]
    node_rpc_timeout_seconds: u64,

    /// Expected node heartbeat interval
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value = "5")]
    heartbeat_interval_seconds: u64,

    /// Missed heartbeats before a node is marked Offline
    #[arg(long, env = "MISSED_HEARTBEATS", default_value = "3")]
    missed_heartbeats: u32,

    /// Reconciliation tick period
    #[arg(long, env = "RECONCILE_INTERVAL_SECONDS", default_value = "10")]
    reconcile_interval_seconds: u64,

    /// Placement rounds before CreateVolume gives up
    #[arg(long, env = "MAX_PLACEMENT_ATTEMPTS", default_value = "3")]
    max_placement_attempts: usize,

    /// Replica count for volumes whose StorageClass sets none
    #[arg(long, env = "DEFAULT_REPLICAS", default_value = "1")]
    default_replicas: usize,

    /// Simulated node agents started with the `loopback` transport
    #[arg(long, env = "SIMULATED_NODES", default_value = "3")]
    simulated_nodes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn control_plane_config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            bus: BusConfig {
                request_timeout: Duration::from_secs(self.node_rpc_timeout_seconds),
                ..Default::default()
            },
            registry: RegistryConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
                missed_heartbeats: self.missed_heartbeats,
            },
            scheduler: SchedulerConfig {
                max_placement_attempts: self.max_placement_attempts,
            },
            reconciler: ReconcilerConfig {
                reconcile_interval: Duration::from_secs(self.reconcile_interval_seconds),
                ..Default::default()
            },
            default_replicas: self.default_replicas,
        }
    }

    fn is_loopback(&self) -> bool {
        self.bus_endpoint == "loopback"
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting CoucheStor control plane");
    info!("  CSI endpoint: {}", args.csi_address);
    info!("  REST address: {}", args.rest_addr);
    info!("  Node transport: {}", args.bus_endpoint);
    info!("  State backend: {:?}", args.state_backend);
    info!("  Default replicas: {}", args.default_replicas);

    if args.default_replicas == 0 {
        return Err(Error::InvalidArgument(
            "--default-replicas must be at least 1".into(),
        ));
    }

    let backend = build_backend(&args).await?;
    let (transport, fleet) = build_transport(&args)?;
    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher::new());

    let control_plane =
        ControlPlane::load(args.control_plane_config(), transport, backend, events).await?;
    let mut tasks = control_plane.start()?;

    // Servers stop before the control plane drains
    let servers_token = CancellationToken::new();
    let mut servers: JoinSet<Result<()>> = JoinSet::new();

    let rest_addr = args.rest_addr.clone();
    let cp = control_plane.clone();
    let token = servers_token.clone();
    servers.spawn(async move { rest::serve(&rest_addr, cp, token).await });

    let csi_address = args.csi_address.clone();
    let cp = control_plane.clone();
    let token = servers_token.clone();
    servers.spawn(async move { csi::serve(&csi_address, cp, token).await });

    if let Some(fleet) = fleet {
        let bus = control_plane.bus().clone();
        let interval = Duration::from_secs(args.heartbeat_interval_seconds.max(1));
        let token = servers_token.clone();
        servers.spawn(async move {
            run_simulated_fleet(fleet, bus, interval, token).await;
            Ok(())
        });
    }

    let mut result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
        Some(joined) = servers.join_next() => {
            error!("Server exited unexpectedly");
            flatten(joined).and(Err(Error::Internal("server exited".into())))
        }
        Some(joined) = tasks.join_next() => {
            error!("Control plane task exited unexpectedly");
            flatten(joined).and(Err(Error::Internal("background task exited".into())))
        }
    };

    servers_token.cancel();
    while let Some(joined) = servers.join_next().await {
        if let Err(e) = flatten(joined) {
            warn!(error = %e, "Server failed during shutdown");
        }
    }

    if let Err(e) = control_plane.shutdown(tasks).await {
        result = result.and(Err(e));
    }

    match &result {
        Ok(()) => info!("Control plane shutdown complete"),
        Err(e) => error!(error = %e, "Control plane exited with error"),
    }
    result
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Internal(format!("task panicked: {}", e)))?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// =============================================================================
// Component Selection
// =============================================================================

async fn build_backend(args: &Args) -> Result<Arc<dyn StateBackend>> {
    let backend: Arc<dyn StateBackend> = match args.state_backend {
        StateBackendKind::Memory => {
            warn!("Using in-memory state backend; volume state will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
        StateBackendKind::File => Arc::new(JsonFileBackend::new(&args.state_file)),
        StateBackendKind::Configmap => {
            let client = Client::try_default().await.map_err(|e| {
                error!("Failed to create Kubernetes client: {}", e);
                Error::Internal(format!("Kubernetes client creation failed: {}", e))
            })?;
            info!("Connected to Kubernetes cluster");
            Arc::new(ConfigMapBackend::new(
                client,
                &args.namespace,
                &args.state_configmap,
            ))
        }
    };
    Ok(backend)
}

fn build_transport(
    args: &Args,
) -> Result<(Arc<dyn NodeTransport>, Option<Arc<LoopbackTransport>>)> {
    if args.is_loopback() {
        let fleet = Arc::new(LoopbackTransport::new());
        for i in 1..=args.simulated_nodes {
            let node = SimulatedNode::new(format!("sim-node-{}", i))
                .with_pool(format!("sim-pool-{}", i), SIMULATED_DISK_CAPACITY);
            fleet.add_node(Arc::new(node));
        }
        info!(nodes = args.simulated_nodes, "Using loopback transport with simulated nodes");
        let transport: Arc<dyn NodeTransport> = fleet.clone();
        return Ok((transport, Some(fleet)));
    }

    let transport: Arc<dyn NodeTransport> = Arc::new(HttpTransport::new(HttpTransportConfig {
        default_scheme: args.bus_endpoint.clone(),
        ..Default::default()
    })?);
    Ok((transport, None))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
