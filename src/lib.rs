//! CoucheStor Control Plane - CSI controller for replicated NVMe-oF block volumes
//!
//! Provisions replicated block volumes across a fleet of storage nodes and
//! keeps them healthy. Each volume is a set of replicas placed on distinct
//! nodes, aggregated by a nexus that is shared to the consuming node.
//!
//! # Architecture
//!
//! ```text
//! CSI Server ──▶ Scheduler ──▶ Message Bus ──▶ node agents
//!                    │  ▲                          │
//!                    ▼  │                          ▼ register / heartbeat
//!               Volume Store ◀── Reconciler ◀── Node Registry
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Transports, persistence backends and event publishers
//! - [`bus`] - Request/reply and event transport to node agents
//! - [`controller`] - Control plane assembly and the reconciliation loop
//! - [`csi`] - CSI v1 Identity and Controller gRPC services
//! - [`domain`] - Entities, domain events and ports
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus collectors
//! - [`registry`] - Node liveness and pool inventory
//! - [`rest`] - Health checks, metrics, inventory and node agent ingress over HTTP
//! - [`scheduler`] - Replica placement and volume lifecycle operations
//! - [`store`] - Versioned, transactional volume state

pub mod adapters;
pub mod bus;
pub mod controller;
pub mod csi;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use controller::{ControlPlane, ControlPlaneConfig};
pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use store::VolumeStore;
