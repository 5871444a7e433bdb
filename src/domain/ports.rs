//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! Abstractions the control plane core depends on. Infrastructure adapters
//! implement these traits to provide concrete transports and persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  NodeTransport │ StateBackend │ EventPublisher      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  HttpTransport │ Loopback │ File/ConfigMap backend  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use super::model::{Nexus, Pool, Replica, Volume};
use crate::bus::protocol::{Envelope, ReplyEnvelope};
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Serialized form of the volume store written by a `StateBackend`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Store revision at the time the state was captured
    pub revision: u64,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub nexuses: Vec<Nexus>,
}

// =============================================================================
// Node Transport Port
// =============================================================================

/// Port for delivering commands to node agents.
///
/// Delivery is at-most-once. Implementations return `Error::Timeout` when
/// the agent cannot be reached; the caller owns retries.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Deliver `envelope` to the agent listening on `endpoint`.
    async fn send(&self, endpoint: &str, envelope: Envelope) -> Result<ReplyEnvelope>;
}

// =============================================================================
// State Backend Port
// =============================================================================

/// Port for durable storage of the volume store.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Load the last saved state, `None` on first start.
    async fn load(&self) -> Result<Option<PersistedState>>;

    /// Replace the saved state.
    async fn save(&self, state: &PersistedState) -> Result<()>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
