//! Domain Layer
//!
//! This module contains the core domain types following Domain-Driven Design principles.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Model** (`model.rs`) - Nodes, pools, replicas, nexuses and volumes
//! - **Ports** (`ports.rs`) - Trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Domain events for audit and decoupling

pub mod events;
pub mod model;
pub mod ports;

// Re-export commonly used types
pub use events::DomainEvent;
pub use model::{
    Nexus, NexusId, NexusState, Node, NodeId, NodeState, Pool, PoolId, Publication, Replica,
    ReplicaId, ReplicaState, Volume, VolumeId, VolumeSpec, VolumeState,
};
pub use ports::{EventPublisher, NodeTransport, PersistedState, StateBackend};
