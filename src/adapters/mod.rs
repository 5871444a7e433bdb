//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   NodeTransport  │  StateBackend  │  EventPublisher         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ HttpTransport │ LoopbackTransport │ JsonFileBackend        │ │
//! │  │ ConfigMapBackend │ MemoryBackend │ LoggingEventPublisher   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod event_publisher;
pub mod http_transport;
pub mod kubernetes;
pub mod loopback;
pub mod state_backend;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use http_transport::{HttpTransport, HttpTransportConfig};
pub use kubernetes::ConfigMapBackend;
pub use loopback::{LoopbackTransport, SimulatedNode};
pub use state_backend::{JsonFileBackend, MemoryBackend};
