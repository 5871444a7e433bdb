//! Message bus to node agents.
//!
//! - [`protocol`] - versioned command, reply and event schema
//! - [`client`] - request/reply with timeouts plus the event hub
//! - `agent` - typed node agent calls
//! - [`retry`] - bounded backoff for transient failures

mod agent;
pub mod client;
pub mod protocol;
pub mod retry;

pub use client::{BusConfig, MessageBus};
pub use protocol::{Command, Envelope, NodeEvent, PoolReport, RebuildState, Reply, ReplyEnvelope};
pub use retry::RetryPolicy;
