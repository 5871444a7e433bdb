//! Message Bus Client
//!
//! Request/reply to individual node agents plus a broadcast hub for the
//! registration and heartbeat events they publish.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::protocol::{Command, Envelope, NodeEvent, Reply};
use super::retry::RetryPolicy;
use crate::domain::model::NodeId;
use crate::domain::ports::NodeTransport;
use crate::error::{Error, Result};
use crate::metrics;

/// Configuration for the message bus client.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deadline for a single node agent request
    pub request_timeout: Duration,
    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
    /// Retry policy applied by `request_with_retry`
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            event_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Asynchronous transport to the node agent fleet.
pub struct MessageBus {
    config: BusConfig,
    transport: Arc<dyn NodeTransport>,
    /// Command endpoints learned from registrations
    endpoints: DashMap<NodeId, String>,
    events: broadcast::Sender<NodeEvent>,
}

impl MessageBus {
    pub fn new(config: BusConfig, transport: Arc<dyn NodeTransport>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            endpoints: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // =========================================================================
    // Publish / Subscribe
    // =========================================================================

    /// Subscribe to node agent events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Publish an event received from a node agent.
    ///
    /// Registration events also update the endpoint address book so commands
    /// can be routed to the node.
    pub fn publish(&self, event: NodeEvent) {
        self.observe(&event);
        if self.events.send(event).is_err() {
            debug!("Node event dropped, no subscribers");
        }
    }

    /// Learn a command endpoint from a registration without broadcasting it.
    ///
    /// Deregistration is not applied here: the endpoint stays until the
    /// registry has accepted the removal and [`MessageBus::forget_endpoint`]
    /// is called.
    pub fn observe(&self, event: &NodeEvent) {
        if let NodeEvent::Register { node, endpoint, .. } = event {
            self.endpoints.insert(node.clone(), endpoint.clone());
        }
    }

    pub fn set_endpoint(&self, node: NodeId, endpoint: impl Into<String>) {
        self.endpoints.insert(node, endpoint.into());
    }

    pub fn forget_endpoint(&self, node: &NodeId) {
        if self.endpoints.remove(node).is_some() {
            debug!(node = %node, "Forgot node endpoint");
        }
    }

    pub fn endpoint(&self, node: &NodeId) -> Option<String> {
        self.endpoints.get(node).map(|e| e.value().clone())
    }

    // =========================================================================
    // Request / Reply
    // =========================================================================

    /// Send a command with the configured default timeout.
    pub async fn request(&self, node: &NodeId, command: Command) -> Result<Reply> {
        self.request_with_timeout(node, command, self.config.request_timeout)
            .await
    }

    /// Send a command and wait at most `timeout` for the reply.
    ///
    /// A node without a known endpoint is treated as unreachable.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn request_with_timeout(
        &self,
        node: &NodeId,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply> {
        let name = command.name();
        let timeout_err = || Error::Timeout {
            node: node.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let Some(endpoint) = self.endpoint(node) else {
            metrics::record_node_rpc(name, "unreachable");
            return Err(timeout_err());
        };

        let envelope = Envelope::new(node.clone(), command);
        let result = match tokio::time::timeout(
            timeout,
            self.transport.send(&endpoint, envelope.clone()),
        )
        .await
        {
            Ok(Ok(reply)) => reply.into_result(&envelope),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timeout_err()),
        };

        match &result {
            Ok(_) => metrics::record_node_rpc(name, "ok"),
            Err(e) => {
                warn!(node = %node, command = name, error = %e, "Node request failed");
                metrics::record_node_rpc(name, e.label());
            }
        }
        result
    }

    /// Send a command, retrying transient failures per the configured policy.
    pub async fn request_with_retry(&self, node: &NodeId, command: Command) -> Result<Reply> {
        let policy = self.config.retry;
        policy
            .run(move || self.request(node, command.clone()))
            .await
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("known_endpoints", &self.endpoints.len())
            .finish()
    }
}
