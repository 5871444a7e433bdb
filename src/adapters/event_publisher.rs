//! Event Publisher Adapters
//!
//! `EventPublisher` implementations: an audit trail written through `tracing`
//! for production and an in-memory recorder for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::model::VolumeState;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

// =============================================================================
// Audit Log
// =============================================================================

/// How loudly an event is written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    /// Data is at risk: a replica faulted, a rebuild failed or a volume lost
    /// every healthy child.
    Alarm,
    /// Fleet and volume lifecycle.
    Routine,
}

impl Severity {
    fn of(event: &DomainEvent) -> Self {
        let faulted = VolumeState::Faulted.to_string();
        match event {
            DomainEvent::ReplicaFaulted { .. } | DomainEvent::RebuildFailed { .. } => {
                Severity::Alarm
            }
            DomainEvent::VolumeStateChanged { new_state, .. } if *new_state == faulted => {
                Severity::Alarm
            }
            _ => Severity::Routine,
        }
    }
}

/// Writes domain events to the log with the volume and node they concern as
/// structured fields.
///
/// Alarms are always logged at warn. Routine events go out at info, or at
/// debug for a publisher built with [`LoggingEventPublisher::quiet`].
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    routine_at_info: bool,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self {
            routine_at_info: true,
        }
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self {
            routine_at_info: false,
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let kind = event.event_type();
        let volume = event.volume_id().unwrap_or("-");
        let node = event.node_id().unwrap_or("-");
        let detail = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        match (Severity::of(&event), self.routine_at_info) {
            (Severity::Alarm, _) => warn!(kind, volume, node, %detail, "Volume alarm"),
            (Severity::Routine, true) => info!(kind, volume, node, %detail, "Control plane event"),
            (Severity::Routine, false) => {
                debug!(kind, volume, node, %detail, "Control plane event")
            }
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Records every published event, oldest first, for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    log: Mutex<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.log.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Number of recorded events of one kind, e.g. `"RebuildCompleted"`.
    pub fn count(&self, kind: &str) -> usize {
        self.matching(|e| e.event_type() == kind).len()
    }

    pub fn events_of_type(&self, kind: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.event_type() == kind)
    }

    pub fn events_for_volume(&self, volume_id: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.volume_id() == Some(volume_id))
    }

    pub fn events_for_node(&self, node_id: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.node_id() == Some(node_id))
    }

    fn matching(&self, keep: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.log.lock().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.log.lock().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.log.lock().extend(events);
        Ok(())
    }
}
