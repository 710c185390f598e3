//! Violation sink port and bundled sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::event::{Severity, ViolationAction, ViolationEvent};
use crate::error::SinkError;

/// Destination for violation events (SIEM, audit table, log pipeline).
#[async_trait]
pub trait ViolationSink: Send + Sync {
    async fn notify(&self, event: &ViolationEvent) -> Result<(), SinkError>;
}

/// Writes events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ViolationSink for TracingSink {
    async fn notify(&self, event: &ViolationEvent) -> Result<(), SinkError> {
        match event.severity {
            Severity::Low => info!(
                target: "ratewarden::violation",
                event_id = %event.id,
                action = ?event.action,
                identifier = %event.identifier,
                endpoint = %event.endpoint,
                details = %event.details,
                "Rate limit violation"
            ),
            Severity::Medium => warn!(
                target: "ratewarden::violation",
                event_id = %event.id,
                action = ?event.action,
                identifier = %event.identifier,
                endpoint = %event.endpoint,
                details = %event.details,
                "Rate limit violation"
            ),
            Severity::High | Severity::Critical => error!(
                target: "ratewarden::violation",
                event_id = %event.id,
                action = ?event.action,
                severity = ?event.severity,
                identifier = %event.identifier,
                endpoint = %event.endpoint,
                details = %event.details,
                "Rate limit violation"
            ),
        }
        Ok(())
    }
}

/// Keeps every event in memory. Handy for tests and admin endpoints.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ViolationEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<ViolationEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given action.
    pub fn count(&self, action: ViolationAction) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl ViolationSink for RecordingSink {
    async fn notify(&self, event: &ViolationEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
