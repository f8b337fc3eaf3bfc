//! Audit sinks for allocation events.

use std::sync::Mutex;

use crate::contracts::{AuditError, AuditEvent, AuditSink, LockResultExt};

/// Delivers an event, logging and swallowing any sink failure.
pub fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        tracing::warn!(
            event_type = event.event_type.as_str(),
            entity_id = event.entity_id,
            prefix = %event.prefix,
            error = %e,
            "audit sink rejected event"
        );
    }
}

/// Writes audit events to the `fiscseq::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&event.payload).map_err(|e| AuditError(e.to_string()))?;
        tracing::info!(
            target: "fiscseq::audit",
            id = %event.id,
            event_type = event.event_type.as_str(),
            entity_id = event.entity_id,
            prefix = %event.prefix,
            payload = %payload,
            "audit"
        );
        Ok(())
    }
}

/// Keeps audit events in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock().map_lock_err() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_lock_err()
            .map_err(|e| AuditError(e.to_string()))?
            .push(event.clone());
        Ok(())
    }
}
