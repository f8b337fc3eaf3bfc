use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::codec::Prefix;
use crate::contracts::error::AuditError;
use crate::contracts::EntityId;

/// Compliance log for allocation events.
///
/// Delivery is fire-and-forget from the allocator's point of view: an error
/// returned here is logged and never fails the allocation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A number was reserved and committed.
    Reserved,
    /// A counter was created from document history.
    RecordSeeded,
    /// An administrator force-wrote a counter.
    SequenceOverridden,
    /// A counter was raised to match document history.
    DriftCorrected,
    /// A candidate number was found already present in history.
    CollisionDetected,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::RecordSeeded => "record_seeded",
            Self::SequenceOverridden => "sequence_overridden",
            Self::DriftCorrected => "drift_corrected",
            Self::CollisionDetected => "collision_detected",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub entity_id: EntityId,
    pub prefix: Prefix,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        entity_id: EntityId,
        prefix: Prefix,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity_id,
            prefix,
            payload,
            recorded_at: Utc::now(),
        }
    }
}
