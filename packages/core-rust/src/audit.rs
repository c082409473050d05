//! Audit records for units of work.
//!
//! - [`AuditEvent`]: one record describing a committed or rolled-back unit
//! - [`MemoryAuditSink`]: in-memory trail, useful for tests and local runs
//! - [`TracingAuditSink`]: writes each event as a structured log line

use parking_lot::Mutex;
use serde::Serialize;

use crate::traits::AuditSink;

/// Final outcome of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Committed,
    RolledBack,
}

impl AuditOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Committed => "committed",
            AuditOutcome::RolledBack => "rolled_back",
        }
    }
}

/// Audit record written exactly once per unit of work, after its outcome is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// Principal id from the request context, if the caller was identified.
    pub actor: Option<String>,
    pub request_id: String,
    /// Milliseconds since Unix epoch at which the outcome became final.
    pub timestamp_ms: u64,
    pub operation_name: String,
    pub outcome: AuditOutcome,
    /// Name of the step whose failure triggered the rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

/// In-memory audit trail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, in recording order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Emits audit events on the `keel::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: "keel::audit",
            actor = event.actor.as_deref().unwrap_or("-"),
            request_id = %event.request_id,
            timestamp_ms = event.timestamp_ms,
            operation = %event.operation_name,
            outcome = event.outcome.as_str(),
            failed_step = event.failed_step.as_deref(),
            "unit of work finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: AuditOutcome) -> AuditEvent {
        AuditEvent {
            actor: Some("alice".to_string()),
            request_id: "req-1".to_string(),
            timestamp_ms: 1_700_000_000_000,
            operation_name: "ledger.transfer".to_string(),
            outcome,
            failed_step: None,
        }
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        assert!(sink.is_empty());
        sink.record(&event(AuditOutcome::Committed)).unwrap();
        sink.record(&event(AuditOutcome::RolledBack)).unwrap();

        let outcomes: Vec<_> = sink.events().iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![AuditOutcome::Committed, AuditOutcome::RolledBack]);
    }

    #[test]
    fn event_json_shape() {
        let json = serde_json::to_value(event(AuditOutcome::RolledBack)).unwrap();
        assert_eq!(json["outcome"], "rolled_back");
        assert_eq!(json["actor"], "alice");
        assert!(json.get("failed_step").is_none());
    }

    #[test]
    fn tracing_sink_never_fails() {
        assert!(TracingAuditSink.record(&event(AuditOutcome::Committed)).is_ok());
    }
}
