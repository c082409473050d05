use crate::audit::AuditEvent;
use crate::telemetry::TelemetryEvent;

/// Destination for audit records, one per completed unit of work.
///
/// Recording is best-effort: callers log a returned error and carry on, so an
/// unavailable audit backend never changes a business outcome.
pub trait AuditSink: Send + Sync {
    /// Persist or forward a single audit event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be accepted.
    fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Fire-and-forget receiver for per-attempt and per-call telemetry.
pub trait ObservabilitySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}
