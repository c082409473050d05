//! Telemetry events emitted by the executor, the breaker, and the operation wrapper.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::policy::CircuitState;
use crate::traits::ObservabilitySink;

/// A single telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// One attempt of a dependency call finished.
    Attempt {
        request_id: String,
        dependency: String,
        attempt: u32,
        latency_ms: u64,
        /// `None` when the attempt succeeded.
        error: Option<ErrorKind>,
    },
    /// An attempt beyond the first is about to start.
    Retry {
        request_id: String,
        dependency: String,
        attempt: u32,
        delay_ms: u64,
        cause: ErrorKind,
    },
    /// An inbound operation produced its response envelope.
    Call {
        request_id: String,
        operation: String,
        status: u16,
        latency_ms: u64,
        retries: u32,
        error: Option<ErrorKind>,
        /// Full failure detail; never part of the response.
        detail: Option<String>,
    },
    /// A circuit breaker changed state.
    BreakerTransition {
        dependency: String,
        from: CircuitState,
        to: CircuitState,
    },
}

/// Writes telemetry as structured `tracing` events on the `keel::telemetry` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Attempt {
                request_id,
                dependency,
                attempt,
                latency_ms,
                error,
            } => tracing::debug!(
                target: "keel::telemetry",
                %request_id,
                %dependency,
                attempt,
                latency_ms,
                error = error.map(ErrorKind::as_str),
                "attempt finished"
            ),
            TelemetryEvent::Retry {
                request_id,
                dependency,
                attempt,
                delay_ms,
                cause,
            } => tracing::info!(
                target: "keel::telemetry",
                %request_id,
                %dependency,
                attempt,
                delay_ms,
                cause = cause.as_str(),
                "retrying dependency call"
            ),
            TelemetryEvent::Call {
                request_id,
                operation,
                status,
                latency_ms,
                retries,
                error,
                detail,
            } => {
                if error == Some(ErrorKind::Internal) {
                    tracing::error!(
                        target: "keel::telemetry",
                        %request_id,
                        %operation,
                        status,
                        latency_ms,
                        retries,
                        detail = detail.as_deref().unwrap_or(""),
                        "operation failed"
                    );
                } else {
                    tracing::info!(
                        target: "keel::telemetry",
                        %request_id,
                        %operation,
                        status,
                        latency_ms,
                        retries,
                        error = error.map(ErrorKind::as_str),
                        "operation complete"
                    );
                }
            }
            TelemetryEvent::BreakerTransition {
                dependency,
                from,
                to,
            } => tracing::warn!(
                target: "keel::telemetry",
                %dependency,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker transition"
            ),
        }
    }
}

/// Collects telemetry in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Number of `Retry` events recorded.
    #[must_use]
    pub fn retry_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::Retry { .. }))
            .count()
    }

    /// All `Call` events recorded.
    #[must_use]
    pub fn calls(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::Call { .. }))
            .cloned()
            .collect()
    }
}

impl ObservabilitySink for MemorySink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
