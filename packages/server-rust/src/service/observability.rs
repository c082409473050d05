//! Observability sinks backed by the `metrics` facade, plus fan-out.

use std::sync::Arc;

use keel_core::{ErrorKind, ObservabilitySink, TelemetryEvent};

/// Records telemetry as `metrics` counters and histograms.
///
/// Nothing is exported unless a recorder (e.g. the Prometheus exporter) is
/// installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl ObservabilitySink for MetricsSink {
    #[allow(clippy::cast_precision_loss)]
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Attempt {
                dependency,
                latency_ms,
                error,
                ..
            } => {
                let outcome = error.map_or("ok", ErrorKind::as_str);
                metrics::counter!(
                    "keel_dependency_attempts_total",
                    "dependency" => dependency.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!("keel_dependency_latency_seconds", "dependency" => dependency)
                    .record(latency_ms as f64 / 1_000.0);
            }
            TelemetryEvent::Retry {
                dependency, cause, ..
            } => {
                metrics::counter!(
                    "keel_dependency_retries_total",
                    "dependency" => dependency,
                    "cause" => cause.as_str()
                )
                .increment(1);
            }
            TelemetryEvent::Call {
                operation,
                status,
                error,
                ..
            } => {
                metrics::counter!(
                    "keel_calls_total",
                    "operation" => operation,
                    "status" => status.to_string(),
                    "kind" => error.map_or("none", ErrorKind::as_str)
                )
                .increment(1);
            }
            TelemetryEvent::BreakerTransition { dependency, to, .. } => {
                metrics::counter!(
                    "keel_breaker_transitions_total",
                    "dependency" => dependency,
                    "to" => to.as_str()
                )
                .increment(1);
            }
        }
    }
}

/// Forwards every event to each wrapped sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ObservabilitySink for FanoutSink {
    fn record(&self, event: TelemetryEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
