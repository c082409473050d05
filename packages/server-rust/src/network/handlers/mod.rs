//! HTTP handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod health;
pub mod operation;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use operation::operation_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{DrainController, NetworkConfig};
use crate::service::OperationWrapper;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Entry point into the operation pipeline.
    pub wrapper: OperationWrapper,
    /// Serving phase and in-flight tracking.
    pub drain: Arc<DrainController>,
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use keel_core::{ManualClock, MemorySink};
    use serde_json::{json, Value};

    use super::AppState;
    use crate::network::{DrainController, NetworkConfig};
    use crate::service::{
        build_operation_pipeline, carrier, handler_fn, standard_classifier, OperationRouter,
        OperationWrapper, ServerConfig,
    };

    /// State with a `test.echo` operation that returns its input and caller.
    pub(crate) fn test_state() -> (AppState, Arc<MemorySink>) {
        let mut router = OperationRouter::new();
        router.register(
            "test.echo",
            handler_fn(|input: Value| async move {
                let ctx = carrier::current();
                Ok(json!({
                    "input": input,
                    "actor": ctx.actor(),
                    "trace_id": ctx.trace_id(),
                }))
            }),
        );
        router.register(
            "test.slow",
            handler_fn(|_input: Value| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }),
        );
        let sink = Arc::new(MemorySink::new());
        let wrapper = OperationWrapper::new(
            build_operation_pipeline(router, &ServerConfig::default()),
            Arc::new(standard_classifier()),
            sink.clone(),
            Arc::new(ManualClock::new(0)),
        );
        let state = AppState {
            wrapper,
            drain: Arc::new(DrainController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        };
        (state, sink)
    }
}
