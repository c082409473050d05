//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::deadline::{DeadlineLayer, DeadlineService};
use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::service::config::ServerConfig;
use crate::service::router::OperationRouter;

/// The composed operation pipeline. Cheap to clone; clones share the
/// concurrency limit and the handler table.
pub type OperationPipeline = LoadShedService<DeadlineService<MetricsService<OperationRouter>>>;

/// Build the operation pipeline by wrapping the `OperationRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `DeadlineLayer` -- enforce the operation's context deadline
/// 3. `MetricsLayer` -- record timing and outcome (closest to the actual handler)
#[must_use]
pub fn build_operation_pipeline(router: OperationRouter, config: &ServerConfig) -> OperationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .layer(DeadlineLayer)
        .layer(MetricsLayer)
        .service(router)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keel_core::TimeoutError;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::test_support::make_op;
    use crate::service::router::handler_fn;

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let mut router = OperationRouter::new();
        router.register("test.slow", handler_fn(|_input: Value| async { Ok(json!("done")) }));

        let config = ServerConfig {
            max_concurrent_operations: 100,
            ..ServerConfig::default()
        };

        let svc = build_operation_pipeline(router, &config);
        let resp = svc.oneshot(make_op(Some(1_000))).await.unwrap();
        assert_eq!(resp, json!("done"));
    }

    #[tokio::test]
    async fn pipeline_enforces_the_deadline() {
        let mut router = OperationRouter::new();
        router.register(
            "test.slow",
            handler_fn(|_input: Value| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(Value::Null)
            }),
        );
        let svc = build_operation_pipeline(router, &ServerConfig::default());
        let err = svc.oneshot(make_op(Some(20))).await.unwrap_err();
        assert!(err.is::<TimeoutError>());
    }
}
