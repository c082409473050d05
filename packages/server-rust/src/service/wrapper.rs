//! Operation wrapper: the single boundary between transports and the
//! operation pipeline.
//!
//! Builds the `RequestContext` from transport metadata, runs the pipeline
//! inside a carrier scope, classifies any failure exactly once, and emits one
//! `Call` telemetry record per call. Every outcome, including a panicking
//! handler, becomes a `ResponseEnvelope`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use keel_core::{ClockSource, Classifier, ObservabilitySink, RequestContext, TelemetryEvent};
use serde_json::Value;
use tokio::task::JoinSet;
use tower::{Service, ServiceExt};
use uuid::Uuid;

use super::carrier;
use super::config::ServerConfig;
use super::middleware::OperationPipeline;
use super::operation::{Operation, OperationRequest, ResponseEnvelope, TransportMetadata};

/// Transport-facing entry point for every operation.
#[derive(Clone)]
pub struct OperationWrapper<S = OperationPipeline> {
    pipeline: S,
    classifier: Arc<Classifier>,
    telemetry: Arc<dyn ObservabilitySink>,
    clock: Arc<dyn ClockSource>,
    default_timeout: Duration,
}

impl<S> OperationWrapper<S>
where
    S: Service<Operation, Response = Value, Error = anyhow::Error> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    #[must_use]
    pub fn new(
        pipeline: S,
        classifier: Arc<Classifier>,
        telemetry: Arc<dyn ObservabilitySink>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            pipeline,
            classifier,
            telemetry,
            clock,
            default_timeout: Duration::from_millis(
                ServerConfig::default().default_operation_timeout_ms,
            ),
        }
    }

    /// Deadline budget for calls whose metadata carries no timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builds the context for an inbound call.
    ///
    /// A missing or empty request id is replaced by a fresh UUID; the trace id
    /// defaults to the request id; the deadline is `timeout_ms` (or the
    /// default) from now.
    #[must_use]
    pub fn context_for(&self, metadata: &TransportMetadata) -> RequestContext {
        let request_id = metadata
            .request_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = metadata
            .timeout_ms
            .map_or(self.default_timeout, Duration::from_millis);

        let mut ctx = RequestContext::new(request_id, self.clock.now())
            .with_identity(metadata.identity.clone())
            .with_timeout(timeout);
        if let Some(trace_id) = metadata.trace_id.as_deref().filter(|t| !t.is_empty()) {
            ctx = ctx.with_trace_id(trace_id);
        }
        ctx
    }

    /// Runs one operation to a response envelope.
    pub async fn handle(&self, request: OperationRequest) -> ResponseEnvelope {
        let started = Instant::now();
        let OperationRequest {
            operation,
            input,
            metadata,
        } = request;
        let ctx = Arc::new(self.context_for(&metadata));
        let op = Operation {
            ctx: Arc::clone(&ctx),
            name: operation.clone(),
            input,
        };

        // The operation runs in its own task so a panicking handler surfaces
        // as a join error; dropping the set aborts it if the caller goes away.
        // Units of work it started run on their own tasks and still finish.
        let pipeline = self.pipeline.clone();
        let mut tasks = JoinSet::new();
        tasks.spawn(carrier::with_context(Arc::clone(&ctx), async move {
            let result = pipeline.oneshot(op).await;
            (result, carrier::retry_count())
        }));
        let (result, retries) = match tasks.join_next().await {
            Some(Ok(outcome)) => outcome,
            Some(Err(join_err)) => (Err(anyhow!("operation task failed: {join_err}")), 0),
            None => (Err(anyhow!("operation task was not scheduled")), 0),
        };

        self.respond(&ctx, &operation, result, retries, started)
    }

    /// Produces the envelope for a call the transport refused before it
    /// reached the pipeline (unparseable body, server draining, ...).
    ///
    /// Classified and recorded exactly like a pipeline failure.
    pub fn reject(
        &self,
        operation: &str,
        metadata: &TransportMetadata,
        err: anyhow::Error,
    ) -> ResponseEnvelope {
        let ctx = self.context_for(metadata);
        self.respond(&ctx, operation, Err(err), 0, Instant::now())
    }

    fn respond(
        &self,
        ctx: &RequestContext,
        operation: &str,
        result: anyhow::Result<Value>,
        retries: u32,
        started: Instant,
    ) -> ResponseEnvelope {
        let (envelope, error, detail) = match result {
            Ok(data) => (ResponseEnvelope::success(ctx.request_id(), data), None, None),
            Err(err) => {
                let classified = self.classifier.classify(&err);
                (
                    ResponseEnvelope::failure(ctx.request_id(), &classified),
                    Some(classified.kind),
                    Some(classified.detail),
                )
            }
        };
        self.telemetry.record(TelemetryEvent::Call {
            request_id: ctx.request_id().to_string(),
            operation: operation.to_string(),
            status: envelope.status,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            retries,
            error,
            detail,
        });
        envelope
    }
}

impl<S> std::fmt::Debug for OperationWrapper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationWrapper")
            .field("classifier", &self.classifier)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl<S> Service<OperationRequest> for OperationWrapper<S>
where
    S: Service<Operation, Response = Value, Error = anyhow::Error> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = ResponseEnvelope;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<ResponseEnvelope, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OperationRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(request).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keel_core::{
        DomainError, ErrorKind, ManualClock, MemorySink, Principal, INTERNAL_PUBLIC_MESSAGE,
    };
    use serde_json::json;

    use super::*;
    use crate::service::classify::standard_classifier;
    use crate::service::middleware::build_operation_pipeline;
    use crate::service::router::{handler_fn, OperationRouter};

    fn wrapper() -> (OperationWrapper, Arc<MemorySink>) {
        let mut router = OperationRouter::new();
        router.register(
            "test.whoami",
            handler_fn(|_input: Value| async {
                let ctx = carrier::current();
                Ok(json!({
                    "actor": ctx.actor(),
                    "request_id": ctx.request_id(),
                    "trace_id": ctx.trace_id(),
                }))
            }),
        );
        router.register(
            "test.conflict",
            handler_fn(|_input: Value| async {
                Err(DomainError::conflict("version mismatch").into())
            }),
        );
        router.register(
            "test.internal",
            handler_fn(|_input: Value| async {
                Err(anyhow!("db password is hunter2"))
            }),
        );
        router.register(
            "test.panic",
            handler_fn(|_input: Value| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
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
        let pipeline = build_operation_pipeline(router, &ServerConfig::default());
        let wrapper = OperationWrapper::new(
            pipeline,
            Arc::new(standard_classifier()),
            sink.clone(),
            Arc::new(ManualClock::new(42)),
        );
        (wrapper, sink)
    }

    fn metadata(request_id: &str) -> TransportMetadata {
        TransportMetadata {
            identity: Some(Principal::new("alice")),
            request_id: Some(request_id.to_string()),
            ..TransportMetadata::default()
        }
    }

    #[tokio::test]
    async fn success_carries_data_and_request_id() {
        let (wrapper, sink) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.whoami", Value::Null).with_metadata(metadata("req-7")))
            .await;

        assert_eq!(env.status, 200);
        assert_eq!(env.request_id, "req-7");
        assert!(env.body.success);
        assert_eq!(
            env.body.data,
            Some(json!({"actor": "alice", "request_id": "req-7", "trace_id": "req-7"}))
        );
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_request_id_is_generated() {
        let (wrapper, _) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.whoami", Value::Null))
            .await;
        assert!(Uuid::parse_str(&env.request_id).is_ok());
        let data = env.body.data.unwrap();
        assert_eq!(data["request_id"], env.request_id.as_str());
        assert!(data["actor"].is_null());
    }

    #[tokio::test]
    async fn trace_id_is_taken_from_metadata() {
        let (wrapper, _) = wrapper();
        let meta = TransportMetadata {
            trace_id: Some("trace-9".to_string()),
            ..metadata("req-8")
        };
        let env = wrapper
            .handle(OperationRequest::new("test.whoami", Value::Null).with_metadata(meta))
            .await;
        assert_eq!(env.body.data.unwrap()["trace_id"], "trace-9");
    }

    #[tokio::test]
    async fn domain_failure_maps_to_its_status() {
        let (wrapper, sink) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.conflict", Value::Null))
            .await;
        assert_eq!(env.status, 409);
        let error = env.body.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Conflict);
        assert_eq!(error.message, "version mismatch");
        match &sink.calls()[0] {
            TelemetryEvent::Call { status, error, .. } => {
                assert_eq!(*status, 409);
                assert_eq!(*error, Some(ErrorKind::Conflict));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn internal_detail_never_reaches_the_caller() {
        let (wrapper, sink) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.internal", Value::Null))
            .await;
        assert_eq!(env.status, 500);
        let body = serde_json::to_string(&env).unwrap();
        assert!(!body.contains("hunter2"));
        assert_eq!(env.body.error.unwrap().message, INTERNAL_PUBLIC_MESSAGE);

        match &sink.calls()[0] {
            TelemetryEvent::Call { detail, .. } => {
                assert!(detail.as_deref().unwrap_or_default().contains("hunter2"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal() {
        let (wrapper, sink) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.panic", Value::Null))
            .await;
        assert_eq!(env.status, 500);
        assert_eq!(env.body.error.unwrap().kind, ErrorKind::Internal);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let (wrapper, _) = wrapper();
        let env = wrapper
            .handle(OperationRequest::new("test.missing", Value::Null))
            .await;
        assert_eq!(env.status, 404);
        assert_eq!(env.body.error.unwrap().message, "unknown operation: test.missing");
    }

    #[tokio::test]
    async fn metadata_timeout_bounds_the_operation() {
        let (wrapper, _) = wrapper();
        let meta = TransportMetadata {
            timeout_ms: Some(30),
            ..metadata("req-slow")
        };
        let started = Instant::now();
        let env = wrapper
            .handle(OperationRequest::new("test.slow", Value::Null).with_metadata(meta))
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(env.status, 500);
        assert_eq!(env.body.error.unwrap().message, INTERNAL_PUBLIC_MESSAGE);
    }

    #[tokio::test]
    async fn reject_classifies_and_records() {
        let (wrapper, sink) = wrapper();
        let env = wrapper.reject(
            "test.whoami",
            &metadata("req-bad"),
            DomainError::validation("body is not valid JSON").into(),
        );
        assert_eq!(env.status, 400);
        assert_eq!(env.request_id, "req-bad");
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn works_as_a_tower_service() {
        let (wrapper, _) = wrapper();
        let env = wrapper
            .oneshot(OperationRequest::new("test.whoami", Value::Null))
            .await
            .unwrap();
        assert_eq!(env.status, 200);
    }

    #[test]
    fn context_uses_clock_and_default_timeout() {
        let (wrapper, _) = wrapper();
        let wrapper = wrapper.with_default_timeout(Duration::from_secs(3));
        let ctx = wrapper.context_for(&TransportMetadata::default());
        assert_eq!(ctx.started_at_ms(), 42);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(3));
        assert!(remaining > Duration::from_secs(2));
    }
}
