//! Operation routing: dispatches an `Operation` to the handler registered
//! under its name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde_json::Value;
use tower::Service;

use super::operation::{Operation, OperationError, OperationFuture};

// ---------------------------------------------------------------------------
// OperationHandler
// ---------------------------------------------------------------------------

/// Business logic for one named operation.
///
/// Handlers receive only the input; the request context is available through
/// [`carrier::current`](super::carrier::current).
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, input: Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure into an [`OperationHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    HandlerFn(f)
}

/// See [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for HandlerFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, input: Value) -> anyhow::Result<Value> {
        (self.0)(input).await
    }
}

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Routes operations to handlers by name, e.g. `"ledger.transfer"`.
///
/// Cloning is cheap; clones share the handler table. Unregistered names fail
/// with `OperationError::UnknownOperation`.
#[derive(Clone, Default)]
pub struct OperationRouter {
    handlers: Arc<HashMap<String, Arc<dyn OperationHandler>>>,
}

impl OperationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl OperationHandler + 'static) {
        Arc::make_mut(&mut self.handlers).insert(name.into(), Arc::new(handler));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for OperationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRouter")
            .field("operations", &self.names())
            .finish()
    }
}

impl Service<Operation> for OperationRouter {
    type Response = Value;
    type Error = anyhow::Error;
    type Future = OperationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        match self.handlers.get(&op.name) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                Box::pin(async move { handler.handle(op.input).await })
            }
            None => Box::pin(async move {
                Err(OperationError::UnknownOperation { name: op.name }.into())
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keel_core::RequestContext;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    struct Echo;

    #[async_trait]
    impl OperationHandler for Echo {
        async fn handle(&self, input: Value) -> anyhow::Result<Value> {
            Ok(json!({ "echo": input }))
        }
    }

    fn op(name: &str, input: Value) -> Operation {
        Operation {
            ctx: Arc::new(RequestContext::new("req-1", 0)),
            name: name.to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let mut router = OperationRouter::new();
        router.register("test.echo", Echo);
        let out = router.oneshot(op("test.echo", json!(7))).await.unwrap();
        assert_eq!(out, json!({ "echo": 7 }));
    }

    #[tokio::test]
    async fn unknown_operation_returns_error() {
        let mut router = OperationRouter::new();
        router.register("test.echo", Echo);
        let err = router.oneshot(op("nonexistent", Value::Null)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<OperationError>(),
            Some(&OperationError::UnknownOperation {
                name: "nonexistent".to_string()
            })
        );
    }

    #[tokio::test]
    async fn routes_to_correct_handler_among_multiple() {
        let mut router = OperationRouter::new();
        router.register("test.echo", Echo);
        router.register(
            "test.double",
            handler_fn(|input: Value| async move {
                Ok(json!(input.as_i64().unwrap_or_default() * 2))
            }),
        );
        assert_eq!(router.names(), vec!["test.double", "test.echo"]);

        let out = ServiceExt::ready(&mut router)
            .await
            .unwrap()
            .call(op("test.double", json!(21)))
            .await
            .unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn clones_share_registrations_made_before_cloning() {
        let mut router = OperationRouter::new();
        router.register("test.echo", Echo);
        let clone = router.clone();
        router.register("test.late", Echo);
        assert!(clone.contains("test.echo"));
        assert!(!clone.contains("test.late"));
    }
}
