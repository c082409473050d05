//! Deadline middleware for operations.
//!
//! Stops waiting for an operation when its context deadline passes and fails it
//! with `TimeoutError::DeadlineExceeded`. Units of work started by the
//! operation run on their own tasks and observe the same deadline; the layer
//! waits for them to settle before answering, so a deadline response never
//! races a rollback. Operations without a deadline pass through.

use std::task::{Context, Poll};

use keel_core::TimeoutError;
use serde_json::Value;
use tower::{Layer, Service};

use crate::service::carrier;
use crate::service::operation::{Operation, OperationFuture};

// ---------------------------------------------------------------------------
// DeadlineLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing each operation's own deadline.
///
/// The deadline is read from `op.ctx`, so different operations may carry
/// different budgets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineLayer;

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService { inner }
    }
}

// ---------------------------------------------------------------------------
// DeadlineService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
}

impl<S> Service<Operation> for DeadlineService<S>
where
    S: Service<Operation, Response = Value, Error = anyhow::Error> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = anyhow::Error;
    type Future = OperationFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let deadline = op.ctx().deadline();
        let fut = self.inner.call(op);
        Box::pin(async move {
            let Some(deadline) = deadline else {
                return fut.await;
            };
            match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    carrier::units_settled().await;
                    Err(TimeoutError::DeadlineExceeded.into())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
