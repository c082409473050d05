//! Context carrier: makes the current `RequestContext` visible to any code
//! running inside an operation without threading it through signatures.
//!
//! Built on a tokio task-local slot. A scope is established by
//! [`with_context`] (normally only by the operation wrapper) and read with
//! [`current`]. Tasks spawned through [`spawn`] inherit the enclosing scope;
//! plain `tokio::spawn` does not, so code that fans out work must use the
//! helpers here.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use keel_core::RequestContext;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

tokio::task_local! {
    static SCOPE: Scope;
}

#[derive(Clone)]
struct Scope {
    ctx: Arc<RequestContext>,
    stats: Arc<CallStats>,
}

/// Counters shared by every task running under the same operation.
#[derive(Debug, Default)]
struct CallStats {
    retries: AtomicU32,
    units: AtomicU32,
    settled: Notify,
}

impl Scope {
    /// Builds the scope for `ctx`, sharing stats with an enclosing scope of
    /// the same request.
    ///
    /// # Panics
    ///
    /// Panics if an enclosing scope belongs to a different request or identity.
    fn enter(ctx: Arc<RequestContext>) -> Self {
        match SCOPE.try_with(Clone::clone) {
            Ok(parent) => {
                assert!(
                    parent.ctx.request_id() == ctx.request_id()
                        && parent.ctx.identity() == ctx.identity(),
                    "nested scope for request {} must derive from enclosing request {}",
                    ctx.request_id(),
                    parent.ctx.request_id(),
                );
                Self {
                    ctx,
                    stats: parent.stats,
                }
            }
            Err(_) => Self {
                ctx,
                stats: Arc::default(),
            },
        }
    }
}

/// Runs `fut` with `ctx` as the current context.
pub fn with_context<F>(
    ctx: impl Into<Arc<RequestContext>>,
    fut: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    SCOPE.scope(Scope::enter(ctx.into()), fut)
}

/// Runs `fut` under a context derived from the current one.
///
/// # Panics
///
/// Panics if called outside an operation scope, or if `derive` changes the
/// request id or identity.
pub fn with_derived<F>(
    derive: impl FnOnce(&RequestContext) -> RequestContext,
    fut: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let derived = derive(&current());
    with_context(derived, fut)
}

/// Runs a synchronous closure with `ctx` as the current context.
pub fn sync_scope<R>(ctx: impl Into<Arc<RequestContext>>, f: impl FnOnce() -> R) -> R {
    SCOPE.sync_scope(Scope::enter(ctx.into()), f)
}

/// Returns the context of the enclosing operation.
///
/// # Panics
///
/// Calling this outside any operation scope is a wiring bug, not a runtime
/// condition, and panics.
#[must_use]
pub fn current() -> Arc<RequestContext> {
    match try_current() {
        Some(ctx) => ctx,
        None => panic!("carrier::current() called outside an operation scope"),
    }
}

/// Returns the context of the enclosing operation, if there is one.
#[must_use]
pub fn try_current() -> Option<Arc<RequestContext>> {
    SCOPE.try_with(|scope| Arc::clone(&scope.ctx)).ok()
}

/// Spawns a task that inherits the current scope (if any).
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match SCOPE.try_with(Clone::clone) {
        Ok(scope) => tokio::spawn(SCOPE.scope(scope, fut)),
        Err(_) => tokio::spawn(fut),
    }
}

/// Spawns a task under a context derived from the current one, e.g. with a
/// shorter deadline.
///
/// # Panics
///
/// Panics if called outside an operation scope, or if `derive` changes the
/// request id or identity.
pub fn spawn_with<F>(
    derive: impl FnOnce(&RequestContext) -> RequestContext,
    fut: F,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let scope = Scope::enter(Arc::new(derive(&current())));
    tokio::spawn(SCOPE.scope(scope, fut))
}

/// Resolves when the current operation's deadline passes.
///
/// Pending forever when there is no deadline or no scope. Long-running work
/// selects on this at its own suspension points to stop promptly.
pub async fn until_deadline() {
    match try_current().and_then(|ctx| ctx.deadline()) {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Counts one retry against the current operation. No-op outside a scope.
pub fn record_retry() {
    let _ = SCOPE.try_with(|scope| scope.stats.retries.fetch_add(1, Ordering::Relaxed));
}

/// Retries counted so far for the current operation (0 outside a scope).
#[must_use]
pub fn retry_count() -> u32 {
    SCOPE
        .try_with(|scope| scope.stats.retries.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Marks a unit of work as in flight for the current operation until dropped.
///
/// `None` outside a scope.
#[must_use]
pub fn track_unit() -> Option<UnitGuard> {
    SCOPE
        .try_with(|scope| {
            scope.stats.units.fetch_add(1, Ordering::AcqRel);
            UnitGuard {
                stats: Arc::clone(&scope.stats),
            }
        })
        .ok()
}

/// Resolves once no unit of work of the current operation is in flight.
///
/// Ready immediately outside a scope.
pub async fn units_settled() {
    let Ok(stats) = SCOPE.try_with(|scope| Arc::clone(&scope.stats)) else {
        return;
    };
    loop {
        let notified = stats.settled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if stats.units.load(Ordering::Acquire) == 0 {
            return;
        }
        notified.await;
    }
}

/// Held while a unit of work runs; see [`track_unit`].
#[derive(Debug)]
pub struct UnitGuard {
    stats: Arc<CallStats>,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if self.stats.units.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stats.settled.notify_waiters();
        }
    }
}
