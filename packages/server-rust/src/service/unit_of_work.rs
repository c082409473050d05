//! Units of work: ordered steps with compensations, committed or rolled back
//! as a whole, with exactly one audit event per unit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use keel_core::{
    AuditEvent, AuditOutcome, AuditSink, ClockSource, Classify, ErrorKind, RequestContext,
    TimeoutError,
};

use super::carrier;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Action = Box<dyn FnOnce() -> BoxFuture<anyhow::Result<()>> + Send>;

struct Step {
    name: String,
    action: Action,
    compensation: Action,
}

/// Lifecycle of a unit. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
}

impl UnitState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, UnitState::Committed | UnitState::RolledBack)
    }
}

/// Rollback finished with at least one compensation failing.
///
/// Wraps the step failure that triggered the rollback. Always `Internal`:
/// the system may be left partially applied.
#[derive(Debug, thiserror::Error)]
#[error("rollback of {operation} incomplete; compensations failed: {}", failed.join(", "))]
pub struct RollbackIncomplete {
    pub operation: String,
    pub failed: Vec<String>,
    #[source]
    pub cause: anyhow::Error,
}

impl Classify for RollbackIncomplete {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// An ordered list of steps, each paired with a compensation that undoes it.
pub struct UnitOfWork {
    operation: String,
    steps: Vec<Step>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step. `compensation` runs only if `action` succeeded and a
    /// later step failed.
    #[must_use]
    pub fn step<A, AF, C, CF>(mut self, name: impl Into<String>, action: A, compensation: C) -> Self
    where
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = anyhow::Result<()>> + Send + 'static,
        C: FnOnce() -> CF + Send + 'static,
        CF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            compensation: Box::new(move || Box::pin(compensation())),
        });
        self
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("operation", &self.operation)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// What happened to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub operation: String,
    pub state: UnitState,
    /// Steps whose action succeeded, in order.
    pub applied: Vec<String>,
    /// Steps whose compensation succeeded, in the order they ran.
    pub compensated: Vec<String>,
    pub failed_compensations: Vec<String>,
    pub failed_step: Option<String>,
}

impl UnitReport {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            state: UnitState::Pending,
            applied: Vec::new(),
            compensated: Vec::new(),
            failed_compensations: Vec::new(),
            failed_step: None,
        }
    }
}

/// Runs units of work and records their audit events.
pub struct UnitOfWorkCoordinator {
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn ClockSource>,
}

impl UnitOfWorkCoordinator {
    #[must_use]
    pub fn new(audit: Arc<dyn AuditSink>, clock: Arc<dyn ClockSource>) -> Self {
        Self { audit, clock }
    }

    /// Runs `unit` to a terminal state.
    ///
    /// Steps run in order. If one fails, the remaining steps are skipped and
    /// the compensations of the applied steps run in reverse order; every
    /// compensation is attempted even when an earlier one fails. A step still
    /// running when the operation deadline passes fails with
    /// [`TimeoutError::DeadlineExceeded`]. Compensations are not bounded by
    /// the deadline.
    ///
    /// The unit runs on its own task: dropping the returned future does not
    /// stop it short of a terminal state. Exactly one audit event is emitted
    /// once the unit is terminal. A failing audit sink is logged and does not
    /// change the outcome.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error after a clean rollback, or
    /// [`RollbackIncomplete`] wrapping it if any compensation failed.
    ///
    /// # Panics
    ///
    /// Panics if called outside an operation scope, and re-raises a panic
    /// from a step or compensation.
    pub async fn run(&self, unit: UnitOfWork) -> anyhow::Result<UnitReport> {
        let ctx = carrier::current();
        let guard = carrier::track_unit();
        let audit = Arc::clone(&self.audit);
        let clock = Arc::clone(&self.clock);
        let task = carrier::spawn(async move {
            let _guard = guard;
            drive(unit, &ctx, audit.as_ref(), clock.as_ref()).await
        });
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(anyhow!("unit of work task failed: {err}")),
        }
    }
}

async fn drive(
    unit: UnitOfWork,
    ctx: &RequestContext,
    audit: &dyn AuditSink,
    clock: &dyn ClockSource,
) -> anyhow::Result<UnitReport> {
    let UnitOfWork { operation, steps } = unit;
    let mut report = UnitReport::new(&operation);
    report.state = UnitState::Committing;

    let mut applied: Vec<(String, Action)> = Vec::with_capacity(steps.len());
    let mut failure = None;
    for step in steps {
        let result = tokio::select! {
            biased;
            result = (step.action)() => result,
            () = carrier::until_deadline() => Err(TimeoutError::DeadlineExceeded.into()),
        };
        match result {
            Ok(()) => {
                tracing::debug!(operation = %operation, step = %step.name, "step applied");
                report.applied.push(step.name.clone());
                applied.push((step.name, step.compensation));
            }
            Err(err) => {
                tracing::info!(
                    operation = %operation,
                    step = %step.name,
                    error = %format!("{err:#}"),
                    "step failed; rolling back"
                );
                report.failed_step = Some(step.name);
                failure = Some(err);
                break;
            }
        }
    }

    if failure.is_some() {
        report.state = UnitState::RollingBack;
        while let Some((name, compensation)) = applied.pop() {
            match compensation().await {
                Ok(()) => report.compensated.push(name),
                Err(err) => {
                    tracing::error!(
                        operation = %operation,
                        step = %name,
                        error = %format!("{err:#}"),
                        "compensation failed"
                    );
                    report.failed_compensations.push(name);
                }
            }
        }
        report.state = UnitState::RolledBack;
    } else {
        report.state = UnitState::Committed;
    }

    let event = AuditEvent {
        actor: ctx.actor().map(str::to_string),
        request_id: ctx.request_id().to_string(),
        timestamp_ms: clock.now(),
        operation_name: operation.clone(),
        outcome: if report.state == UnitState::Committed {
            AuditOutcome::Committed
        } else {
            AuditOutcome::RolledBack
        },
        failed_step: report.failed_step.clone(),
    };
    if let Err(err) = audit.record(&event) {
        tracing::warn!(
            operation = %operation,
            request_id = %event.request_id,
            error = %format!("{err:#}"),
            "audit event could not be recorded"
        );
    }

    match failure {
        None => Ok(report),
        Some(cause) if report.failed_compensations.is_empty() => Err(cause),
        Some(cause) => Err(RollbackIncomplete {
            operation,
            failed: report.failed_compensations,
            cause,
        }
        .into()),
    }
}

impl std::fmt::Debug for UnitOfWorkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkCoordinator").finish_non_exhaustive()
    }
}
