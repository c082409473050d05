//! Resilient execution of dependency calls: retry with backoff, per-attempt
//! timeouts bounded by the operation deadline, and circuit breaking.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{
    Classifier, ErrorKind, ObservabilitySink, RetryPolicy, TelemetryEvent, TimeoutError,
};
use rand::Rng;

use super::breaker::{BreakerRegistry, CircuitBreaker};
use super::carrier;

/// Runs fallible dependency calls under a [`RetryPolicy`].
///
/// The operation context is read from the carrier (when present) for the
/// request id and the deadline; a call made outside an operation scope is
/// bounded only by the policy's attempt timeout.
pub struct ResilientExecutor {
    classifier: Arc<Classifier>,
    telemetry: Arc<dyn ObservabilitySink>,
    breakers: Option<Arc<BreakerRegistry>>,
}

impl ResilientExecutor {
    #[must_use]
    pub fn new(classifier: Arc<Classifier>, telemetry: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            classifier,
            telemetry,
            breakers: None,
        }
    }

    /// Guards every dependency with a breaker from `registry`.
    #[must_use]
    pub fn with_breakers(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// Calls `work` until it succeeds, fails with a kind the policy does not
    /// retry, runs out of attempts, or the operation deadline leaves no room
    /// for the next backoff.
    ///
    /// # Errors
    ///
    /// On exhaustion or a non-retryable failure the last error is returned
    /// unchanged. An attempt cut short by the operation deadline, or a timed
    /// out attempt with no budget left to retry, yields
    /// [`TimeoutError::DeadlineExceeded`].
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        mut work: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = carrier::try_current();
        let request_id = ctx
            .as_deref()
            .map(|c| c.request_id().to_string())
            .unwrap_or_default();
        let deadline = ctx.as_deref().and_then(|c| c.deadline());
        let breaker = self.breakers.as_ref().map(|r| r.get(dependency));

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self
                .attempt(breaker.as_deref(), policy, deadline, &mut work)
                .await;
            let latency_ms = elapsed_ms(started);

            let err = match result {
                Ok(value) => {
                    self.telemetry.record(TelemetryEvent::Attempt {
                        request_id,
                        dependency: dependency.to_string(),
                        attempt,
                        latency_ms,
                        error: None,
                    });
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = self.classifier.kind_of(&err);
            self.telemetry.record(TelemetryEvent::Attempt {
                request_id: request_id.clone(),
                dependency: dependency.to_string(),
                attempt,
                latency_ms,
                error: Some(kind),
            });

            if attempt >= policy.max_attempts() || !policy.retries(kind) {
                return Err(err);
            }

            let delay = retry_delay(policy, attempt);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                tracing::debug!(
                    %request_id,
                    dependency,
                    attempt,
                    "no budget left for another attempt"
                );
                return Err(if err.is::<TimeoutError>() {
                    TimeoutError::DeadlineExceeded.into()
                } else {
                    err
                });
            }

            self.telemetry.record(TelemetryEvent::Retry {
                request_id: request_id.clone(),
                dependency: dependency.to_string(),
                attempt: attempt + 1,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                cause: kind,
            });
            carrier::record_retry();
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        breaker: Option<&CircuitBreaker>,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        work: &mut F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let permit = match breaker {
            Some(b) => Some(b.try_acquire()?),
            None => None,
        };
        let result = bounded(work(), policy.attempt_timeout(), deadline).await;
        if let Some(permit) = permit {
            match &result {
                Err(err) if self.counts_against_breaker(err) => permit.failure(),
                _ => permit.success(),
            }
        }
        result
    }

    fn counts_against_breaker(&self, err: &anyhow::Error) -> bool {
        match err.downcast_ref::<TimeoutError>() {
            Some(TimeoutError::AttemptTimedOut { .. }) => true,
            Some(TimeoutError::DeadlineExceeded) => false,
            None => self.classifier.kind_of(err) == ErrorKind::Dependency,
        }
    }
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("classifier", &self.classifier)
            .field("breakers", &self.breakers.is_some())
            .finish_non_exhaustive()
    }
}

/// Races `fut` against the earlier of the attempt timeout and the deadline.
async fn bounded<T>(
    fut: impl Future<Output = anyhow::Result<T>>,
    attempt_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> anyhow::Result<T> {
    let attempt_deadline = attempt_timeout.map(|t| Instant::now() + t);
    let (bound, from_context) = match (attempt_deadline, deadline) {
        (Some(own), Some(ctx)) if ctx <= own => (ctx, true),
        (Some(own), _) => (own, false),
        (None, Some(ctx)) => (ctx, true),
        (None, None) => return fut.await,
    };
    match tokio::time::timeout_at(tokio::time::Instant::from_std(bound), fut).await {
        Ok(result) => result,
        Err(_) if from_context => Err(TimeoutError::DeadlineExceeded.into()),
        Err(_) => Err(TimeoutError::AttemptTimedOut {
            timeout_ms: attempt_timeout.map_or(0, |t| {
                u64::try_from(t.as_millis()).unwrap_or(u64::MAX)
            }),
        }
        .into()),
    }
}

/// Backoff after the given failed attempt, jittered by a uniform factor in
/// `[0.5, 1.5]` when the policy asks for it, never above `max_delay`.
pub(crate) fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.backoff(attempt);
    if !policy.jitter() || delay.is_zero() {
        return delay;
    }
    let factor: f64 = rand::rng().random_range(0.5..=1.5);
    delay.mul_f64(factor).min(policy.max_delay())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
