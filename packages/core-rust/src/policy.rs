//! Resilience policy values: retry/backoff and circuit-breaker settings.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;

/// Errors from constructing an invalid policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("base_delay {base_ms}ms exceeds max_delay {max_ms}ms")]
    DelayOrder { base_ms: u128, max_ms: u128 },
    #[error("{0} failures are never retried")]
    NotRetryable(ErrorKind),
    #[error("failure_threshold must be at least 1")]
    ZeroThreshold,
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Immutable retry configuration handed to the resilient executor.
///
/// Delays follow `min(max_delay, base_delay * 2^(attempt - 1))`, optionally
/// randomized by the executor when `jitter` is set. Only kinds the taxonomy
/// marks retryable may appear in `retryable_kinds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    retryable_kinds: BTreeSet<ErrorKind>,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Creates a policy retrying `Dependency` failures, without jitter.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` if `max_attempts` is zero or `base_delay > max_delay`.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if base_delay > max_delay {
            return Err(PolicyError::DelayOrder {
                base_ms: base_delay.as_millis(),
                max_ms: max_delay.as_millis(),
            });
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
            retryable_kinds: BTreeSet::from([ErrorKind::Dependency]),
            attempt_timeout: None,
        })
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            retryable_kinds: BTreeSet::new(),
            attempt_timeout: None,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Replaces the set of kinds that trigger a retry.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::NotRetryable` if any kind is never retryable
    /// (a retry cannot resolve a validation error or a logical conflict).
    pub fn retry_on(
        mut self,
        kinds: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self, PolicyError> {
        let kinds: BTreeSet<ErrorKind> = kinds.into_iter().collect();
        if let Some(kind) = kinds.iter().find(|k| !k.is_retryable()) {
            return Err(PolicyError::NotRetryable(*kind));
        }
        self.retryable_kinds = kinds;
        Ok(self)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    #[must_use]
    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    #[must_use]
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay to wait after the given (1-based) failed attempt, before jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 100ms doubling up to 5s, with jitter.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
            retryable_kinds: BTreeSet::from([ErrorKind::Dependency]),
            attempt_timeout: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerConfig
// ---------------------------------------------------------------------------

/// Circuit-breaker state: Closed -> Open -> `HalfOpen` -> {Closed, Open}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A limited number of probe calls decide whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit-breaker thresholds for a single dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive `Dependency` failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting probe calls.
    pub reset_timeout: Duration,
    /// Probe calls admitted concurrently while half-open.
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    /// # Errors
    ///
    /// Returns `PolicyError::ZeroThreshold` if `failure_threshold` is zero.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.failure_threshold == 0 {
            return Err(PolicyError::ZeroThreshold);
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}
