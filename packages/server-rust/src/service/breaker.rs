//! Per-dependency circuit breakers.
//!
//! A breaker counts consecutive `Dependency` failures. At the threshold it
//! opens and rejects calls with [`CircuitOpen`] until `reset_timeout` has
//! passed, then admits a bounded number of probe calls (half-open). A probe
//! success closes the circuit; a probe failure reopens it.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use keel_core::{
    BreakerConfig, CircuitOpen, CircuitState, ObservabilitySink, TelemetryEvent,
};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Circuit breaker guarding a single named dependency.
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Arc<dyn ObservabilitySink>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        dependency: impl Into<String>,
        config: BreakerConfig,
        telemetry: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
            telemetry,
        }
    }

    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Current state. An open circuit whose reset timeout has elapsed still
    /// reports `Open` until the next call moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Asks to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open, or while half-open
    /// with all probe slots taken.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 0;
                    transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                }
            }
            match inner.state {
                CircuitState::Closed => Some(false),
                CircuitState::HalfOpen if inner.probes_in_flight < self.config.half_open_max_calls => {
                    inner.probes_in_flight += 1;
                    Some(true)
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.emit(transition);
        match admitted {
            Some(probe) => Ok(BreakerPermit {
                breaker: self,
                probe,
                settled: false,
            }),
            None => Err(CircuitOpen {
                dependency: self.dependency.clone(),
            }),
        }
    }

    fn on_success(&self, probe: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if probe {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            } else {
                None
            }
        };
        self.emit(transition);
    }

    fn on_failure(&self, probe: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if probe {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let from = inner.state;
            let trips = match from {
                CircuitState::Closed => {
                    inner.consecutive_failures >= self.config.failure_threshold
                }
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if trips {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                Some((from, CircuitState::Open))
            } else {
                None
            }
        };
        self.emit(transition);
    }

    fn on_abandon(&self, probe: bool) {
        if probe {
            let mut inner = self.inner.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn emit(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.telemetry.record(TelemetryEvent::BreakerTransition {
                dependency: self.dependency.clone(),
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BreakerPermit
// ---------------------------------------------------------------------------

/// Admission to make one call through a breaker.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// A permit dropped unsettled (e.g. the call was cancelled) releases its
/// probe slot without affecting the failure count.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Lazily creates one breaker per dependency name, all sharing one config.
pub struct BreakerRegistry {
    config: BreakerConfig,
    telemetry: Arc<dyn ObservabilitySink>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig, telemetry: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            config,
            telemetry,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `dependency`, creating it on first use.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency,
                    self.config.clone(),
                    Arc::clone(&self.telemetry),
                ))
            })
            .clone()
    }

    /// Snapshot of every known breaker's state.
    #[must_use]
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
