//! Drain controller: serving phase plus in-flight operation tracking.
//!
//! Uses `ArcSwap` for lock-free phase transitions and an atomic counter with
//! RAII guards for in-flight tracking. Once draining begins no new operation
//! is admitted, and `wait_for_drain` resolves as the last guard drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// Lifecycle of the serving process: Starting -> Serving -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingPhase {
    /// Initializing; operations are not admitted yet.
    Starting,
    /// Admitting operations.
    Serving,
    /// Finishing in-flight operations; new ones are refused.
    Draining,
    /// Every in-flight operation has finished.
    Stopped,
}

impl ServingPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ServingPhase::Starting => "starting",
            ServingPhase::Serving => "serving",
            ServingPhase::Draining => "draining",
            ServingPhase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Admission control for graceful shutdown.
#[derive(Debug)]
pub struct DrainController {
    phase: ArcSwap<ServingPhase>,
    in_flight: Arc<InFlight>,
}

impl DrainController {
    /// Creates a controller in the `Starting` phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ArcSwap::from_pointee(ServingPhase::Starting),
            in_flight: Arc::default(),
        }
    }

    pub fn set_serving(&self) {
        self.phase.store(Arc::new(ServingPhase::Serving));
    }

    /// Stops admitting operations. Idempotent.
    pub fn begin_drain(&self) {
        if self.phase() != ServingPhase::Stopped {
            self.phase.store(Arc::new(ServingPhase::Draining));
        }
    }

    #[must_use]
    pub fn phase(&self) -> ServingPhase {
        **self.phase.load()
    }

    /// Admits one operation while serving.
    ///
    /// The count is raised before the phase is checked, so an operation
    /// admitted concurrently with `begin_drain` is always waited for.
    #[must_use]
    pub fn admit(&self) -> Option<InFlightGuard> {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        (self.phase() == ServingPhase::Serving).then_some(guard)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Begins draining and waits for in-flight operations, up to `timeout`.
    ///
    /// Returns `true` (and moves to `Stopped`) once nothing is in flight;
    /// `false` if the timeout expired first (the phase stays `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        self.begin_drain();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.in_flight_count() == 0 {
                self.phase.store(Arc::new(ServingPhase::Stopped));
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight operation; dropping it (even while unwinding)
/// releases the slot.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
