use keel_core::{BreakerConfig, RetryPolicy};

/// Server-level configuration for the operation execution core.
///
/// Controls operation deadlines, concurrency limits, and the default
/// resilience policies handed to domain services.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline applied to operations whose caller supplies none, in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Retry policy for outbound dependency calls made by domain services.
    pub retry: RetryPolicy,
    /// Circuit-breaker thresholds applied per dependency.
    pub breaker: BreakerConfig,
    /// Capacity of the channel feeding the background audit forwarder.
    pub audit_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            audit_channel_capacity: 1024,
        }
    }
}
