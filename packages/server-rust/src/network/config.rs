//! Network configuration types for the HTTP transport.

use std::time::Duration;

/// Time the transport backstop keeps beyond the longest operation deadline,
/// so rollback and the response always beat it.
pub const DEADLINE_HEADROOM: Duration = Duration::from_secs(1);

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Transport-level backstop for a whole HTTP request. Operation deadlines
    /// are enforced by the pipeline; keep this longer than the longest one.
    pub request_timeout: Duration,
    /// Maximum time to wait for in-flight operations after shutdown begins.
    pub drain_timeout: Duration,
}

impl NetworkConfig {
    /// Longest operation deadline a caller may ask for.
    #[must_use]
    pub fn max_operation_timeout(&self) -> Duration {
        self.request_timeout.saturating_sub(DEADLINE_HEADROOM)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            request_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.max_operation_timeout(), Duration::from_secs(59));
    }
}
