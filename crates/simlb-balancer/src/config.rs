use std::time::Duration;

/// Default health probe, a JSON-RPC `net_version` call most execution
/// backends answer cheaply.
pub const DEFAULT_HEALTH_PROBE: &str =
    r#"{"jsonrpc":"2.0","method":"net_version","params":[],"id":123}"#;

/// Every tunable of the balancer in one place.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Worker tasks per node.
    pub num_workers: usize,
    /// Sub-queue capacities; 0 means unbounded.
    pub max_fast_track: usize,
    pub max_high_prio: usize,
    pub max_low_prio: usize,
    /// Interleaving ratio between the fast-track and high-prio classes.
    pub high_prio_per_fast_track: u64,
    /// Fully drain fast-track before high-prio is considered.
    pub fast_track_drain_first: bool,
    /// Maximum age a request may reach in the queue before a worker
    /// discards it unexecuted.
    pub request_timeout: Duration,
    /// Maximum duration of one outbound backend call.
    pub proxy_request_timeout: Duration,
    /// Re-pushes allowed for a retryable failure; total attempts are
    /// `max_retries + 1`.
    pub max_retries: u32,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive probe failures before a node's workers are stopped.
    pub health_check_failure_threshold: u32,
    /// JSON-RPC payload posted by the health probe.
    pub health_probe: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_fast_track: 0,
            max_high_prio: 0,
            max_low_prio: 0,
            high_prio_per_fast_track: 1,
            fast_track_drain_first: false,
            request_timeout: Duration::from_secs(10),
            proxy_request_timeout: Duration::from_secs(10),
            max_retries: 3,
            health_check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(5),
            health_check_failure_threshold: 3,
            health_probe: DEFAULT_HEALTH_PROBE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BalancerConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_fast_track, 0);
        assert_eq!(config.high_prio_per_fast_track, 1);
        assert!(!config.fast_track_drain_first);
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert!(config.health_probe.contains("net_version"));
    }

    #[test]
    fn test_probe_is_valid_json() {
        let value: serde_json::Value = serde_json::from_str(DEFAULT_HEALTH_PROBE).unwrap();
        assert_eq!(value["method"], "net_version");
        assert_eq!(value["jsonrpc"], "2.0");
    }
}
