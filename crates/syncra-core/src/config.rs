//! Configuration for the listener engine.
//!
//! Every timing knob of the lease protocol is externally tunable; none of the
//! intervals are hard-coded at call sites. Correctness of the lease protocol
//! assumes `stale_threshold > heartbeat_interval` with enough margin to cover
//! network jitter and clock skew between instances, which [`validate`]
//! enforces in its minimal form.
//!
//! [`validate`]: ListenerConfig::validate

use std::time::Duration;

use crate::defaults;
use crate::error::{Error, Result};

/// Configuration for the listener engine.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Interval between lease heartbeat refreshes.
    pub heartbeat_interval: Duration,
    /// Lease age beyond which any instance may reclaim it.
    pub stale_threshold: Duration,
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Interval between lease-acquisition scans.
    pub acquire_interval: Duration,
    /// Backoff before a failed watcher re-subscribes.
    pub watch_backoff: Duration,
    /// Number of document-processor workers.
    pub processor_workers: usize,
    /// Capacity of the change-event channel feeding the processors.
    pub event_queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS),
            stale_threshold: Duration::from_secs(defaults::LEASE_STALE_SECS),
            reconcile_interval: Duration::from_secs(defaults::RECONCILE_INTERVAL_SECS),
            acquire_interval: Duration::from_secs(defaults::ACQUIRE_INTERVAL_SECS),
            watch_backoff: Duration::from_secs(defaults::WATCH_BACKOFF_SECS),
            processor_workers: defaults::PROCESSOR_WORKERS,
            event_queue_capacity: defaults::EVENT_QUEUE_CAPACITY,
        }
    }
}

impl ListenerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SYNCRA_HEARTBEAT_INTERVAL_SECS` | `10` | Lease heartbeat refresh interval |
    /// | `SYNCRA_LEASE_STALE_SECS` | `30` | Staleness threshold for lease takeover |
    /// | `SYNCRA_RECONCILE_INTERVAL_SECS` | `30` | Reconciliation poll interval |
    /// | `SYNCRA_ACQUIRE_INTERVAL_SECS` | `15` | Lease-acquisition poll interval |
    /// | `SYNCRA_WATCH_BACKOFF_SECS` | `5` | Watcher restart backoff |
    /// | `SYNCRA_PROCESSOR_WORKERS` | `4` | Document-processor worker count |
    /// | `SYNCRA_EVENT_QUEUE_CAPACITY` | `256` | Change-event channel capacity |
    pub fn from_env() -> Self {
        fn secs(var: &str, default: u64) -> Duration {
            Duration::from_secs(
                std::env::var(var)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(default),
            )
        }

        let processor_workers = std::env::var("SYNCRA_PROCESSOR_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::PROCESSOR_WORKERS)
            .max(1);

        let event_queue_capacity = std::env::var("SYNCRA_EVENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::EVENT_QUEUE_CAPACITY)
            .max(1);

        Self {
            heartbeat_interval: secs(
                "SYNCRA_HEARTBEAT_INTERVAL_SECS",
                defaults::HEARTBEAT_INTERVAL_SECS,
            ),
            stale_threshold: secs("SYNCRA_LEASE_STALE_SECS", defaults::LEASE_STALE_SECS),
            reconcile_interval: secs(
                "SYNCRA_RECONCILE_INTERVAL_SECS",
                defaults::RECONCILE_INTERVAL_SECS,
            ),
            acquire_interval: secs("SYNCRA_ACQUIRE_INTERVAL_SECS", defaults::ACQUIRE_INTERVAL_SECS),
            watch_backoff: secs("SYNCRA_WATCH_BACKOFF_SECS", defaults::WATCH_BACKOFF_SECS),
            processor_workers,
            event_queue_capacity,
        }
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the lease staleness threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set the reconciliation poll interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the lease-acquisition poll interval.
    pub fn with_acquire_interval(mut self, interval: Duration) -> Self {
        self.acquire_interval = interval;
        self
    }

    /// Set the watcher restart backoff.
    pub fn with_watch_backoff(mut self, backoff: Duration) -> Self {
        self.watch_backoff = backoff;
        self
    }

    /// Set the processor worker count.
    pub fn with_processor_workers(mut self, workers: usize) -> Self {
        self.processor_workers = workers.max(1);
        self
    }

    /// Validate the lease-protocol invariant: the staleness threshold must
    /// exceed the heartbeat interval, or a healthy instance's leases would be
    /// stolen between refreshes.
    pub fn validate(&self) -> Result<()> {
        if self.stale_threshold <= self.heartbeat_interval {
            return Err(Error::Config(format!(
                "stale threshold ({:?}) must exceed heartbeat interval ({:?})",
                self.stale_threshold, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ListenerConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.stale_threshold, Duration::from_secs(30));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.acquire_interval, Duration::from_secs(15));
        assert_eq!(config.watch_backoff, Duration::from_secs(5));
        assert_eq!(config.processor_workers, 4);
    }

    #[test]
    fn test_config_builder_chaining() {
        let config = ListenerConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_stale_threshold(Duration::from_millis(200))
            .with_reconcile_interval(Duration::from_millis(100))
            .with_acquire_interval(Duration::from_millis(75))
            .with_watch_backoff(Duration::from_millis(20))
            .with_processor_workers(2);

        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.stale_threshold, Duration::from_millis(200));
        assert_eq!(config.reconcile_interval, Duration::from_millis(100));
        assert_eq!(config.acquire_interval, Duration::from_millis(75));
        assert_eq!(config.watch_backoff, Duration::from_millis(20));
        assert_eq!(config.processor_workers, 2);
    }

    #[test]
    fn test_config_workers_floor_is_one() {
        let config = ListenerConfig::default().with_processor_workers(0);
        assert_eq!(config.processor_workers, 1);
    }

    #[test]
    fn test_validate_default_ok() {
        assert!(ListenerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_stale_below_heartbeat() {
        let config = ListenerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_stale_threshold(Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_equal_values() {
        let config = ListenerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_stale_threshold(Duration::from_secs(10));
        assert!(config.validate().is_err());
    }
}
