//! Query layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackoffStrategy, QueryError, RetryPolicy, Ttl};

/// Defaults for caches, sweeping and retries.
///
/// Absent durations mean "never".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Age after which cached values are stale.
    pub stale_after_ms: Option<u64>,
    /// Age after which unpinned values are evicted.
    pub evict_after_ms: Option<u64>,
    /// Interval between sweeps.
    pub sweep_interval_ms: u64,
    /// Retry attempts after a failed fetch.
    pub retry: u32,
    /// Delay between retry attempts.
    pub retry_delay_ms: u64,
    /// Buffered cache events per subscriber.
    pub event_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: Some(1000),
            evict_after_ms: Some(5 * 60 * 1000),
            sweep_interval_ms: 2 * 60 * 1000,
            retry: 0,
            retry_delay_ms: 1000,
            event_capacity: 64,
        }
    }
}

impl QueryConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staleness window.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after_ms = stale_after.map(|d| d.as_millis() as u64);
        self
    }

    /// Set the eviction window.
    pub fn with_evict_after(mut self, evict_after: Option<Duration>) -> Self {
        self.evict_after_ms = evict_after.map(|d| d.as_millis() as u64);
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set retry attempts and delay.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry = attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Default TTL for cached values.
    pub fn ttl(&self) -> Ttl {
        Ttl::new(
            self.stale_after_ms.map(Duration::from_millis),
            self.evict_after_ms.map(Duration::from_millis),
        )
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Default retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry == 0 {
            return RetryPolicy::none();
        }
        RetryPolicy::new(self.retry).with_backoff(BackoffStrategy::Fixed(Duration::from_millis(
            self.retry_delay_ms,
        )))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.sweep_interval_ms == 0 {
            return Err(QueryError::InvalidConfig(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueryError::InvalidConfig(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if let (Some(stale), Some(evict)) = (self.stale_after_ms, self.evict_after_ms) {
            if stale > evict {
                return Err(QueryError::InvalidConfig(format!(
                    "stale_after_ms ({stale}) exceeds evict_after_ms ({evict})"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueryConfig::default();

        assert_eq!(config.ttl(), Ttl::default());
        assert_eq!(config.sweep_interval(), Duration::from_secs(120));
        assert_eq!(config.retry_policy(), RetryPolicy::none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = QueryConfig::new().with_retry(3, Duration::from_millis(250));
        let policy = config.retry_policy();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed(Duration::from_millis(250)));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let config = QueryConfig::new()
            .with_stale_after(Some(Duration::from_secs(10)))
            .with_evict_after(Some(Duration::from_secs(1)));
        assert!(matches!(config.validate(), Err(QueryError::InvalidConfig(_))));

        let config = QueryConfig::new().with_sweep_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = QueryConfig::new().with_evict_after(None);
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl().evict_after, None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: QueryConfig = serde_json::from_str(r#"{"retry": 2, "evict_after_ms": null}"#).unwrap();

        assert_eq!(config.retry, 2);
        assert_eq!(config.evict_after_ms, None);
        assert_eq!(config.stale_after_ms, Some(1000));
    }
}
