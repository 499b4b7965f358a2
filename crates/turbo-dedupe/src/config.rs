//! Coalescing configuration.

use serde::{Deserialize, Serialize};
use turbo_stream::QueueCapacity;

/// Coalescing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Only coalesce GET calls.
    pub filter_get_only: bool,
    /// Per-replica buffer depth for fanned-out streams (unbounded if unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_capacity: Option<usize>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            filter_get_only: true,
            replica_capacity: None,
        }
    }
}

impl DedupeConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether only GET calls are coalesced.
    pub fn with_filter_get_only(mut self, get_only: bool) -> Self {
        self.filter_get_only = get_only;
        self
    }

    /// Bound each replica's buffer.
    pub fn with_replica_capacity(mut self, capacity: usize) -> Self {
        self.replica_capacity = Some(capacity);
        self
    }

    /// Queue capacity used for replicas.
    pub fn capacity(&self) -> QueueCapacity {
        match self.replica_capacity {
            Some(n) => QueueCapacity::Bounded(n),
            None => QueueCapacity::Unbounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DedupeConfig::default();
        assert!(config.filter_get_only);
        assert_eq!(config.capacity(), QueueCapacity::Unbounded);
    }

    #[test]
    fn test_builder() {
        let config = DedupeConfig::new()
            .with_filter_get_only(false)
            .with_replica_capacity(8);

        assert!(!config.filter_get_only);
        assert_eq!(config.capacity(), QueueCapacity::Bounded(8));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DedupeConfig = serde_json::from_str(r#"{"replica_capacity": 4}"#).unwrap();
        assert!(config.filter_get_only);
        assert_eq!(config.replica_capacity, Some(4));
    }
}
