//! Explicitly scoped query state.

use std::fmt;
use std::sync::Arc;

use crate::{ActiveRegistry, CacheManager, LiveStore, QueryConfig, Ttl};

/// Owns the caches, the consumer registry and the sweeper.
///
/// Build one per application (or per test) and pass it to whatever needs
/// it. `shutdown` stops the sweeper; dropping the last clone does too.
#[derive(Clone)]
pub struct QueryContext {
    cache: CacheManager,
    live: LiveStore,
    config: Arc<QueryConfig>,
}

impl QueryContext {
    /// Create a context without starting the sweeper.
    pub fn new(config: QueryConfig) -> Self {
        Self {
            cache: CacheManager::new(config.event_capacity),
            live: LiveStore::new(),
            config: Arc::new(config),
        }
    }

    /// Create a context and start the sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: QueryConfig) -> Self {
        let context = Self::new(config);
        context.start_sweeper();
        context
    }

    /// Start the sweeper at the configured interval.
    pub fn start_sweeper(&self) -> bool {
        self.cache.start_sweeper(self.config.sweep_interval())
    }

    /// Get the cache.
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Get the consumer registry.
    pub fn registry(&self) -> &ActiveRegistry {
        self.cache.registry()
    }

    /// Get the live state store.
    pub fn live_store(&self) -> &LiveStore {
        &self.live
    }

    /// Get the configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Default TTL for new queries.
    pub fn default_ttl(&self) -> Ttl {
        self.config.ttl()
    }

    /// Stop background work. Cached state is kept.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        tracing::debug!("Query context shut down");
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new(QueryConfig::default())
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let context = QueryContext::start(QueryConfig::default());
        assert!(context.cache().is_sweeping());
        assert!(!context.start_sweeper());

        context.shutdown();
        assert!(!context.cache().is_sweeping());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let context = QueryContext::default();
        let clone = context.clone();
        let key = crate::StateKey::from("planet.list");

        context
            .cache()
            .set(crate::CacheKind::Query, &key, 1u8, context.default_ttl());
        let _guard = clone.registry().mount(crate::CacheKind::Query, &key);

        assert!(clone.cache().contains(crate::CacheKind::Query, &key));
        assert!(context.registry().is_pinned(crate::CacheKind::Query, &key));
    }
}
