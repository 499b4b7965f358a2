//! Cached query handles.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use turbo_rpc::RpcError;

use crate::{CacheKind, CacheManager, PinGuard, QueryContext, RetryPolicy, StateKey, Ttl};

/// Produces a fresh value for a query.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, RpcError>> + Send + Sync>;

/// Per-query overrides of the context defaults.
#[derive(Debug, Clone)]
pub struct QueryOptions<T> {
    /// Cache key override.
    pub key: Option<StateKey>,
    /// Staleness and eviction windows.
    pub ttl: Option<Ttl>,
    /// Value seeded into an empty cache.
    pub initial_value: Option<T>,
    /// Retry policy for failed fetches.
    pub retry: Option<RetryPolicy>,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            key: None,
            ttl: None,
            initial_value: None,
            retry: None,
        }
    }
}

impl<T> QueryOptions<T> {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the cache key.
    pub fn with_key(mut self, key: impl Into<StateKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set staleness and eviction windows.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Seed the cache when it is empty.
    pub fn with_initial_value(mut self, value: T) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Default)]
struct QueryState {
    error: Option<RpcError>,
    // Fetches in flight; `refetch` may overlap a `fetch_if_needed`.
    executing: usize,
}

struct QueryInner<T> {
    key: StateKey,
    cache: CacheManager,
    fetcher: Fetcher<T>,
    ttl: Ttl,
    retry: RetryPolicy,
    state: Mutex<QueryState>,
}

/// Counts a fetch as in flight until it ends, however it ends.
struct Executing<'a, T> {
    inner: &'a QueryInner<T>,
}

impl<'a, T> Executing<'a, T> {
    fn try_enter(inner: &'a QueryInner<T>) -> Option<Self> {
        let mut state = inner.state.lock();
        if state.executing > 0 {
            return None;
        }
        state.executing = 1;
        Some(Self { inner })
    }

    fn enter(inner: &'a QueryInner<T>) -> Self {
        inner.state.lock().executing += 1;
        Self { inner }
    }
}

impl<T> Drop for Executing<'_, T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.executing = state.executing.saturating_sub(1);
    }
}

/// A cached remote value with loading, error and staleness state.
///
/// Handles with the same key share the cached value. Cloning a handle
/// shares its error and executing state as well.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Query<T> {
    /// Create a query over `fetcher`.
    pub fn new(context: &QueryContext, key: StateKey, fetcher: Fetcher<T>, options: QueryOptions<T>) -> Self {
        let QueryOptions {
            key: key_override,
            ttl,
            initial_value,
            retry,
        } = options;

        let key = key_override.unwrap_or(key);
        let ttl = ttl.unwrap_or_else(|| context.default_ttl());
        let cache = context.cache().clone();

        if let Some(value) = initial_value {
            if cache.get_raw(CacheKind::Query, &key).is_none() {
                cache.set(CacheKind::Query, &key, value, ttl);
            }
        }

        Self {
            inner: Arc::new(QueryInner {
                key,
                cache,
                fetcher,
                ttl,
                retry: retry.unwrap_or_else(|| context.config().retry_policy()),
                state: Mutex::new(QueryState::default()),
            }),
        }
    }

    /// Create a query from a closure.
    pub fn from_fn<F, Fut>(context: &QueryContext, key: impl Into<StateKey>, fetch: F, options: QueryOptions<T>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    {
        let fetcher: Fetcher<T> = Arc::new(move || -> BoxFuture<'static, Result<T, RpcError>> { fetch().boxed() });
        Self::new(context, key.into(), fetcher, options)
    }

    /// The cache key.
    pub fn key(&self) -> &StateKey {
        &self.inner.key
    }

    /// The cached value.
    pub fn value(&self) -> Option<Arc<T>> {
        self.inner.cache.get::<T>(CacheKind::Query, &self.inner.key)
    }

    /// Overwrite the cached value and clear the error.
    pub fn set_value(&self, value: T) {
        self.inner
            .cache
            .set(CacheKind::Query, &self.inner.key, value, self.inner.ttl);
        self.inner.state.lock().error = None;
    }

    /// No value yet and no error.
    pub fn is_loading(&self) -> bool {
        self.value().is_none() && self.error().is_none()
    }

    /// The error from the last fetch, after retries.
    pub fn error(&self) -> Option<RpcError> {
        self.inner.state.lock().error.clone()
    }

    /// Whether the cached value needs a refresh.
    pub fn is_stale(&self) -> bool {
        self.inner.cache.is_stale(CacheKind::Query, &self.inner.key)
    }

    /// When the value was last written.
    pub fn last_updated(&self) -> Option<Instant> {
        self.inner.cache.last_updated(CacheKind::Query, &self.inner.key)
    }

    /// Whether a fetch is in progress.
    pub fn is_executing(&self) -> bool {
        self.inner.state.lock().executing > 0
    }

    /// Whether a fetch would do anything: no value, or a stale one.
    pub fn should_fetch(&self) -> bool {
        self.value().is_none() || self.is_stale()
    }

    /// Pin the key for as long as the guard lives.
    pub fn mount(&self) -> PinGuard {
        self.inner.cache.registry().mount(CacheKind::Query, &self.inner.key)
    }

    /// Fetch unless the value is fresh or a fetch is already running.
    ///
    /// Returns whether a fetch ran.
    pub async fn fetch_if_needed(&self) -> Result<bool, RpcError> {
        if !self.should_fetch() {
            return Ok(false);
        }
        let Some(_executing) = Executing::try_enter(&self.inner) else {
            return Ok(false);
        };
        self.execute().await.map(|()| true)
    }

    /// Clear the error and fetch now.
    pub async fn refetch(&self) -> Result<(), RpcError> {
        self.inner.state.lock().error = None;
        let _executing = Executing::enter(&self.inner);
        self.execute().await
    }

    /// Drop the cached value.
    pub fn invalidate(&self) -> bool {
        self.inner.cache.invalidate(CacheKind::Query, &self.inner.key)
    }

    async fn execute(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        let result = inner
            .retry
            .run(|attempt| {
                tracing::trace!(key = %inner.key, attempt, "Fetching query");
                (inner.fetcher)()
            })
            .await;

        match result {
            Ok(value) => {
                inner.cache.set(CacheKind::Query, &inner.key, value, inner.ttl);
                inner.state.lock().error = None;
                Ok(())
            }
            Err(error) => {
                tracing::error!(key = %inner.key, %error, "Query failed after retries");
                inner.state.lock().error = Some(error.clone());
                Err(error)
            }
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}
