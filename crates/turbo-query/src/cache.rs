//! Time-aware cache with staleness, expiry and pinning.
//!
//! Entry freshness is derived from elapsed time:
//!
//! ```text
//! Missing -> Fresh -> Stale -> Expired
//!            (age <= stale_after)
//!                     (age <= evict_after)
//!                              (age > evict_after)
//! ```
//!
//! Stale entries are still served. Expired entries are a miss unless their
//! key is pinned by a mounted consumer, in which case the last value is
//! served until the consumer goes away.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::ActiveRegistry;

/// A type-erased cached value.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Which cache an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Query results.
    Query,
    /// Mutation results.
    Mutation,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Query => f.write_str("query"),
            CacheKind::Mutation => f.write_str("mutation"),
        }
    }
}

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(0);

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    /// A caller-chosen name.
    Named(String),
    /// A unique key that never collides with any other.
    Anonymous(u64),
}

impl StateKey {
    /// Create a named key.
    pub fn named(name: impl Into<String>) -> Self {
        StateKey::Named(name.into())
    }

    /// Create a fresh anonymous key.
    pub fn anonymous() -> Self {
        StateKey::Anonymous(NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<&str> for StateKey {
    fn from(name: &str) -> Self {
        StateKey::Named(name.to_string())
    }
}

impl From<String> for StateKey {
    fn from(name: String) -> Self {
        StateKey::Named(name)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Named(name) => f.write_str(name),
            StateKey::Anonymous(id) => write!(f, "#{id}"),
        }
    }
}

/// Staleness and eviction windows. `None` means never.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl {
    /// Age after which the entry is stale but still served.
    pub stale_after: Option<Duration>,
    /// Age after which an unpinned entry is evicted.
    pub evict_after: Option<Duration>,
}

impl Ttl {
    /// Create a TTL.
    pub fn new(stale_after: Option<Duration>, evict_after: Option<Duration>) -> Self {
        Self {
            stale_after,
            evict_after,
        }
    }

    /// Never stale, never evicted.
    pub fn forever() -> Self {
        Self::new(None, None)
    }

    /// Set the staleness window.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Set the eviction window.
    pub fn with_evict_after(mut self, evict_after: Duration) -> Self {
        self.evict_after = Some(evict_after);
        self
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self {
            stale_after: Some(Duration::from_secs(1)),
            evict_after: Some(Duration::from_secs(5 * 60)),
        }
    }
}

/// Freshness of an entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// No entry.
    Missing,
    /// Within the staleness window.
    Fresh,
    /// Past the staleness window, still served.
    Stale,
    /// Past the eviction window.
    Expired,
}

/// Cache change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// An entry was written.
    Set { kind: CacheKind, key: StateKey },
    /// An entry was removed explicitly.
    Invalidated { kind: CacheKind, key: StateKey },
    /// An expired entry was evicted.
    Evicted { kind: CacheKind, key: StateKey },
}

struct Entry {
    value: CachedValue,
    last_updated: Instant,
    ttl: Ttl,
}

impl Entry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_updated)
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.ttl.evict_after, Some(limit) if self.age(now) > limit)
    }

    fn is_stale(&self, now: Instant) -> bool {
        matches!(self.ttl.stale_after, Some(limit) if self.age(now) > limit)
    }

    fn freshness(&self, now: Instant) -> Freshness {
        if self.is_expired(now) {
            Freshness::Expired
        } else if self.is_stale(now) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

struct CacheInner {
    queries: Mutex<HashMap<StateKey, Entry>>,
    mutations: Mutex<HashMap<StateKey, Entry>>,
    registry: ActiveRegistry,
    events: broadcast::Sender<CacheEvent>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl CacheInner {
    fn map(&self, kind: CacheKind) -> &Mutex<HashMap<StateKey, Entry>> {
        match kind {
            CacheKind::Query => &self.queries,
            CacheKind::Mutation => &self.mutations,
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Time-aware cache for query and mutation state.
///
/// Cloning is cheap and shares the same entries. Lock order is always
/// entry map before registry.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl CacheManager {
    /// Create an empty cache with its own registry.
    pub fn new(event_capacity: usize) -> Self {
        Self::with_registry(ActiveRegistry::new(), event_capacity)
    }

    /// Create an empty cache sharing a registry.
    pub fn with_registry(registry: ActiveRegistry, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(CacheInner {
                queries: Mutex::new(HashMap::new()),
                mutations: Mutex::new(HashMap::new()),
                registry,
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Get the consumer registry.
    pub fn registry(&self) -> &ActiveRegistry {
        &self.inner.registry
    }

    /// Subscribe to cache changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Get an entry's value, type-erased.
    ///
    /// Expired entries are a miss unless pinned; an unpinned expired entry
    /// is scheduled for eviction.
    pub fn get_raw(&self, kind: CacheKind, key: &StateKey) -> Option<CachedValue> {
        let now = Instant::now();
        let value = {
            let map = self.inner.map(kind).lock();
            let entry = map.get(key)?;
            if entry.is_expired(now) && !self.inner.registry.is_pinned(kind, key) {
                None
            } else {
                Some(Arc::clone(&entry.value))
            }
        };

        if value.is_none() {
            self.schedule_eviction(kind, key.clone());
        }
        value
    }

    /// Get an entry's value as `T`.
    ///
    /// A value stored under a different type is a miss.
    pub fn get<T: Any + Send + Sync>(&self, kind: CacheKind, key: &StateKey) -> Option<Arc<T>> {
        let value = self.get_raw(kind, key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%kind, %key, "Cached value has a different type");
                None
            }
        }
    }

    /// Write a value, resetting its age.
    pub fn set<T: Any + Send + Sync>(&self, kind: CacheKind, key: &StateKey, value: T, ttl: Ttl) {
        self.set_raw(kind, key, Arc::new(value), ttl);
    }

    /// Write a type-erased value, resetting its age.
    pub fn set_raw(&self, kind: CacheKind, key: &StateKey, value: CachedValue, ttl: Ttl) {
        let entry = Entry {
            value,
            last_updated: Instant::now(),
            ttl,
        };
        self.inner.map(kind).lock().insert(key.clone(), entry);
        tracing::trace!(%kind, %key, "Cache entry set");
        self.inner.emit(CacheEvent::Set {
            kind,
            key: key.clone(),
        });
    }

    /// Freshness of an entry now.
    pub fn freshness(&self, kind: CacheKind, key: &StateKey) -> Freshness {
        let now = Instant::now();
        self.inner
            .map(kind)
            .lock()
            .get(key)
            .map(|entry| entry.freshness(now))
            .unwrap_or(Freshness::Missing)
    }

    /// Whether an entry should be refreshed. Only fresh entries are not.
    pub fn is_stale(&self, kind: CacheKind, key: &StateKey) -> bool {
        self.freshness(kind, key) != Freshness::Fresh
    }

    /// When an entry was last written.
    ///
    /// `None` when missing, or expired and unpinned.
    pub fn last_updated(&self, kind: CacheKind, key: &StateKey) -> Option<Instant> {
        let now = Instant::now();
        let map = self.inner.map(kind).lock();
        let entry = map.get(key)?;
        if entry.is_expired(now) && !self.inner.registry.is_pinned(kind, key) {
            return None;
        }
        Some(entry.last_updated)
    }

    /// Remove an entry now, pinned or not.
    pub fn invalidate(&self, kind: CacheKind, key: &StateKey) -> bool {
        let removed = self.inner.map(kind).lock().remove(key).is_some();
        if removed {
            tracing::debug!(%kind, %key, "Cache entry invalidated");
            self.inner.emit(CacheEvent::Invalidated {
                kind,
                key: key.clone(),
            });
        }
        removed
    }

    /// Whether an entry exists, in any state.
    pub fn contains(&self, kind: CacheKind, key: &StateKey) -> bool {
        self.inner.map(kind).lock().contains_key(key)
    }

    /// Number of entries, in any state.
    pub fn len(&self, kind: CacheKind) -> usize {
        self.inner.map(kind).lock().len()
    }

    /// Whether both caches are empty.
    pub fn is_empty(&self) -> bool {
        self.len(CacheKind::Query) == 0 && self.len(CacheKind::Mutation) == 0
    }

    /// Remove every unpinned, expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for kind in [CacheKind::Query, CacheKind::Mutation] {
            let mut map = self.inner.map(kind).lock();
            map.retain(|key, entry| {
                let keep = !entry.is_expired(now) || self.inner.registry.is_pinned(kind, key);
                if !keep {
                    evicted.push((kind, key.clone()));
                }
                keep
            });
        }

        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "Swept expired cache entries");
        }
        let count = evicted.len();
        for (kind, key) in evicted {
            self.inner.emit(CacheEvent::Evicted { kind, key });
        }
        count
    }

    /// Run `sweep` on a fixed interval until `shutdown`.
    ///
    /// Returns `false` if a sweeper is already running.
    pub fn start_sweeper(&self, interval: Duration) -> bool {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }

        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheManager { inner }.sweep();
            }
        });

        tracing::debug!(?interval, "Cache sweeper started");
        *sweeper = Some(handle.abort_handle());
        true
    }

    /// Whether the sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }

    /// Stop the sweeper. Entries are kept.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
            tracing::debug!("Cache sweeper stopped");
        }
    }

    fn schedule_eviction(&self, kind: CacheKind, key: StateKey) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                CacheManager { inner }.evict_if_expired(kind, &key);
            }
        });
    }

    fn evict_if_expired(&self, kind: CacheKind, key: &StateKey) -> bool {
        let now = Instant::now();
        let removed = {
            let mut map = self.inner.map(kind).lock();
            let expired = map
                .get(key)
                .map(|entry| entry.is_expired(now) && !self.inner.registry.is_pinned(kind, key))
                .unwrap_or(false);
            expired && map.remove(key).is_some()
        };

        if removed {
            tracing::trace!(%kind, %key, "Evicted expired entry");
            self.inner.emit(CacheEvent::Evicted {
                kind,
                key: key.clone(),
            });
        }
        removed
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("queries", &self.len(CacheKind::Query))
            .field("mutations", &self.len(CacheKind::Mutation))
            .field("sweeping", &self.is_sweeping())
            .finish()
    }
}
