//! Live state fed by server streams.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use turbo_rpc::RpcError;

use crate::{CachedValue, StateKey};

/// Prefix for named live keys.
pub const LIVE_PREFIX: &str = "LIVE";

/// Process-local keyed state without TTL.
#[derive(Clone, Default)]
pub struct LiveStore {
    slots: Arc<Mutex<HashMap<StateKey, CachedValue>>>,
}

impl LiveStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key from a prefix and optional name.
    ///
    /// Without a name the key is anonymous and private to its handle.
    pub fn key(prefix: &str, name: Option<&str>) -> StateKey {
        match name {
            Some(name) => StateKey::Named(format!("{prefix}_{name}")),
            None => StateKey::anonymous(),
        }
    }

    /// Get a value as `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &StateKey) -> Option<Arc<T>> {
        let value = self.slots.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Write a value.
    pub fn set<T: Any + Send + Sync>(&self, key: &StateKey, value: T) {
        self.slots.lock().insert(key.clone(), Arc::new(value));
    }

    /// Write a value if the key is empty. Returns whether it was written.
    pub fn set_if_absent<T: Any + Send + Sync>(&self, key: &StateKey, value: T) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            return false;
        }
        slots.insert(key.clone(), Arc::new(value));
        true
    }

    /// Update a value in place from its current state.
    pub fn update<T, F>(&self, key: &StateKey, f: F)
    where
        T: Any + Send + Sync,
        F: FnOnce(Option<&T>) -> T,
    {
        let mut slots = self.slots.lock();
        let current = slots.get(key).and_then(|v| v.downcast_ref::<T>());
        let next = f(current);
        slots.insert(key.clone(), Arc::new(next));
    }

    /// Remove a value.
    pub fn remove(&self, key: &StateKey) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// Whether a key holds a value.
    pub fn contains(&self, key: &StateKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl fmt::Debug for LiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStore").field("len", &self.len()).finish()
    }
}

struct Run {
    task: AbortHandle,
    // Closed when the task ends or is aborted.
    alive: watch::Receiver<()>,
}

/// Background iteration shared by live handles.
#[derive(Default)]
struct Driver {
    run: Mutex<Option<Run>>,
    error: Arc<Mutex<Option<RpcError>>>,
}

impl Driver {
    fn spawn<S, T, F>(&self, key: StateKey, mut stream: S, mut apply: F)
    where
        S: Stream<Item = Result<T, RpcError>> + Send + Unpin + 'static,
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.stop();
        *self.error.lock() = None;

        let error = Arc::clone(&self.error);
        let (alive_tx, alive) = watch::channel(());
        let handle = tokio::spawn(async move {
            let _alive = alive_tx;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => apply(value),
                    Err(e) => {
                        tracing::debug!(%key, error = %e, "Live stream ended with error");
                        *error.lock() = Some(e);
                        return;
                    }
                }
            }
            tracing::trace!(%key, "Live stream completed");
        });
        *self.run.lock() = Some(Run {
            task: handle.abort_handle(),
            alive,
        });
    }

    fn stop(&self) {
        if let Some(run) = self.run.lock().take() {
            run.task.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map(|run| run.alive.has_changed().is_ok())
            .unwrap_or(false)
    }

    async fn wait(&self) {
        let alive = self.run.lock().as_ref().map(|run| run.alive.clone());
        if let Some(mut alive) = alive {
            while alive.changed().await.is_ok() {}
        }
    }

    fn error(&self) -> Option<RpcError> {
        self.error.lock().clone()
    }
}

/// The latest item of a stream.
///
/// Stopping or dropping the handle drops the stream.
pub struct Live<T> {
    key: StateKey,
    store: LiveStore,
    driver: Driver,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Live<T> {
    /// Create a handle. Named handles share state with other handles of the
    /// same name.
    pub fn new(store: &LiveStore, name: Option<&str>) -> Self {
        Self {
            key: LiveStore::key(LIVE_PREFIX, name),
            store: store.clone(),
            driver: Driver::default(),
            _marker: PhantomData,
        }
    }

    /// Seed the state if it is empty.
    pub fn with_initial(self, value: T) -> Self {
        self.store.set_if_absent(&self.key, value);
        self
    }

    /// The state key.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// The latest value.
    pub fn current(&self) -> Option<Arc<T>> {
        self.store.get::<T>(&self.key)
    }

    /// Overwrite the value, or clear it with `None`.
    pub fn set_current(&self, value: Option<T>) {
        match value {
            Some(value) => self.store.set(&self.key, value),
            None => {
                self.store.remove(&self.key);
            }
        }
    }

    /// Start feeding the state from `stream`, replacing any running stream.
    pub fn start<S>(&self, stream: S)
    where
        S: Stream<Item = Result<T, RpcError>> + Send + 'static,
    {
        let store = self.store.clone();
        let key = self.key.clone();
        self.driver
            .spawn(self.key.clone(), stream.boxed(), move |value| store.set(&key, value));
    }

    /// Stop iterating and drop the stream.
    pub fn stop(&self) {
        self.driver.stop();
    }

    /// Whether a stream is being iterated.
    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }

    /// Wait until the current stream ends or is stopped.
    pub async fn wait(&self) {
        self.driver.wait().await;
    }

    /// The error that ended the last stream, if any.
    pub fn error(&self) -> Option<RpcError> {
        self.driver.error()
    }
}

impl<T> Drop for Live<T> {
    fn drop(&mut self) {
        self.driver.stop();
        release(&self.store, &self.key);
    }
}

impl<T> fmt::Debug for Live<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Live").field("key", &self.key).finish()
    }
}

/// A stream item for array-valued live state.
///
/// Arrays replace the state; single items are appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiveItem<T> {
    /// Replace the whole array.
    Many(Vec<T>),
    /// Append one item.
    One(T),
}

/// Array-valued state fed by a stream.
pub struct LiveArray<T> {
    key: StateKey,
    store: LiveStore,
    driver: Driver,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> LiveArray<T> {
    /// Create a handle, seeded with an empty array.
    pub fn new(store: &LiveStore, name: Option<&str>) -> Self {
        let key = LiveStore::key(LIVE_PREFIX, name);
        store.set_if_absent(&key, Vec::<T>::new());
        Self {
            key,
            store: store.clone(),
            driver: Driver::default(),
            _marker: PhantomData,
        }
    }

    /// The state key.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// The current items.
    pub fn current(&self) -> Arc<Vec<T>> {
        self.store.get::<Vec<T>>(&self.key).unwrap_or_default()
    }

    /// Overwrite the items.
    pub fn set_current(&self, items: Vec<T>) {
        self.store.set(&self.key, items);
    }

    /// Apply one stream item.
    pub fn apply(&self, item: LiveItem<T>) {
        apply_item(&self.store, &self.key, item);
    }

    /// Start feeding the state from `stream`, replacing any running stream.
    pub fn start<S>(&self, stream: S)
    where
        S: Stream<Item = Result<LiveItem<T>, RpcError>> + Send + 'static,
    {
        let store = self.store.clone();
        let key = self.key.clone();
        self.driver.spawn(self.key.clone(), stream.boxed(), move |item| {
            apply_item(&store, &key, item)
        });
    }

    /// Stop iterating and drop the stream.
    pub fn stop(&self) {
        self.driver.stop();
    }

    /// Whether a stream is being iterated.
    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }

    /// Wait until the current stream ends or is stopped.
    pub async fn wait(&self) {
        self.driver.wait().await;
    }

    /// The error that ended the last stream, if any.
    pub fn error(&self) -> Option<RpcError> {
        self.driver.error()
    }
}

/// Anonymous slots are reachable only through their handle.
fn release(store: &LiveStore, key: &StateKey) {
    if matches!(key, StateKey::Anonymous(_)) {
        store.remove(key);
    }
}

fn apply_item<T: Clone + Send + Sync + 'static>(store: &LiveStore, key: &StateKey, item: LiveItem<T>) {
    match item {
        LiveItem::Many(items) => store.set(key, items),
        LiveItem::One(item) => store.update::<Vec<T>, _>(key, |current| {
            let mut items = current.cloned().unwrap_or_default();
            items.push(item);
            items
        }),
    }
}

impl<T> Drop for LiveArray<T> {
    fn drop(&mut self) {
        self.driver.stop();
        release(&self.store, &self.key);
    }
}

impl<T> fmt::Debug for LiveArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveArray").field("key", &self.key).finish()
    }
}
