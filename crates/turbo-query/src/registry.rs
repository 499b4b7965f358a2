//! Reference-counted registry of mounted consumers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{CacheKind, StateKey};

/// Tracks which cache entries have mounted consumers.
///
/// Pins are per cache kind: pinning a query key leaves a mutation entry of
/// the same name unprotected. A pinned entry is never evicted, even when
/// expired.
#[derive(Debug, Clone, Default)]
pub struct ActiveRegistry {
    counts: Arc<Mutex<HashMap<(CacheKind, StateKey), usize>>>,
}

impl ActiveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer, returning the new count.
    pub fn pin(&self, kind: CacheKind, key: &StateKey) -> usize {
        let mut counts = self.counts.lock();
        let count = counts.entry((kind, key.clone())).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove a consumer, returning the remaining count.
    pub fn unpin(&self, kind: CacheKind, key: &StateKey) -> usize {
        let mut counts = self.counts.lock();
        let slot = (kind, key.clone());
        match counts.get_mut(&slot) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(&slot);
                0
            }
            None => 0,
        }
    }

    /// Whether any consumer holds the entry.
    pub fn is_pinned(&self, kind: CacheKind, key: &StateKey) -> bool {
        self.count(kind, key) > 0
    }

    /// Number of consumers holding the entry.
    pub fn count(&self, kind: CacheKind, key: &StateKey) -> usize {
        self.counts
            .lock()
            .get(&(kind, key.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Entries with at least one consumer.
    pub fn active_keys(&self) -> Vec<(CacheKind, StateKey)> {
        self.counts.lock().keys().cloned().collect()
    }

    /// Pin an entry for as long as the returned guard lives.
    pub fn mount(&self, kind: CacheKind, key: &StateKey) -> PinGuard {
        self.pin(kind, key);
        PinGuard {
            registry: self.clone(),
            kind,
            key: key.clone(),
        }
    }
}

/// Unpins its entry when dropped.
#[derive(Debug)]
pub struct PinGuard {
    registry: ActiveRegistry,
    kind: CacheKind,
    key: StateKey,
}

impl PinGuard {
    /// The pinned key.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// The cache the pin applies to.
    pub fn kind(&self) -> CacheKind {
        self.kind
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.unpin(self.kind, &self.key);
    }
}
