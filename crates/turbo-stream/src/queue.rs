//! Per-consumer mailboxes keyed by an opaque id.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Opaque queue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Buffer depth of each queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueCapacity {
    /// No limit. A slow consumer never blocks the producer or other
    /// consumers; its backlog grows in memory instead.
    #[default]
    Unbounded,
    /// At most `n` buffered items per queue. A full queue makes the
    /// producer wait.
    Bounded(usize),
}

impl QueueCapacity {
    fn has_room(&self, len: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(max) => len < (*max).max(1),
        }
    }
}

struct Slot<T> {
    items: VecDeque<T>,
    closed: bool,
    ready: Arc<Notify>,
    space: Arc<Notify>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            closed: false,
            ready: Arc::new(Notify::new()),
            space: Arc::new(Notify::new()),
        }
    }
}

/// A set of mailboxes, one per consumer id.
///
/// Each id has a single consumer. The producer pushes into ids that are
/// open; the consumer pulls until the id is closed and drained.
pub struct KeyedQueue<T> {
    slots: Mutex<HashMap<QueueId, Slot<T>>>,
    next_id: AtomicU64,
    capacity: QueueCapacity,
}

impl<T> KeyedQueue<T> {
    /// Create an empty queue set.
    pub fn new(capacity: QueueCapacity) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    /// Get the configured capacity.
    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    /// Open a new mailbox.
    pub fn open(&self) -> QueueId {
        let id = QueueId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().insert(id, Slot::new());
        id
    }

    /// Push an item, waiting for room if the mailbox is full.
    ///
    /// Returns `false` if the id is closed, discarded or unknown.
    pub async fn push(&self, id: QueueId, item: T) -> bool {
        let mut item = Some(item);
        loop {
            let space = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(&id) else {
                    return false;
                };
                if slot.closed {
                    return false;
                }
                if self.capacity.has_room(slot.items.len()) {
                    if let Some(item) = item.take() {
                        slot.items.push_back(item);
                    }
                    slot.ready.notify_one();
                    return true;
                }
                Arc::clone(&slot.space)
            };
            space.notified().await;
        }
    }

    /// Pull the next item, waiting until one is pushed or the id is closed.
    ///
    /// Returns `None` once the id is closed and drained, or if it is unknown.
    pub async fn pull(&self, id: QueueId) -> Option<T> {
        loop {
            let ready = {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(&id)?;
                if let Some(item) = slot.items.pop_front() {
                    slot.space.notify_one();
                    return Some(item);
                }
                if slot.closed {
                    slots.remove(&id);
                    return None;
                }
                Arc::clone(&slot.ready)
            };
            ready.notified().await;
        }
    }

    /// Close a mailbox from the producer side.
    ///
    /// Buffered items remain available; the consumer sees the end after
    /// draining them.
    pub fn close(&self, id: QueueId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&id) {
            Some(slot) if !slot.closed => {
                slot.closed = true;
                slot.ready.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Close every mailbox from the producer side.
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            slot.closed = true;
            slot.ready.notify_one();
        }
    }

    /// Remove a mailbox from the consumer side, dropping buffered items.
    pub fn discard(&self, id: QueueId) -> bool {
        let removed = self.slots.lock().remove(&id);
        match removed {
            Some(slot) => {
                // A producer blocked on this slot must re-check and give up.
                slot.space.notify_one();
                true
            }
            None => false,
        }
    }

    /// Whether the id can still receive items.
    pub fn is_open(&self, id: QueueId) -> bool {
        self.slots
            .lock()
            .get(&id)
            .map(|slot| !slot.closed)
            .unwrap_or(false)
    }

    /// Ids that can still receive items, in opening order.
    pub fn open_ids(&self) -> Vec<QueueId> {
        let mut ids: Vec<QueueId> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| !slot.closed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of ids that can still receive items.
    pub fn open_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| !slot.closed)
            .count()
    }

    /// Number of items buffered for an id.
    pub fn buffered(&self, id: QueueId) -> usize {
        self.slots
            .lock()
            .get(&id)
            .map(|slot| slot.items.len())
            .unwrap_or(0)
    }
}

impl<T> fmt::Debug for KeyedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedQueue")
            .field("capacity", &self.capacity)
            .field("open", &self.open_count())
            .finish()
    }
}
