//! Lazy fan-out of one stream into N independent replicas.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::{ready, FutureExt};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::{KeyedQueue, QueueCapacity, QueueId};

/// Why a consumer stopped reading its replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The consumer is done and has no interest in further items.
    Done,
    /// The consumer cancelled.
    Cancelled,
}

struct Shared<T, E> {
    queue: KeyedQueue<Result<T, E>>,
    source: Mutex<Option<BoxStream<'static, Result<T, E>>>>,
    started: AtomicBool,
    pump: Mutex<Option<AbortHandle>>,
}

impl<T, E> Shared<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Start pumping the source into every open queue, once.
    fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(source) = self.source.lock().take() else {
            return;
        };

        tracing::trace!(replicas = self.queue.open_count(), "Starting replicated stream");

        let mut pump = self.pump.lock();
        let handle = tokio::spawn(pump_source(Arc::clone(self), source));
        *pump = Some(handle.abort_handle());
    }
}

impl<T, E> Shared<T, E> {
    /// Stop the upstream source, started or not.
    fn terminate(&self) {
        self.started.store(true, Ordering::Release);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        // Dropping an unstarted source releases it without polling.
        drop(self.source.lock().take());
    }
}

async fn pump_source<T, E>(shared: Arc<Shared<T, E>>, mut source: BoxStream<'static, Result<T, E>>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    while let Some(item) = source.next().await {
        let ids = shared.queue.open_ids();
        if ids.is_empty() {
            break;
        }

        let failed = item.is_err();
        for id in ids {
            shared.queue.push(id, item.clone()).await;
        }

        if failed {
            break;
        }
    }

    shared.queue.close_all();
}

/// Split one stream into `count` independent replicas.
///
/// The source is not polled until some replica is first pulled. Every
/// replica that is still open receives every item in order, and the first
/// error ends all of them after delivery. Stopping a replica with
/// [`StopReason::Cancelled`] while it is the last open one terminates the
/// source; other stops only detach the stopping consumer.
///
/// `count == 0` returns no replicas and never touches the source.
pub fn replicate<S, T, E>(source: S, count: usize, capacity: QueueCapacity) -> Vec<Replica<T, E>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    if count == 0 {
        return Vec::new();
    }

    let shared = Arc::new(Shared {
        queue: KeyedQueue::new(capacity),
        source: Mutex::new(Some(source.boxed())),
        started: AtomicBool::new(false),
        pump: Mutex::new(None),
    });

    (0..count)
        .map(|_| Replica {
            id: shared.queue.open(),
            shared: Arc::clone(&shared),
            pending: None,
            finished: false,
            released: false,
        })
        .collect()
}

/// One consumer's view of a replicated stream.
///
/// Dropping a replica before it has ended counts as a cancellation.
pub struct Replica<T, E> {
    shared: Arc<Shared<T, E>>,
    id: QueueId,
    pending: Option<BoxFuture<'static, Option<Result<T, E>>>>,
    finished: bool,
    released: bool,
}

impl<T, E> Replica<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Get the queue id backing this replica.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Whether the replica has yielded its last item.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pull the next item.
    pub async fn pull(&mut self) -> Option<Result<T, E>> {
        self.next().await
    }

    /// Stop reading this replica.
    pub fn stop(mut self, reason: StopReason) {
        self.release(reason);
    }
}

impl<T, E> Replica<T, E> {
    fn release(&mut self, reason: StopReason) {
        if self.released {
            return;
        }
        self.released = true;
        self.pending = None;

        self.shared.queue.discard(self.id);
        if reason == StopReason::Cancelled && self.shared.queue.open_count() == 0 {
            self.shared.terminate();
            tracing::debug!(replica = %self.id, "Last replica cancelled, upstream terminated");
        }
    }
}

impl<T, E> Stream for Replica<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished || this.released {
            return Poll::Ready(None);
        }

        this.shared.start();

        let pending = this.pending.get_or_insert_with(|| {
            let shared = Arc::clone(&this.shared);
            let id = this.id;
            async move { shared.queue.pull(id).await }.boxed()
        });

        let item = ready!(pending.as_mut().poll(cx));
        this.pending = None;
        if item.is_none() {
            this.finished = true;
        }
        Poll::Ready(item)
    }
}

impl<T, E> Drop for Replica<T, E> {
    fn drop(&mut self) {
        let reason = if self.finished {
            StopReason::Done
        } else {
            StopReason::Cancelled
        };
        self.release(reason);
    }
}

impl<T, E> fmt::Debug for Replica<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
