//! Deferral window for batched flushes.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Runs a flush after the current unit of work.
pub trait FlushScheduler: Send + Sync + 'static {
    /// Schedule `flush` to run once the caller has yielded.
    fn schedule_flush(&self, flush: BoxFuture<'static, ()>);
}

impl<S: FlushScheduler + ?Sized> FlushScheduler for Arc<S> {
    fn schedule_flush(&self, flush: BoxFuture<'static, ()>) {
        (**self).schedule_flush(flush)
    }
}

/// Spawns the flush on the Tokio runtime after one yield.
///
/// On a current-thread runtime every call submitted in the same turn lands
/// in the same window. On a multi-thread runtime the window is best effort.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl FlushScheduler for TokioScheduler {
    fn schedule_flush(&self, flush: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            flush.await;
        });
    }
}

/// Holds flushes until a test steps them explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flushes waiting to run.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run every waiting flush to completion, returning how many ran.
    pub async fn run_pending(&self) -> usize {
        let flushes = std::mem::take(&mut *self.pending.lock());
        let count = flushes.len();
        for flush in flushes {
            flush.await;
        }
        count
    }
}

impl FlushScheduler for ManualScheduler {
    fn schedule_flush(&self, flush: BoxFuture<'static, ()>) {
        self.pending.lock().push(flush);
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_manual_scheduler_waits_for_step() {
        let scheduler = ManualScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        scheduler.schedule_flush(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.run_pending().await, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_pending().await, 0);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_after_yield() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        TokioScheduler.schedule_flush(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
