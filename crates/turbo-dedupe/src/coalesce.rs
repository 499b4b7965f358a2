//! Window batching for plain async functions.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use turbo_rpc::RpcError;

use crate::{FlushScheduler, TokioScheduler};

type BoxedFn<A, R> = Box<dyn Fn(A) -> BoxFuture<'static, Result<R, RpcError>> + Send + Sync>;

struct Window<A, R> {
    args: Option<A>,
    waiters: Vec<oneshot::Sender<Result<R, RpcError>>>,
}

struct CoalescedInner<A, R> {
    func: BoxedFn<A, R>,
    window: Mutex<Window<A, R>>,
    scheduler: Arc<dyn FlushScheduler>,
}

/// An async function whose calls are batched per window.
///
/// Every invocation within one window shares the result of a single call
/// made with the first caller's arguments. Later arguments in the same
/// window are ignored.
pub struct Coalesced<A, R> {
    inner: Arc<CoalescedInner<A, R>>,
}

impl<A, R> Clone for Coalesced<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> Coalesced<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Wrap `func`, flushing through the Tokio scheduler.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        Self::with_scheduler(func, Arc::new(TokioScheduler))
    }

    /// Wrap `func` with an explicit scheduler.
    pub fn with_scheduler<F, Fut>(func: F, scheduler: Arc<dyn FlushScheduler>) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CoalescedInner {
                func: Box::new(move |args| -> BoxFuture<'static, Result<R, RpcError>> {
                    Box::pin(func(args))
                }),
                window: Mutex::new(Window {
                    args: None,
                    waiters: Vec::new(),
                }),
                scheduler,
            }),
        }
    }

    /// Invoke the function, joining the current window if one is open.
    pub async fn call(&self, args: A) -> Result<R, RpcError> {
        let (reply, receiver) = oneshot::channel();

        let opened = {
            let mut window = self.inner.window.lock();
            window.waiters.push(reply);
            if window.args.is_none() {
                window.args = Some(args);
                true
            } else {
                false
            }
        };

        if opened {
            let inner = Arc::clone(&self.inner);
            self.inner
                .scheduler
                .schedule_flush(Box::pin(async move { inner.flush().await }));
        }

        receiver.await.unwrap_or(Err(RpcError::Dropped))
    }
}

impl<A, R> CoalescedInner<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    async fn flush(self: Arc<Self>) {
        let (args, waiters) = {
            let mut window = self.window.lock();
            (window.args.take(), std::mem::take(&mut window.waiters))
        };
        let Some(args) = args else {
            return;
        };

        tracing::trace!(callers = waiters.len(), "Flushing coalesced function");
        let result = (self.func)(args).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
