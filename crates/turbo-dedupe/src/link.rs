//! Coalescing transport link.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use turbo_rpc::{Call, CallContext, CallKey, Method, Response, ResponseStream, RpcError, Transport};
use turbo_stream::{replicate, QueueCapacity};

use crate::{combine, CombinedSignal, DedupeConfig, FlushScheduler, TokioScheduler};

type CallPredicate = Box<dyn Fn(&Call) -> bool + Send + Sync>;

/// A caller-defined partition of coalescable calls.
///
/// Groups are tried in declaration order; the first whose condition matches
/// owns the call. Its context replaces the caller's for the upstream call.
pub struct DedupeGroup {
    name: String,
    condition: CallPredicate,
    context: CallContext,
}

impl DedupeGroup {
    /// Create a group selecting calls with `condition`.
    pub fn new<F>(name: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&Call) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            context: CallContext::for_group(name.clone()),
            name,
            condition: Box::new(condition),
        }
    }

    /// Create a group that matches every call.
    pub fn all(name: impl Into<String>) -> Self {
        Self::new(name, |_| true)
    }

    /// Set the context handed to the transport.
    pub fn with_context(mut self, mut context: CallContext) -> Self {
        if context.group.is_none() {
            context.group = Some(self.name.clone());
        }
        self.context = context;
        self
    }

    /// Get the group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the transport context.
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Check whether the group owns a call.
    pub fn matches(&self, call: &Call) -> bool {
        (self.condition)(call)
    }
}

impl fmt::Debug for DedupeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupeGroup")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish()
    }
}

/// Coalescing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeStats {
    /// Upstream calls issued for coalesced batches.
    pub upstream_calls: u64,
    /// Waiters served by another waiter's upstream call.
    pub coalesced_waiters: u64,
    /// Calls passed straight through.
    pub bypassed: u64,
    /// Waiters that cancelled before their result arrived.
    pub cancelled_waiters: u64,
}

#[derive(Default)]
struct StatsCounters {
    upstream_calls: AtomicU64,
    coalesced_waiters: AtomicU64,
    bypassed: AtomicU64,
    cancelled_waiters: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> DedupeStats {
        DedupeStats {
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            coalesced_waiters: self.coalesced_waiters.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            cancelled_waiters: self.cancelled_waiters.load(Ordering::Relaxed),
        }
    }
}

struct Waiter {
    signal: CancellationToken,
    reply: oneshot::Sender<Result<Response, RpcError>>,
}

impl Waiter {
    fn is_gone(&self) -> bool {
        self.signal.is_cancelled() || self.reply.is_closed()
    }
}

/// One waiter's share of the upstream signal, released on drop.
struct Interest {
    combined: Arc<CombinedSignal>,
    index: usize,
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.combined.detach(self.index);
    }
}

/// Ends a delivered stream once its waiter cancels.
///
/// The inner stream (a replica or the source) is dropped at that point and
/// the waiter's interest in the upstream call is released.
fn guard_stream(inner: ResponseStream, signal: CancellationToken, interest: Interest) -> ResponseStream {
    stream::unfold(Some((inner, signal, interest)), |state| async move {
        let (mut inner, signal, interest) = state?;
        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                tracing::trace!(waiter = interest.index, "Waiter cancelled delivered stream");
                None
            }
            item = inner.next() => item.map(|item| (item, Some((inner, signal, interest)))),
        }
    })
    .boxed()
}

struct PendingEntry {
    call: Call,
    key: CallKey,
    waiters: Vec<Waiter>,
}

struct PendingState {
    batches: Vec<Vec<PendingEntry>>,
    flush_scheduled: bool,
}

struct LinkInner<T> {
    transport: T,
    groups: Vec<DedupeGroup>,
    filter: CallPredicate,
    scheduler: Arc<dyn FlushScheduler>,
    capacity: QueueCapacity,
    pending: Mutex<PendingState>,
    stats: StatsCounters,
}

/// Builder for [`DedupeLink`].
pub struct DedupeLinkBuilder<T> {
    transport: T,
    groups: Vec<DedupeGroup>,
    filter: CallPredicate,
    scheduler: Arc<dyn FlushScheduler>,
    capacity: QueueCapacity,
}

impl<T: Transport + 'static> DedupeLinkBuilder<T> {
    /// Add a group. Groups match in the order they are added.
    pub fn with_group(mut self, group: DedupeGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Replace the coalescing filter (default: GET only).
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Call) -> bool + Send + Sync + 'static,
    {
        self.filter = Box::new(filter);
        self
    }

    /// Replace the flush scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn FlushScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the per-replica buffer depth for fanned-out streams.
    pub fn with_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Apply a configuration.
    pub fn with_config(self, config: &DedupeConfig) -> Self {
        let builder = self.with_capacity(config.capacity());
        if config.filter_get_only {
            builder.with_filter(is_get)
        } else {
            builder.with_filter(|_| true)
        }
    }

    /// Build the link.
    pub fn build(self) -> DedupeLink<T> {
        let batches = self.groups.iter().map(|_| Vec::new()).collect();
        DedupeLink {
            inner: Arc::new(LinkInner {
                transport: self.transport,
                groups: self.groups,
                filter: self.filter,
                scheduler: self.scheduler,
                capacity: self.capacity,
                pending: Mutex::new(PendingState {
                    batches,
                    flush_scheduled: false,
                }),
                stats: StatsCounters::default(),
            }),
        }
    }
}

fn is_get(call: &Call) -> bool {
    call.method == Method::Get
}

/// A transport that coalesces equivalent calls made in the same window.
///
/// Calls are batched per group until the scheduler runs a flush. Each
/// distinct call in a batch reaches the inner transport once; its outcome is
/// shared by every waiter. Streams are replicated so each waiter reads and
/// cancels independently.
pub struct DedupeLink<T> {
    inner: Arc<LinkInner<T>>,
}

impl<T> Clone for DedupeLink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> DedupeLink<T> {
    /// Start building a link in front of `transport`.
    pub fn builder(transport: T) -> DedupeLinkBuilder<T> {
        DedupeLinkBuilder {
            transport,
            groups: Vec::new(),
            filter: Box::new(is_get),
            scheduler: Arc::new(TokioScheduler),
            capacity: QueueCapacity::Unbounded,
        }
    }

    /// Get the inner transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Get the configured groups.
    pub fn groups(&self) -> &[DedupeGroup] {
        &self.inner.groups
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> DedupeStats {
        self.inner.stats.snapshot()
    }

    /// Number of calls waiting for the next flush.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().batches.iter().map(Vec::len).sum()
    }

    /// Submit a call, coalescing it with equivalent calls in the same window.
    pub async fn submit(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError> {
        let Some((group, key)) = self.inner.route(&call) else {
            self.inner.stats.bypassed.fetch_add(1, Ordering::Relaxed);
            return self.inner.transport.call(call, ctx).await;
        };

        if call.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let signal = call
            .signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        // Dropping this future before a reply detaches the waiter.
        let detach = signal.clone().drop_guard();

        let (reply, receiver) = oneshot::channel();
        let waiter = Waiter {
            signal: signal.clone(),
            reply,
        };

        let schedule = {
            let mut pending = self.inner.pending.lock();
            let batch = &mut pending.batches[group];
            match batch.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.waiters.push(waiter),
                None => batch.push(PendingEntry {
                    call,
                    key,
                    waiters: vec![waiter],
                }),
            }
            !std::mem::replace(&mut pending.flush_scheduled, true)
        };

        if schedule {
            let inner = Arc::clone(&self.inner);
            self.inner
                .scheduler
                .schedule_flush(Box::pin(async move { inner.flush().await }));
        }

        let outcome = tokio::select! {
            biased;
            reply = receiver => reply.unwrap_or(Err(RpcError::Dropped)),
            _ = signal.cancelled() => {
                self.inner.stats.cancelled_waiters.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Waiter cancelled before result");
                Err(RpcError::Cancelled)
            }
        };
        // A delivered stream keeps watching the signal.
        detach.disarm();
        outcome
    }
}

impl<T: Transport + 'static> LinkInner<T> {
    fn route(&self, call: &Call) -> Option<(usize, CallKey)> {
        if !(self.filter)(call) {
            return None;
        }
        let group = self.groups.iter().position(|g| g.matches(call))?;
        let key = call.key()?;
        Some((group, key))
    }

    async fn flush(self: Arc<Self>) {
        let drained: Vec<Vec<PendingEntry>> = {
            let mut pending = self.pending.lock();
            pending.flush_scheduled = false;
            pending.batches.iter_mut().map(std::mem::take).collect()
        };

        let executions = drained
            .into_iter()
            .enumerate()
            .flat_map(|(group, batch)| batch.into_iter().map(move |entry| (group, entry)))
            .map(|(group, entry)| self.execute(group, entry));

        join_all(executions).await;
    }

    async fn execute(&self, group: usize, entry: PendingEntry) {
        let PendingEntry {
            mut call,
            key,
            waiters,
        } = entry;
        let group = &self.groups[group];

        let waiters: Vec<Waiter> = waiters.into_iter().filter(|w| !w.is_gone()).collect();
        if waiters.is_empty() {
            tracing::trace!(group = %group.name, key = %key, "Every waiter left before flush");
            return;
        }

        let signals: Vec<CancellationToken> = waiters.iter().map(|w| w.signal.clone()).collect();
        let combined = combine(&signals);
        call.signal = Some(combined.token());

        self.stats.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .coalesced_waiters
            .fetch_add(waiters.len() as u64 - 1, Ordering::Relaxed);
        tracing::debug!(
            group = %group.name,
            method = %call.method,
            url = %call.url,
            waiters = waiters.len(),
            "Dispatching coalesced call"
        );

        let result = self.transport.call(call, group.context.clone()).await;
        self.deliver(result, waiters, combined);
    }

    fn deliver(&self, result: Result<Response, RpcError>, waiters: Vec<Waiter>, combined: CombinedSignal) {
        match result {
            Ok(Response::Value(payload)) => {
                for waiter in waiters {
                    let _ = waiter.reply.send(Ok(Response::Value(Arc::clone(&payload))));
                }
            }
            Ok(Response::Stream(stream)) if waiters.len() == 1 => {
                if let Some(waiter) = waiters.into_iter().next() {
                    let interest = Interest {
                        combined: Arc::new(combined),
                        index: 0,
                    };
                    let stream = guard_stream(stream, waiter.signal.clone(), interest);
                    let _ = waiter.reply.send(Ok(Response::Stream(stream)));
                }
            }
            Ok(Response::Stream(stream)) => {
                let replicas = replicate(stream, waiters.len(), self.capacity);
                if replicas.len() != waiters.len() {
                    debug_assert_eq!(replicas.len(), waiters.len(), "replica count mismatch");
                    let error = RpcError::ReplicationMismatch {
                        expected: waiters.len(),
                        actual: replicas.len(),
                    };
                    tracing::error!(%error, "Stream fan-out failed");
                    for waiter in waiters {
                        let _ = waiter.reply.send(Err(error.clone()));
                    }
                    return;
                }

                tracing::trace!(replicas = replicas.len(), "Fanning out stream");
                let combined = Arc::new(combined);
                for (index, (waiter, replica)) in waiters.into_iter().zip(replicas).enumerate() {
                    let interest = Interest {
                        combined: Arc::clone(&combined),
                        index,
                    };
                    let stream = guard_stream(replica.boxed(), waiter.signal.clone(), interest);
                    let _ = waiter.reply.send(Ok(Response::Stream(stream)));
                }
            }
            Err(error) => {
                tracing::debug!(%error, waiters = waiters.len(), "Coalesced call failed");
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(error.clone()));
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for DedupeLink<T> {
    async fn call(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError> {
        self.submit(call, ctx).await
    }
}

impl<T> fmt::Debug for DedupeLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupeLink")
            .field("groups", &self.inner.groups)
            .field("capacity", &self.inner.capacity)
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualScheduler;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use turbo_rpc::FnTransport;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_transport(
        calls: Arc<AtomicUsize>,
    ) -> FnTransport<impl Fn(Call, CallContext) -> futures::future::Ready<Result<Response, RpcError>> + Send + Sync>
    {
        FnTransport::new(move |call: Call, ctx: CallContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(Response::value(json!({
                "url": call.url,
                "group": ctx.group,
            }))))
        })
    }

    /// Ticks every 10ms until the upstream signal fires; keeps that signal.
    fn ticking_transport(
        upstream: Arc<Mutex<Option<CancellationToken>>>,
    ) -> FnTransport<impl Fn(Call, CallContext) -> futures::future::Ready<Result<Response, RpcError>> + Send + Sync>
    {
        FnTransport::new(move |call: Call, _ctx: CallContext| {
            let signal = call.signal.unwrap_or_default();
            *upstream.lock() = Some(signal.clone());
            let ticks = futures::stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some((Ok(Arc::new(json!(n))), n + 1))
            });
            futures::future::ready(Ok(Response::stream(ticks.take_until(signal.cancelled_owned()))))
        })
    }

    fn upstream_cancelled(upstream: &Mutex<Option<CancellationToken>>) -> bool {
        upstream.lock().as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    // === Coalescing Tests ===

    #[tokio::test]
    async fn test_equivalent_calls_share_one_upstream_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .build();

        let (a, b, c) = tokio::join!(
            link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
            link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
            link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let a = a.unwrap().into_value().unwrap();
        let b = b.unwrap().into_value().unwrap();
        let c = c.unwrap().into_value().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(a["group"], json!("reads"));

        let stats = link.stats();
        assert_eq!(stats.upstream_calls, 1);
        assert_eq!(stats.coalesced_waiters, 2);
    }

    #[tokio::test]
    async fn test_header_difference_is_not_coalesced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .build();

        let (a, b) = tokio::join!(
            link.submit(Call::get("/items").header("x-tenant", "a"), CallContext::new()),
            link.submit(Call::get("/items").header("x-tenant", "b"), CallContext::new()),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_separate_windows_are_not_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .build();

        link.submit(Call::get("/items"), CallContext::new()).await.unwrap();
        link.submit(Call::get("/items"), CallContext::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_manual_scheduler_defines_the_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new(ManualScheduler::new());
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .with_scheduler(scheduler.clone())
            .build();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let link = link.clone();
                tokio::spawn(async move { link.submit(Call::get("/items"), CallContext::new()).await })
            })
            .collect();
        settle().await;

        assert_eq!(link.pending_calls(), 1);
        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        scheduler.run_pending().await;
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // === Routing Tests ===

    #[tokio::test]
    async fn test_default_filter_bypasses_non_get() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("all"))
            .build();

        let (a, b) = tokio::join!(
            link.submit(Call::post("/items").json(json!({"a": 1})), CallContext::new()),
            link.submit(Call::post("/items").json(json!({"a": 1})), CallContext::new()),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(link.stats().bypassed, 2);
    }

    #[tokio::test]
    async fn test_opaque_body_and_unmatched_calls_bypass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_filter(|_| true)
            .with_group(DedupeGroup::new("planets", |call: &Call| call.url.contains("planet")))
            .build();

        let (a, b, c, d) = tokio::join!(
            link.submit(Call::post("/planet/upload").binary(vec![1]), CallContext::new()),
            link.submit(Call::post("/planet/upload").binary(vec![1]), CallContext::new()),
            link.submit(Call::get("/moons"), CallContext::new()),
            link.submit(Call::get("/moons"), CallContext::new()),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(link.stats().bypassed, 4);
    }

    #[tokio::test]
    async fn test_first_matching_group_wins() {
        let link = DedupeLink::builder(counting_transport(Arc::new(AtomicUsize::new(0))))
            .with_group(DedupeGroup::new("planets", |call: &Call| call.url.starts_with("/planet")))
            .with_group(
                DedupeGroup::all("fallback").with_context(CallContext::new().with_attribute("tier", "low")),
            )
            .build();

        let planet = link
            .submit(Call::get("/planet/list"), CallContext::new())
            .await
            .unwrap()
            .into_value()
            .unwrap();
        let other = link
            .submit(Call::get("/moon/list"), CallContext::new())
            .await
            .unwrap()
            .into_value()
            .unwrap();

        assert_eq!(planet["group"], json!("planets"));
        assert_eq!(other["group"], json!("fallback"));
        assert_eq!(link.groups()[1].context().attribute("tier"), Some("low"));
    }

    // === Outcome Tests ===

    #[tokio::test]
    async fn test_error_reaches_every_waiter() {
        let transport = FnTransport::new(|_call: Call, _ctx: CallContext| async {
            Err::<Response, _>(RpcError::Http {
                status: 503,
                message: "unavailable".into(),
            })
        });
        let link = DedupeLink::builder(transport)
            .with_group(DedupeGroup::all("reads"))
            .build();

        let (a, b) = tokio::join!(
            link.submit(Call::get("/items"), CallContext::new()),
            link.submit(Call::get("/items"), CallContext::new()),
        );

        let expected = RpcError::Http {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
    }

    #[tokio::test]
    async fn test_stream_is_replicated_per_waiter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport = FnTransport::new(move |_call: Call, _ctx: CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Response::stream(futures::stream::iter(
                    (1..=3).map(|n| Ok(Arc::new(json!(n)))),
                )))
            }
        });
        let link = DedupeLink::builder(transport)
            .with_group(DedupeGroup::all("live"))
            .build();

        let (a, b, c) = tokio::join!(
            link.submit(Call::get("/timer/live"), CallContext::new()),
            link.submit(Call::get("/timer/live"), CallContext::new()),
            link.submit(Call::get("/timer/live"), CallContext::new()),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for response in [a, b, c] {
            let items: Vec<_> = response
                .unwrap()
                .into_stream()
                .map(|item| item.unwrap().as_i64().unwrap())
                .collect()
                .await;
            assert_eq!(items, vec![1, 2, 3]);
        }
    }

    // === Cancellation Tests ===

    #[tokio::test]
    async fn test_upstream_cancelled_only_when_all_waiters_cancel() {
        let upstream_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&upstream_cancelled);
        let transport = FnTransport::new(move |call: Call, _ctx: CallContext| {
            let flag = Arc::clone(&flag);
            async move {
                if let Some(signal) = call.signal {
                    signal.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                }
                Err::<Response, _>(RpcError::Cancelled)
            }
        });
        let link = DedupeLink::builder(transport)
            .with_group(DedupeGroup::all("reads"))
            .build();

        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        let handles: Vec<_> = tokens
            .iter()
            .map(|token| {
                let link = link.clone();
                let call = Call::get("/slow").with_signal(token.clone());
                tokio::spawn(async move { link.submit(call, CallContext::new()).await })
            })
            .collect();
        settle().await;

        tokens[0].cancel();
        tokens[1].cancel();
        settle().await;
        assert!(!upstream_cancelled.load(Ordering::SeqCst));
        assert!(!tokens[2].is_cancelled());

        tokens[2].cancel();
        settle().await;
        assert!(upstream_cancelled.load(Ordering::SeqCst));

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap_err(), RpcError::Cancelled);
        }
        assert!(link.stats().cancelled_waiters >= 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_detaches() {
        let upstream_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&upstream_cancelled);
        let transport = FnTransport::new(move |call: Call, _ctx: CallContext| {
            let flag = Arc::clone(&flag);
            async move {
                if let Some(signal) = call.signal {
                    signal.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                }
                Err::<Response, _>(RpcError::Cancelled)
            }
        });
        let link = DedupeLink::builder(transport)
            .with_group(DedupeGroup::all("reads"))
            .build();

        let spawn = |link: DedupeLink<_>| {
            tokio::spawn(async move { link.submit(Call::get("/slow"), CallContext::new()).await })
        };
        let first = spawn(link.clone());
        let second = spawn(link.clone());
        settle().await;

        first.abort();
        settle().await;
        assert!(!upstream_cancelled.load(Ordering::SeqCst));

        second.abort();
        settle().await;
        assert!(upstream_cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_delivered_stream_ends_it_and_upstream() {
        let upstream = Arc::new(Mutex::new(None));
        let link = DedupeLink::builder(ticking_transport(Arc::clone(&upstream)))
            .with_group(DedupeGroup::all("live"))
            .build();

        let token = CancellationToken::new();
        let mut ticks = link
            .submit(Call::get("/timer/live").with_signal(token.clone()), CallContext::new())
            .await
            .unwrap()
            .into_stream();

        assert_eq!(ticks.next().await.unwrap().unwrap(), Arc::new(json!(0)));
        assert!(!upstream_cancelled(&upstream));

        token.cancel();
        assert!(ticks.next().await.is_none());
        assert!(upstream_cancelled(&upstream));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_waiter_cancel_keeps_other_replica_running() {
        let upstream = Arc::new(Mutex::new(None));
        let link = DedupeLink::builder(ticking_transport(Arc::clone(&upstream)))
            .with_group(DedupeGroup::all("live"))
            .build();

        let (first_token, second_token) = (CancellationToken::new(), CancellationToken::new());
        let (first, second) = tokio::join!(
            link.submit(Call::get("/timer/live").with_signal(first_token.clone()), CallContext::new()),
            link.submit(Call::get("/timer/live").with_signal(second_token.clone()), CallContext::new()),
        );
        assert_eq!(link.stats().upstream_calls, 1);
        let (mut first, mut second) = (first.unwrap().into_stream(), second.unwrap().into_stream());

        assert_eq!(first.next().await.unwrap().unwrap(), Arc::new(json!(0)));
        assert_eq!(second.next().await.unwrap().unwrap(), Arc::new(json!(0)));

        first_token.cancel();
        assert!(first.next().await.is_none());
        settle().await;
        assert!(!upstream_cancelled(&upstream));
        assert!(!second_token.is_cancelled());
        assert_eq!(second.next().await.unwrap().unwrap(), Arc::new(json!(1)));

        second_token.cancel();
        assert!(second.next().await.is_none());
        settle().await;
        assert!(upstream_cancelled(&upstream));
    }

    #[tokio::test]
    async fn test_everyone_gone_before_flush_skips_upstream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new(ManualScheduler::new());
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .with_scheduler(scheduler.clone())
            .build();

        let token = CancellationToken::new();
        let call = Call::get("/items").with_signal(token.clone());
        let task = {
            let link = link.clone();
            tokio::spawn(async move { link.submit(call, CallContext::new()).await })
        };
        settle().await;

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), RpcError::Cancelled);

        scheduler.run_pending().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_call_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let link = DedupeLink::builder(counting_transport(Arc::clone(&calls)))
            .with_group(DedupeGroup::all("reads"))
            .build();

        let token = CancellationToken::new();
        token.cancel();
        let result = link
            .submit(Call::get("/items").with_signal(token), CallContext::new())
            .await;

        assert_eq!(result.unwrap_err(), RpcError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
