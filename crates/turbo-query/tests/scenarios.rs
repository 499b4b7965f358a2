//! End-to-end scenarios: typed procedures over a coalescing link, feeding
//! the query cache and live handles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{ready, Ready};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use turbo_dedupe::{DedupeGroup, DedupeLink};
use turbo_query::{
    BackoffStrategy, Live, QueryClient, QueryContext, QueryOptions, RetryPolicy, StateKey, Ttl,
};
use turbo_rpc::{Call, CallContext, FnTransport, Method, Payload, Procedure, Response, RpcClient, RpcError};

struct ListItems;

impl Procedure for ListItems {
    type Input = Option<u32>;
    type Output = Value;
    const PATH: &'static str = "item.list";
    const METHOD: Method = Method::Get;
}

struct WatchTicks;

impl Procedure for WatchTicks {
    type Input = ();
    type Output = u64;
    const PATH: &'static str = "tick.watch";
    const METHOD: Method = Method::Get;
}

fn counting<H>(
    calls: &Arc<AtomicUsize>,
    handler: H,
) -> FnTransport<impl Fn(Call, CallContext) -> Ready<Result<Response, RpcError>> + Send + Sync>
where
    H: Fn(Call) -> Ready<Result<Response, RpcError>> + Send + Sync + 'static,
{
    let calls = Arc::clone(calls);
    FnTransport::new(move |call: Call, _ctx: CallContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        handler(call)
    })
}

fn coalescing_client<T: turbo_rpc::Transport + 'static>(transport: T) -> RpcClient<DedupeLink<T>> {
    let link = DedupeLink::builder(transport)
        .with_group(DedupeGroup::all("reads"))
        .build();
    RpcClient::new(link, "http://api/rpc")
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Emits 1..=count, then hangs until dropped.
fn ticks(count: u64, dropped: Arc<AtomicBool>) -> impl Stream<Item = Result<Payload, RpcError>> + Send {
    stream::unfold((0u64, DropFlag(dropped)), move |(n, flag)| async move {
        if n >= count {
            futures::future::pending::<()>().await;
        }
        Some((Ok(Arc::new(json!(n + 1))), (n + 1, flag)))
    })
}

// === Coalescing Scenarios ===

#[tokio::test]
async fn test_three_views_plus_one_make_two_upstream_calls() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = counting(
        &calls,
        |call: Call| ready(Ok(Response::value(json!({ "url": call.url })))),
    );
    let client = coalescing_client(transport);

    let (a, b, c, d) = tokio::join!(
        client.open::<ListItems>(&None),
        client.open::<ListItems>(&None),
        client.open::<ListItems>(&None),
        client.open::<ListItems>(&Some(2)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let a = a.unwrap().into_value().unwrap();
    let b = b.unwrap().into_value().unwrap();
    let c = c.unwrap().into_value().unwrap();
    let d = d.unwrap().into_value().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert!(!Arc::ptr_eq(&a, &d));
    assert_eq!(a["url"], json!("http://api/rpc/item/list"));
    assert_eq!(d["url"], json!("http://api/rpc/item/list?data=2"));

    let stats = client.transport().stats();
    assert_eq!(stats.upstream_calls, 2);
    assert_eq!(stats.coalesced_waiters, 2);
}

#[tokio::test]
async fn test_concurrent_queries_share_upstream_call_and_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = counting(&calls, |_call: Call| ready(Ok(Response::value(json!(["a", "b"])))));
    let client = QueryClient::new(coalescing_client(transport), QueryContext::default());

    let first = client.query::<ListItems>(None, QueryOptions::new()).unwrap();
    let second = client.query::<ListItems>(None, QueryOptions::new()).unwrap();
    let third = client.query::<ListItems>(None, QueryOptions::new()).unwrap();

    let (a, b, c) = tokio::join!(first.fetch_if_needed(), second.fetch_if_needed(), third.fetch_if_needed());

    assert_eq!((a, b, c), (Ok(true), Ok(true), Ok(true)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.key(), &StateKey::from("item.list"));
    assert_eq!(third.value().as_deref(), Some(&json!(["a", "b"])));
}

// === Cache Scenarios ===

#[tokio::test(start_paused = true)]
async fn test_staleness_timeline_with_and_without_pin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = counting(&calls, |_call: Call| ready(Ok(Response::value(json!(1)))));
    let client = QueryClient::new(coalescing_client(transport), QueryContext::default());
    let ttl = Ttl::new(Some(Duration::from_millis(100)), Some(Duration::from_millis(1000)));

    let pinned = client
        .query::<ListItems>(Some(1), QueryOptions::new().with_ttl(ttl))
        .unwrap();
    let unpinned = client
        .query::<ListItems>(Some(2), QueryOptions::new().with_ttl(ttl))
        .unwrap();
    let _mounted = pinned.mount();

    pinned.refetch().await.unwrap();
    unpinned.refetch().await.unwrap();
    assert!(!pinned.is_stale());
    assert!(!unpinned.is_stale());

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(unpinned.is_stale());
    assert_eq!(unpinned.value().as_deref(), Some(&json!(1)));

    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_eq!(unpinned.value(), None);
    assert_eq!(pinned.value().as_deref(), Some(&json!(1)));

    settle().await;
    let cache = client.context().cache();
    assert!(!cache.contains(turbo_query::CacheKind::Query, unpinned.key()));
    assert!(cache.contains(turbo_query::CacheKind::Query, pinned.key()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_through_link() {
    let calls = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let transport = counting(
        &calls,
        move |_call: Call| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ready(Err(RpcError::Http {
                    status: 503,
                    message: "unavailable".into(),
                }))
            } else {
                ready(Ok(Response::value(json!("ok"))))
            }
        },
    );
    let client = QueryClient::new(coalescing_client(transport), QueryContext::default());
    let retry = RetryPolicy::new(2).with_backoff(BackoffStrategy::Fixed(Duration::from_millis(500)));

    let query = client
        .query::<ListItems>(None, QueryOptions::new().with_retry(retry))
        .unwrap();
    query.refetch().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.value().as_deref(), Some(&json!("ok")));
    assert!(query.error().is_none());
}

// === Live Scenarios ===

#[tokio::test]
async fn test_live_handles_share_stream_until_all_stop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    let transport = counting(
        &calls,
        move |_call: Call| ready(Ok(Response::stream(ticks(3, Arc::clone(&flag))))),
    );
    let client = QueryClient::new(coalescing_client(transport), QueryContext::default());

    let (a, b, c) = tokio::join!(
        client.live::<WatchTicks>(&(), None),
        client.live::<WatchTicks>(&(), None),
        client.live::<WatchTicks>(&(), None),
    );
    let (a, b, c): (Live<u64>, Live<u64>, Live<u64>) = (a.unwrap(), b.unwrap(), c.unwrap());
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for live in [&a, &b, &c] {
        assert_eq!(live.current().as_deref(), Some(&3));
        assert!(live.is_running());
    }

    drop(a);
    b.stop();
    settle().await;
    assert!(!dropped.load(Ordering::SeqCst));
    assert!(c.is_running());

    drop(c);
    settle().await;
    assert!(dropped.load(Ordering::SeqCst));
}
