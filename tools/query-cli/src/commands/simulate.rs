//! Concurrent views over a coalescing link and the query cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use turbo_dedupe::{DedupeGroup, DedupeLink, DedupeStats};
use turbo_query::{QueryClient, QueryContext, QueryOptions};
use turbo_rpc::{Call, CallContext, FnTransport, Payload, Response, RpcClient, Transport};

use super::{ListItems, SimulateArgs};
use crate::context::Context;
use crate::output::{flag, format_millis};

#[derive(Serialize)]
struct SimulateReport {
    started_at: String,
    views: usize,
    distinct_views: usize,
    upstream_calls: usize,
    identical_views_share_response: bool,
    elapsed_ms: u64,
    link: DedupeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheReport>,
}

#[derive(Serialize)]
struct CacheReport {
    queries: usize,
    fetched: usize,
    served_from_cache: usize,
    upstream_calls: usize,
}

/// Run the simulate command.
pub async fn run(args: SimulateArgs, ctx: &Context) -> Result<()> {
    let settings = &ctx.config.simulate;
    let views = args.views.unwrap_or(settings.views);
    let distinct = args.distinct.unwrap_or(settings.distinct_views);
    let latency = Duration::from_millis(args.latency_ms.unwrap_or(settings.latency_ms));

    ctx.output.header("Simulating concurrent views");

    let calls = Arc::new(AtomicUsize::new(0));
    let rpc = coalescing_client(ctx, Arc::clone(&calls), latency);
    let inputs = view_inputs(views, distinct);

    let started_at = Utc::now().to_rfc3339();
    let started = Instant::now();
    let spinner = ctx.output.spinner("Waiting for views...");
    let payloads: Vec<Payload> = join_all(inputs.iter().map(|input| rpc.open::<ListItems>(input)))
        .await
        .into_iter()
        .map(|response| response.and_then(Response::into_value))
        .collect::<Result<_, _>>()
        .context("A view failed")?;
    spinner.finish_and_clear();

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let upstream_calls = calls.load(Ordering::SeqCst);
    let shared = payloads[..views.min(payloads.len())]
        .windows(2)
        .all(|pair| Arc::ptr_eq(&pair[0], &pair[1]));

    let cache = if args.no_cache {
        None
    } else {
        Some(run_cache_phase(ctx, &rpc, &inputs, &calls).await?)
    };

    let report = SimulateReport {
        started_at,
        views,
        distinct_views: distinct,
        upstream_calls,
        identical_views_share_response: shared,
        elapsed_ms,
        link: rpc.transport().stats(),
        cache,
    };

    if ctx.output.is_json() {
        ctx.output.json(&report);
        return Ok(());
    }

    ctx.output.kv("Requests", &inputs.len().to_string());
    ctx.output.kv("Upstream calls", &report.upstream_calls.to_string());
    ctx.output.kv("Coalesced waiters", &report.link.coalesced_waiters.to_string());
    ctx.output.kv("Identical views share response", &flag(shared));
    ctx.output.kv("Elapsed", &format_millis(elapsed_ms));

    if let Some(cache) = &report.cache {
        ctx.output.header("Query cache");
        ctx.output.kv("Queries", &cache.queries.to_string());
        ctx.output.kv("Fetched", &cache.fetched.to_string());
        ctx.output.kv("Served from cache", &cache.served_from_cache.to_string());
        ctx.output.kv("Upstream calls", &cache.upstream_calls.to_string());
    }

    ctx.output.success("Simulation complete");
    Ok(())
}

/// Mount one query per view, fetch twice, and count what reached upstream.
async fn run_cache_phase<T: Transport + 'static>(
    ctx: &Context,
    rpc: &RpcClient<T>,
    inputs: &[Option<u32>],
    calls: &AtomicUsize,
) -> Result<CacheReport> {
    let client = QueryClient::new(rpc.clone(), QueryContext::new(ctx.config.query.clone()));
    let before = calls.load(Ordering::SeqCst);

    let queries = inputs
        .iter()
        .map(|input| client.query::<ListItems>(*input, QueryOptions::new()))
        .collect::<Result<Vec<_>, _>>()?;
    let _mounted: Vec<_> = queries.iter().map(|query| query.mount()).collect();

    let mut fetched = 0;
    let mut served_from_cache = 0;
    for _ in 0..2 {
        let results = join_all(queries.iter().map(|query| query.fetch_if_needed())).await;
        for ran in results {
            if ran? {
                fetched += 1;
            } else {
                served_from_cache += 1;
            }
        }
    }

    client.context().shutdown();
    Ok(CacheReport {
        queries: queries.len(),
        fetched,
        served_from_cache,
        upstream_calls: calls.load(Ordering::SeqCst) - before,
    })
}

fn coalescing_client(
    ctx: &Context,
    calls: Arc<AtomicUsize>,
    latency: Duration,
) -> RpcClient<DedupeLink<impl Transport + 'static>> {
    let transport = FnTransport::new(move |call: Call, _ctx: CallContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(latency).await;
            tracing::debug!(url = %call.url, "Upstream call served");
            Ok(Response::value(json!({
                "url": call.url,
                "items": ["alpha", "beta", "gamma"],
            })))
        }
    });

    let link = DedupeLink::builder(transport)
        .with_config(&ctx.config.dedupe)
        .with_group(DedupeGroup::all("views"))
        .build();
    RpcClient::new(link, ctx.config.simulate.base_url.clone())
}

/// `views` identical inputs followed by `distinct` different pages.
fn view_inputs(views: usize, distinct: usize) -> Vec<Option<u32>> {
    std::iter::repeat(None)
        .take(views)
        .chain((1..=distinct as u32).map(Some))
        .collect()
}
