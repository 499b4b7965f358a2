//! Cache freshness over time, with and without a mounted consumer.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use turbo_query::{CacheKind, Freshness, QueryContext, StateKey, Ttl};

use super::TimelineArgs;
use crate::context::Context;
use crate::output::{flag, format_millis};

/// Grace added past each threshold so the checkpoint lands after it.
const MARGIN_MS: u64 = 50;

#[derive(Serialize)]
struct Checkpoint {
    at_ms: u64,
    unpinned: Freshness,
    unpinned_served: bool,
    pinned: Freshness,
    pinned_served: bool,
}

/// Run the timeline command.
pub async fn run(args: TimelineArgs, ctx: &Context) -> Result<()> {
    if args.stale_ms >= args.evict_ms {
        bail!(
            "--stale-ms ({}) must be below --evict-ms ({})",
            args.stale_ms,
            args.evict_ms
        );
    }

    ctx.output.header("Cache timeline");

    let context = QueryContext::new(ctx.config.query.clone());
    let cache = context.cache();
    let ttl = Ttl::new(
        Some(Duration::from_millis(args.stale_ms)),
        Some(Duration::from_millis(args.evict_ms)),
    );
    let unpinned = StateKey::from("timeline.unpinned");
    let pinned = StateKey::from("timeline.pinned");

    cache.set(CacheKind::Query, &unpinned, "value", ttl);
    cache.set(CacheKind::Query, &pinned, "value", ttl);
    let _mounted = context.registry().mount(CacheKind::Query, &pinned);

    let mut checkpoints = Vec::new();
    let mut elapsed = 0;
    for at_ms in [0, args.stale_ms + MARGIN_MS, args.evict_ms + MARGIN_MS] {
        if at_ms > elapsed {
            let spinner = ctx.output.spinner(&format!("Waiting until {}...", format_millis(at_ms)));
            tokio::time::sleep(Duration::from_millis(at_ms - elapsed)).await;
            spinner.finish_and_clear();
            elapsed = at_ms;
        }

        // Freshness first: a missed read schedules eviction.
        let unpinned_freshness = cache.freshness(CacheKind::Query, &unpinned);
        let pinned_freshness = cache.freshness(CacheKind::Query, &pinned);
        checkpoints.push(Checkpoint {
            at_ms,
            unpinned: unpinned_freshness,
            unpinned_served: cache.get_raw(CacheKind::Query, &unpinned).is_some(),
            pinned: pinned_freshness,
            pinned_served: cache.get_raw(CacheKind::Query, &pinned).is_some(),
        });
    }
    context.shutdown();

    if ctx.output.is_json() {
        ctx.output.json(&checkpoints);
        return Ok(());
    }

    let widths = [10, 10, 8, 10, 8];
    ctx.output
        .table_row(&["elapsed", "unpinned", "served", "pinned", "served"], &widths);
    for checkpoint in &checkpoints {
        let elapsed = format_millis(checkpoint.at_ms);
        let unpinned = format!("{:?}", checkpoint.unpinned);
        let pinned = format!("{:?}", checkpoint.pinned);
        let unpinned_served = flag(checkpoint.unpinned_served);
        let pinned_served = flag(checkpoint.pinned_served);
        ctx.output.table_row(
            &[
                elapsed.as_str(),
                unpinned.as_str(),
                unpinned_served.as_str(),
                pinned.as_str(),
                pinned_served.as_str(),
            ],
            &widths,
        );
    }

    Ok(())
}
