//! Fan one stream out to several consumers.

use anyhow::Result;
use futures::future::join_all;
use futures::stream;
use serde::Serialize;
use turbo_rpc::RpcError;
use turbo_stream::{replicate, QueueCapacity, Replica, StopReason};

use super::ReplicateArgs;
use crate::context::Context;

#[derive(Debug, Serialize)]
struct ReplicaReport {
    replica: String,
    items: Vec<u64>,
    stopped_early: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the replicate command.
pub async fn run(args: ReplicateArgs, ctx: &Context) -> Result<()> {
    let capacity = args
        .capacity
        .map(QueueCapacity::Bounded)
        .unwrap_or_else(|| ctx.config.dedupe.capacity());

    ctx.output.header("Replicating a stream");

    let source = stream::iter((1..=args.items).map(Ok::<u64, RpcError>));
    let replicas = replicate(source, args.replicas, capacity);

    let tasks = replicas.into_iter().enumerate().map(|(index, replica)| {
        let limit = if index == 0 { args.stop_after } else { None };
        tokio::spawn(consume(replica, limit))
    });
    let reports = join_all(tasks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    if ctx.output.is_json() {
        ctx.output.json(&reports);
        return Ok(());
    }

    for report in &reports {
        let items: Vec<String> = report.items.iter().map(u64::to_string).collect();
        let mut line = format!("[{}]", items.join(", "));
        if report.stopped_early {
            line.push_str(" (stopped)");
        }
        ctx.output.kv(&report.replica, &line);
        if let Some(error) = &report.error {
            ctx.output.warn(&format!("{}: {}", report.replica, error));
        }
    }

    ctx.output.success(&format!(
        "{} replicas of {} items ({:?})",
        reports.len(),
        args.items,
        capacity
    ));
    Ok(())
}

async fn consume(mut replica: Replica<u64, RpcError>, limit: Option<usize>) -> ReplicaReport {
    let name = replica.id().to_string();
    let mut items = Vec::new();
    let mut error = None;

    while let Some(item) = replica.pull().await {
        match item {
            Ok(value) => items.push(value),
            Err(e) => {
                error = Some(e.to_string());
                break;
            }
        }

        if limit.is_some_and(|limit| items.len() >= limit) {
            tracing::debug!(replica = %name, items = items.len(), "Stopping replica early");
            replica.stop(StopReason::Cancelled);
            return ReplicaReport {
                replica: name,
                items,
                stopped_early: true,
                error,
            };
        }
    }

    ReplicaReport {
        replica: name,
        items,
        stopped_early: false,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_early_stop_leaves_other_consumers_complete() {
        let source = stream::iter((1..=4).map(Ok::<u64, RpcError>));
        let mut replicas = replicate(source, 2, QueueCapacity::Unbounded).into_iter();
        let (first, second) = (replicas.next().unwrap(), replicas.next().unwrap());

        let (first, second) = tokio::join!(consume(first, Some(2)), consume(second, None));

        assert_eq!(first.items, vec![1, 2]);
        assert!(first.stopped_early);
        assert_eq!(second.items, vec![1, 2, 3, 4]);
        assert!(!second.stopped_early);
    }
}
