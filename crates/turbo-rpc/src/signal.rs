//! Caller-managed timeouts expressed as cancellation signals.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Create a signal that is cancelled after `after` elapses.
///
/// When a parent is given the returned signal is its child, so cancelling
/// the parent cancels it too; firing the deadline never cancels the parent.
/// Must be called from within a Tokio runtime.
pub fn timeout_signal(parent: Option<&CancellationToken>, after: Duration) -> CancellationToken {
    let token = parent
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    let deadline = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => {
                tracing::trace!(after_ms = after.as_millis() as u64, "call deadline elapsed");
                deadline.cancel();
            }
            _ = deadline.cancelled() => {}
        }
    });

    token
}
