//! AND-combination of cancellation signals.

use futures::future::join_all;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// A signal that fires only once every member has fired.
///
/// Each member is a child of one input token, so detaching a member never
/// cancels the caller's own token.
#[derive(Debug)]
pub struct CombinedSignal {
    token: CancellationToken,
    members: Vec<CancellationToken>,
    watcher: Option<AbortHandle>,
}

/// Combine signals so the result fires only when all inputs have fired.
///
/// An empty input never fires.
pub fn combine(signals: &[CancellationToken]) -> CombinedSignal {
    let token = CancellationToken::new();
    let members: Vec<CancellationToken> = signals.iter().map(CancellationToken::child_token).collect();

    let mut combined = CombinedSignal {
        token,
        members,
        watcher: None,
    };

    if combined.members.is_empty() {
        return combined;
    }
    if combined.check() {
        return combined;
    }

    let waiting = combined.members.clone();
    let output = combined.token.clone();
    let handle = tokio::spawn(async move {
        join_all(waiting.iter().map(CancellationToken::cancelled)).await;
        output.cancel();
    });
    combined.watcher = Some(handle.abort_handle());
    combined
}

impl CombinedSignal {
    /// Get the combined token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the combined signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of combined inputs.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of inputs that have not fired or been detached.
    pub fn live(&self) -> usize {
        self.members.iter().filter(|m| !m.is_cancelled()).count()
    }

    /// Mark one input as no longer interested.
    ///
    /// Fires the combined signal if it was the last live input.
    pub fn detach(&self, index: usize) {
        if let Some(member) = self.members.get(index) {
            member.cancel();
            self.check();
        }
    }

    fn check(&self) -> bool {
        if !self.members.is_empty() && self.members.iter().all(CancellationToken::is_cancelled) {
            self.token.cancel();
            true
        } else {
            false
        }
    }
}

impl Drop for CombinedSignal {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
