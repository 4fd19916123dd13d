//! Cooperative cancellation for callers waiting on a worker

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

const DEFAULT_REASON: &str = "cancelled";

/// Cancellation handle carrying a reason
///
/// Clones share state: cancelling one clone cancels all of them. Only the
/// acquire/wait phase observes the signal; an operation already running on a
/// worker is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    /// Create a new, uncancelled signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a request-scoped child token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Cancel with a reason; the first reason wins
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cancellation reason, if cancelled
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        Some(
            self.reason
                .get()
                .cloned()
                .unwrap_or_else(|| DEFAULT_REASON.to_string()),
        )
    }

    /// Resolves with the reason once cancelled
    pub async fn cancelled(&self) -> String {
        self.token.cancelled().await;
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_REASON.to_string())
    }

    /// Underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
