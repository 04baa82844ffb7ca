//! Per-call cancellation and deadline handling.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a call context is no longer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus optional deadline supplied by the caller.
///
/// Cloning shares the same token, so canceling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<DateTime<Utc>>,
}

impl CallContext {
    /// A context that is never canceled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set a deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        match chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout))
        {
            Some(deadline) => self.with_deadline(deadline),
            // Too far out to represent; behaves as no deadline.
            None => self,
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The reason this context is done, or `None` while it is live.
    ///
    /// Cancellation is reported ahead of an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Utc::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is canceled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        let Some(deadline) = self.deadline else {
            self.token.cancelled().await;
            return ContextError::Canceled;
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => ContextError::Canceled,
            _ = tokio::time::sleep(until(deadline)) => ContextError::DeadlineExceeded,
        }
    }
}

/// Time remaining until `instant`, zero if it has already passed.
pub(crate) fn until(instant: DateTime<Utc>) -> std::time::Duration {
    (instant - Utc::now()).to_std().unwrap_or_default()
}
