//! Error types for the Slidegate crate.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::ContextError;
use crate::store::StoreError;

/// Main error type for Slidegate setup operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;

/// Error returned by a single gated dispatch.
///
/// `E` is the wrapped sender's error type. Sender failures are carried in
/// [`DispatchError::Sender`] untouched.
#[derive(Error, Debug)]
pub enum DispatchError<E> {
    /// The caller's context was canceled or expired.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The window is saturated and the gate is configured to reject.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The next opening falls after the caller's deadline.
    #[error("next opening at {opening} is past the deadline {deadline}")]
    WaitWouldExceedDeadline {
        opening: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },

    /// The counter store could not report the window count.
    #[error("datastore error: failed to get admission count")]
    CountQueryFailed(#[source] StoreError),

    /// The counter store could not record the admission.
    #[error("datastore error: failed to record admission")]
    CountIncrementFailed(#[source] StoreError),

    /// A convenience wrapper could not build the request.
    #[error("invalid request: {0}")]
    InvalidRequest(#[source] http::Error),

    /// The wrapped sender failed.
    #[error(transparent)]
    Sender(E),
}

impl<E> DispatchError<E> {
    /// True when the call was refused because the quota is saturated.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            DispatchError::RateLimitExceeded | DispatchError::WaitWouldExceedDeadline { .. }
        )
    }

    /// True when the limiter itself failed rather than the caller being limited.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DispatchError::CountQueryFailed(_) | DispatchError::CountIncrementFailed(_)
        )
    }
}
