use thiserror::Error;

use crate::identity::ResolveError;
use crate::retry::RetryableError;
use crate::retryable;
use crate::storage::StoreError;

/// Top-level failure taxonomy for the engine. Nothing here terminates a
/// conversation session; every variant degrades to "show what we have".
#[derive(Debug, Clone, Error)]
pub enum TimelineError {
    /// Storage error.
    ///
    /// Row or reaction read/write failed. May be retryable.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Identity resolution error.
    ///
    /// Batch profile resolution failed. Not retryable here; affected senders
    /// keep their fallback identity.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Superseded work.
    ///
    /// The conversation changed or the cursor moved while suspended; the
    /// result was discarded. Not an error condition. Not retryable.
    #[error("conversation is no longer active")]
    Cancelled,
}

impl TimelineError {
    /// Cancellation is distinguished so callers can absorb it silently.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl RetryableError for TimelineError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(s) => retryable!(s),
            Self::Resolve(_) => false,
            Self::Cancelled => false,
        }
    }
}
