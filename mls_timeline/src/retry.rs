//! A retry strategy that works with rusts native [`std::error::Error`] type.
//!
//! Wraps the contention-prone storage reads (reaction fetch). Only errors the
//! collaborator marks transient are retried; everything else fails on the
//! first attempt.

use std::time::Duration;

use smart_default::SmartDefault;

use crate::configuration::{MAX_REACTION_FETCH_ATTEMPTS, REACTION_RETRY_BACKOFF};

/// Specifies which errors are retryable.
/// All Errors are not retryable by-default.
pub trait RetryableError: std::error::Error {
    fn is_retryable(&self) -> bool;
}

/// Options to specify how to retry a function
#[derive(SmartDefault, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Retry {
    #[default(_code = "MAX_REACTION_FETCH_ATTEMPTS")]
    attempts: usize,
    #[default(_code = "REACTION_RETRY_BACKOFF")]
    backoff_unit: Duration,
}

impl Retry {
    /// Total attempts this is configured with, first try included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Linear backoff before the given retry (attempt x unit).
    pub fn backoff(&self, attempt: usize) -> Duration {
        self.backoff_unit * attempt as u32
    }
}

/// Builder for [`Retry`]
#[derive(Default, PartialEq, Eq, Copy, Clone)]
pub struct RetryBuilder {
    attempts: Option<usize>,
    backoff_unit: Option<Duration>,
}

impl RetryBuilder {
    /// Specify the number of attempts to allow
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Specify the backoff unit to wait before retrying again
    pub fn backoff_unit(mut self, backoff_unit: Duration) -> Self {
        self.backoff_unit = Some(backoff_unit);
        self
    }

    /// Build the Retry Strategy
    pub fn build(self) -> Retry {
        let mut retry = Retry::default();

        if let Some(attempts) = self.attempts {
            retry.attempts = attempts;
        }

        if let Some(backoff_unit) = self.backoff_unit {
            retry.backoff_unit = backoff_unit;
        }

        retry
    }
}

impl Retry {
    /// Get the builder for [`Retry`]
    pub fn builder() -> RetryBuilder {
        RetryBuilder::default()
    }
}

/// Retry an async operation, specifying the strategy with $retry.
///
/// The expression is polled again only while the error reports
/// [`RetryableError::is_retryable`], sleeping the linear backoff between
/// attempts.
#[macro_export]
macro_rules! retry_async {
    ($retry: expr, $code: tt) => {{
        #[allow(unused)]
        use $crate::retry::RetryableError;
        let mut attempts = 1;
        loop {
            #[allow(clippy::redundant_closure_call)]
            let res = $code.await;
            match res {
                Ok(v) => break Ok(v),
                Err(e) => {
                    if (&e).is_retryable() && attempts < $retry.attempts() {
                        tracing::info!(
                            "retrying function that failed with error=`{}`",
                            e.to_string()
                        );
                        $crate::time::sleep($retry.backoff(attempts)).await;
                        attempts += 1;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

#[macro_export]
macro_rules! retryable {
    ($error: ident) => {{
        #[allow(unused)]
        use $crate::retry::RetryableError;
        $error.is_retryable()
    }};
    ($error: expr) => {{
        use $crate::retry::RetryableError;
        $error.is_retryable()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum SomeError {
        #[error("this is a retryable error")]
        ARetryableError,
        #[error("Dont retry")]
        DontRetryThis,
    }

    impl RetryableError for SomeError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::ARetryableError)
        }
    }

    #[tokio::test]
    async fn it_retries_twice_and_succeeds() {
        let mut i = 0;
        let mut test_fn = || -> Result<(), SomeError> {
            if i == 2 {
                return Ok(());
            }
            i += 1;
            Err(SomeError::ARetryableError)
        };

        let retry = Retry::builder()
            .backoff_unit(Duration::from_millis(1))
            .build();
        retry_async!(retry, (async { test_fn() })).unwrap();
        assert_eq!(i, 2);
    }

    #[tokio::test]
    async fn it_fails_after_three_attempts() {
        let mut attempts = 0;
        let mut test_fn = || -> Result<(), SomeError> {
            attempts += 1;
            Err(SomeError::ARetryableError)
        };

        let retry = Retry::builder()
            .backoff_unit(Duration::from_millis(1))
            .build();
        let result: Result<(), SomeError> = retry_async!(retry, (async { test_fn() }));

        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn it_only_runs_non_retryable_once() {
        let mut attempts = 0;
        let mut test_fn = || -> Result<(), SomeError> {
            attempts += 1;
            Err(SomeError::DontRetryThis)
        };

        let _r: Result<(), SomeError> = retry_async!(Retry::default(), (async { test_fn() }));

        assert_eq!(attempts, 1);
    }

    #[test]
    fn linear_backoff() {
        let retry = Retry::builder()
            .backoff_unit(Duration::from_millis(100))
            .build();

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
    }
}
