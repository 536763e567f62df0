//! Bounded, fixed-delay retry for backend calls.
//!
//! Every failure is treated as retriable until the attempt budget runs out;
//! callers decide what an exhausted [`RetryFailure`] means for their
//! operation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Attempt budget and pause between failed attempts for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, StoreError> {
        if max_attempts == 0 {
            return Err(StoreError::usage("retry policy needs at least one attempt"));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    /// Const constructor for budgets known to be valid.
    pub(crate) const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        assert!(max_attempts > 0);
        Self {
            max_attempts,
            delay,
        }
    }

    /// A single attempt with no delay.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

/// Detail of the last failure once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{context} failed after {attempts} attempt(s): {message}")]
pub struct RetryFailure {
    pub attempts: u32,
    pub context: String,
    pub message: String,
}

impl RetryFailure {
    /// Failure of an operation that is not retried (session-scoped writes).
    pub(crate) fn single(context: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            attempts: 1,
            context: context.into(),
            message: err.to_string(),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// `context` names the call site and ends up in logs and in the returned
/// [`RetryFailure`].
pub async fn execute<T, E, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let message = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(context, attempt, "Backend call recovered");
                }
                return Ok(value);
            }
            Err(e) => e.to_string(),
        };

        if attempt >= policy.max_attempts {
            tracing::error!(context, attempts = attempt, error = %message, "Retry budget exhausted");
            return Err(RetryFailure {
                attempts: attempt,
                context: context.to_string(),
                message,
            });
        }

        tracing::warn!(
            context,
            attempt,
            max_attempts = policy.max_attempts,
            error = %message,
            "Backend call failed, retrying"
        );
        if !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }
}
