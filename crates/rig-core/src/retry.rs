use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::SessionError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed { delay_ms: u64 },
    /// `min(base_ms * 2^attempt, cap_ms)`, attempt counted from zero.
    Exponential { base_ms: u64, cap_ms: u64 },
}

/// Bounded retry policy for a single session operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1).
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms },
        }
    }

    pub fn exponential(max_attempts: u32, base_ms: u64, cap_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base_ms, cap_ms },
        }
    }

    pub fn none() -> Self {
        Self::fixed(1, 0)
    }

    /// Delay to wait after the failed attempt with the given zero-based index.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, cap_ms } => {
                let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, 200, 2_000)
    }
}

/// Tagged result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// A non-transient error ended the loop early.
    Fatal { error: SessionError, attempts: u32 },
    /// Every attempt failed with a transient error.
    Exhausted { last: SessionError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Fatal { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Collapses the outcome into a session result, wrapping exhaustion.
    pub fn into_result(self, operation: &'static str) -> Result<T, SessionError> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Fatal { error, .. } => Err(error),
            RetryOutcome::Exhausted { last, attempts } => Err(SessionError::Exhausted {
                operation,
                attempts,
                last: Box::new(last),
            }),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent. `on_retry` sees every transient failure
/// that will be followed by another attempt.
pub async fn retry<T, F, Fut, R>(policy: &RetryPolicy, mut op: F, mut on_retry: R) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
    R: FnMut(u32, &SessionError),
{
    let max = policy.attempts();
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt + 1,
                }
            }
            Err(error) if !error.is_transient() => {
                return RetryOutcome::Fatal {
                    error,
                    attempts: attempt + 1,
                }
            }
            Err(error) => {
                if attempt + 1 >= max {
                    return RetryOutcome::Exhausted {
                        last: error,
                        attempts: attempt + 1,
                    };
                }
                on_retry(attempt, &error);
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after {error}");
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
