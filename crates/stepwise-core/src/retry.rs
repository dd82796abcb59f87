//! Retry policy and timed capability invocation

use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::capability::{Capability, CapabilityError, InvocationContext};

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the retry following `retries_used` earlier retries.
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

/// What a retried invocation produced.
#[derive(Debug)]
pub(crate) struct InvocationOutcome {
    pub result: Result<Value, CapabilityError>,
    pub attempts: u32,
}

/// Invoke `capability` with a per-attempt timeout, retrying transient failures.
///
/// `make_ctx` builds the context for each 1-based attempt. `on_retry` is told
/// about every retry before its backoff sleep. Cancellation is checked before
/// each attempt and during backoff; an attempt already started runs until it
/// returns or times out.
pub(crate) async fn invoke_with_retry<C, R>(
    capability: &dyn Capability,
    args: &Value,
    timeout: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut make_ctx: C,
    mut on_retry: R,
) -> InvocationOutcome
where
    C: FnMut(u32) -> InvocationContext,
    R: FnMut(u32, &CapabilityError, Duration),
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return InvocationOutcome {
                result: Err(CapabilityError::Cancelled),
                attempts: attempt,
            };
        }
        attempt += 1;

        let ctx = make_ctx(attempt);
        let result = match tokio::time::timeout(timeout, capability.invoke(args.clone(), ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout(timeout)),
        };

        let error = match result {
            Ok(value) => {
                return InvocationOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(error) if error.is_transient() && attempt < policy.max_attempts => error,
            Err(error) => {
                return InvocationOutcome {
                    result: Err(error),
                    attempts: attempt,
                }
            }
        };

        let delay = policy.backoff(attempt - 1);
        on_retry(attempt + 1, &error, delay);
        tokio::select! {
            _ = cancel.cancelled() => {
                return InvocationOutcome {
                    result: Err(CapabilityError::Cancelled),
                    attempts: attempt,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
