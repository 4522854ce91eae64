// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retry combinator for transient agent errors.
//!
//! A pure function over `(operation, RetryPolicy)`: transient failures are
//! retried with exponential backoff (2s, 4s, 8s by default, capped at 3
//! attempts); persistent failures propagate immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::AgentError;

/// Backoff policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier)
    }
}

/// Run `operation` retrying transient [`AgentError`]s per `policy`.
///
/// The backoff sleep is a suspension point: it races the cancellation token
/// and returns [`AgentError::Cancelled`] when the token fires first.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    mut operation: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient agent error, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                }
            }
            Err(err) if err.is_transient() => {
                return Err(AgentError::RetriesExhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let cancel = CancelToken::new();

        let result = retry_transient(fast_policy(), &cancel, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgentError::RateLimited("slow down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let cancel = CancelToken::new();

        let result: Result<(), _> = retry_transient(fast_policy(), &cancel, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Auth("bad key".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cap_yields_retries_exhausted() {
        let cancel = CancelToken::new();
        let result: Result<(), _> = retry_transient(fast_policy(), &cancel, || async {
            Err(AgentError::Network("reset".into()))
        })
        .await;

        match result {
            Err(AgentError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry_transient(fast_policy(), &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
