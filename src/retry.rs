//! Retry-with-delay combinator for control-plane calls.
//!
//! The control plane is a separate daemon behind a local socket and goes
//! away transiently (restarts, busy). Every driver call is safe to wrap:
//! the combinator is stateless and only re-attempts errors the taxonomy
//! marks transient; anything else propagates on the first attempt, and the
//! final transient failure is returned unchanged so callers can match on
//! the original cause.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Attempt budget and inter-attempt delay for one wrapped operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Blocking delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// No retries: every error surfaces immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Run `operation`, re-attempting transient failures per `policy`.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Transient control plane failure, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VirtLabError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_failure_exhausts_budget_and_surfaces_unchanged() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(RetryPolicy::new(3, Duration::ZERO), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VirtLabError::Transient("daemon unreachable".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(VirtLabError::Transient(msg)) => assert_eq!(msg, "daemon unreachable"),
            other => panic!("expected the original transient error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(RetryPolicy::new(3, Duration::ZERO), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VirtLabError::Permanent("malformed request".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(VirtLabError::Permanent(_))));
    }

    #[tokio::test]
    async fn recovery_mid_budget_returns_the_value() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(5, Duration::ZERO), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VirtLabError::Transient("busy".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
