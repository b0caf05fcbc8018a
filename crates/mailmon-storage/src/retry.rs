//! Bounded retry for durable-store writes.

use crate::error::StorageError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Runs `op` up to `policy.attempts` times (at least once), sleeping
/// `backoff * 2^attempt` between tries. Returns the last error once the
/// attempts are used up.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        tracing::warn!(
            operation = what,
            attempt,
            max_attempts = attempts,
            error = %err,
            "Persistence write failed"
        );
        if attempt >= attempts {
            return Err(err);
        }
        tokio::time::sleep(policy.backoff * 2u32.pow(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = with_retry(fast(3), "write", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Unavailable("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let err = with_retry(fast(0), "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
