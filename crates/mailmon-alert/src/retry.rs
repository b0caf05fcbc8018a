use crate::error::{AlertError, Result};
use mailmon_storage::{with_retry, StorageError};
use std::future::Future;

pub use mailmon_storage::RetryPolicy;

/// [`with_retry`] for the engine and remediator: exhausted attempts become
/// [`AlertError::Persistence`], which ends the current pass for that rule
/// or target.
pub async fn retry_persistence<T, F, Fut>(policy: RetryPolicy, what: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StorageError>>,
{
    with_retry(policy, what, op).await.map_err(|e| {
        AlertError::Persistence(format!(
            "{what} failed after {} attempts: {e}",
            policy.attempts.max(1)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn gives_up_with_persistence_error() {
        let calls = AtomicU32::new(0);
        let err = retry_persistence(fast(2), "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AlertError::Persistence(ref msg) if msg.starts_with("write failed after 2 attempts")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
