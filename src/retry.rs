//! Backoff helper for transient store failures.
//!
//! Exponential backoff starting at 150ms, doubling up to 1200ms, with up to
//! 50ms of random jitter to avoid a thundering herd of agents hammering a
//! recovering store.

use std::future::Future;
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

const INITIAL_DELAY_MS: u64 = 150;
const MAX_DELAY_MS: u64 = 1200;

pub const DEFAULT_ATTEMPTS: usize = 5;

/// Runs `op` until it succeeds, fails with a non-transient error, or
/// `attempts` runs out. The last error is returned as-is.
pub async fn retry_with_backoff<T, F, Fut>(label: &str, attempts: usize, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff_loop(label, attempts, op, CoordinatorError::is_transient).await
}

/// Like `retry_with_backoff`, for collaborator calls whose errors carry no
/// transient/permanent distinction. Every failure is retried.
pub async fn retry_collaborator<T, F, Fut>(
    label: &str,
    attempts: usize,
    op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    backoff_loop(label, attempts, op, |_| true).await
}

async fn backoff_loop<T, E, F, Fut>(
    label: &str,
    attempts: usize,
    mut op: F,
    should_retry: impl Fn(&E) -> bool,
) -> std::result::Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut delay_ms = INITIAL_DELAY_MS;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt + 1 < attempts => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}",
                    label,
                    attempt + 1,
                    attempts,
                    e
                );
                // Simple jitter to prevent thundering herd
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff("flaky", 3, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CoordinatorError::StoreUnavailable("down".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_logical_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff("logical", 5, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CoordinatorError::PoisonJob {
                    job_id: "job".to_string(),
                    attempts: 3,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(CoordinatorError::PoisonJob { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_transient_error() {
        let result: Result<()> = retry_with_backoff("always-down", 2, || async {
            Err(CoordinatorError::StoreUnavailable("still down".to_string()))
        })
        .await;

        match result {
            Err(CoordinatorError::StoreUnavailable(msg)) => assert_eq!(msg, "still down"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_collaborator_retry_gives_up_after_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: anyhow::Result<()> = retry_collaborator("sink", 2, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("sink offline"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
