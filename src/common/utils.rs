//! Utility functions for tsmeta

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_err = None;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| crate::Error::Internal("max retries exceeded".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timestamp_monotone_enough() {
        let a = timestamp_now_millis();
        let b = timestamp_now_millis();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(crate::Error::Network("flaky".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            },
            3,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_fatal() {
        let attempts = AtomicUsize::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(crate::Error::Fatal("bad".into())) }
            },
            3,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let result: crate::Result<()> = retry_with_backoff(
            || async { Err(crate::Error::Network("down".into())) },
            2,
            std::time::Duration::from_millis(1),
        )
        .await;
        match result {
            Err(crate::Error::Network(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
