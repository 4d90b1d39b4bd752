//! Retry helper for operations that may legitimately need several attempts,
//! such as traffic checks while a freshly programmed chain converges.
//!
//! Remote control-plane calls are never routed through here; a failed or
//! timed out create/update/delete propagates straight to the caller.

use anyhow::{Result, anyhow};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry with exponential backoff and a little jitter
pub async fn retry_async<F, Fut, T, E>(
    operation: F,
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f32,
    operation_name: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("'{}' succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(err) => {
                warn!(
                    "'{}' failed on attempt {}/{}: {}",
                    operation_name, attempt, max_attempts, err
                );
                last_error = Some(err);

                if attempt < max_attempts {
                    let jitter = delay.mul_f32(fastrand::f32() * 0.1);
                    debug!("Retrying '{}' in {:?}", operation_name, delay + jitter);
                    tokio::time::sleep(delay + jitter).await;
                    delay = delay.mul_f32(backoff_multiplier.max(1.0));
                }
            }
        }
    }

    error!("'{}' failed after {} attempts", operation_name, max_attempts);
    let err = match last_error {
        Some(err) => anyhow::Error::from(err),
        None => anyhow!("'{}' was never attempted", operation_name),
    };
    Err(err.context(format!("'{}' failed after {} attempts", operation_name, max_attempts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<()> = retry_async(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::other("unreachable"))
                }
            },
            3,
            Duration::from_millis(1),
            2.0,
            "ping",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(format!("{err:#}").contains("unreachable"));
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_async(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(7)
                }
            },
            0,
            Duration::from_millis(1),
            2.0,
            "once",
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
