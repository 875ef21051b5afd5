use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Capped exponential backoff for transient infrastructure errors.
///
/// Only connection-level work goes through this: a job is never retried
/// automatically once it has been handed to a worker.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted, returning
    /// the last error in the latter case.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(target_service = what, attempt, error = %e, "Giving up");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        target_service = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000), 10);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(64), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = backoff
            .retry("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = backoff
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
