use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;

use crate::telemetry::metrics::API_RETRY_COUNT;

/// Bounded retries with exponential backoff and up to 25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Sleep before retrying after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    pub async fn run<T, F, Fut>(&self, target: &str, op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_while(target, op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but an error for which `retryable` is false
    /// is returned at once.
    pub async fn run_while<T, F, Fut, R>(
        &self,
        target: &str,
        mut op: F,
        retryable: R,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        R: Fn(&anyhow::Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => {
                    tracing::warn!(target = target, error = %err, "Call failed, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        target = target,
                        error = %err,
                        "Call failed"
                    );
                    last_err = Some(err);

                    if attempt < max_attempts - 1 {
                        API_RETRY_COUNT.add(1, &[KeyValue::new("target", target.to_string())]);
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("all retries exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1250));
        let third = policy.delay_for(2);
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(5));
        let capped = policy.delay_for(10);
        assert!(capped >= Duration::from_secs(10) && capped <= Duration::from_millis(12500));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast()
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("503 service unavailable")
                }
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: anyhow::Result<()> = fast()
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("connection refused")
            })
            .await;
        assert!(result.unwrap_err().to_string().contains("connection refused"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: anyhow::Result<()> = fast()
            .run_while(
                "test",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("404 not found")
                },
                |err| !err.to_string().starts_with("404"),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
    }
}
