//! Retry with exponential backoff for optimistic store writes.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Configuration for retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Creates a RetryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `FISCSEQ_RETRY_MAX_ATTEMPTS`: Total attempts (default: 5)
    /// - `FISCSEQ_RETRY_BASE_MS`: Initial backoff delay in ms (default: 100)
    /// - `FISCSEQ_RETRY_MAX_MS`: Maximum backoff delay in ms (default: 5000)
    /// - `FISCSEQ_RETRY_JITTER`: `true`/`1` to randomize delays (default: false)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_attempts: std::env::var("FISCSEQ_RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(default.max_attempts),
            base_delay_ms: std::env::var("FISCSEQ_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.base_delay_ms),
            max_delay_ms: std::env::var("FISCSEQ_RETRY_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_delay_ms),
            jitter: std::env::var("FISCSEQ_RETRY_JITTER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default.jitter),
        }
    }

    /// Delay before attempt `k` (1-based retry index): `base * 2^(k-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_before(&self, k: u32) -> Duration {
        let factor = 2u64.saturating_pow(k.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Creates an exponential backoff builder matching `delay_before`.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1));
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// configured attempts are used up. The last error is returned as-is.
pub async fn with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    context: &str,
    op: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: FnMut(&E) -> bool,
{
    op.retry(config.backoff())
        .when(is_retryable)
        .notify(|err: &E, dur: Duration| {
            tracing::warn!(
                context = %context,
                error = %err,
                retry_in = ?dur,
                "operation conflicted, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 5_000);
        assert!(!config.jitter);
    }

    #[test]
    fn test_delay_schedule_doubles() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_before(1), Duration::from_millis(100));
        assert_eq!(config.delay_before(2), Duration::from_millis(200));
        assert_eq!(config.delay_before(3), Duration::from_millis(400));
        assert_eq!(config.delay_before(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_before(10), Duration::from_millis(5_000));
        assert_eq!(config.delay_before(200), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), String> = with_backoff(
            &fast(),
            "test",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("conflict".to_string())
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "conflict");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<usize, String> = with_backoff(
            &fast(),
            "test",
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("conflict {}", n))
                } else {
                    Ok(n)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), String> = with_backoff(
            &fast(),
            "test",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
            |e| e != "fatal",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_env_with_custom_values() {
        std::env::set_var("FISCSEQ_RETRY_MAX_ATTEMPTS", "7");
        std::env::set_var("FISCSEQ_RETRY_BASE_MS", "20");
        std::env::set_var("FISCSEQ_RETRY_MAX_MS", "900");
        std::env::set_var("FISCSEQ_RETRY_JITTER", "true");

        let config = RetryConfig::from_env();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.base_delay_ms, 20);
        assert_eq!(config.max_delay_ms, 900);
        assert!(config.jitter);

        std::env::set_var("FISCSEQ_RETRY_MAX_ATTEMPTS", "0");
        std::env::set_var("FISCSEQ_RETRY_BASE_MS", "not_a_number");
        let config = RetryConfig::from_env();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 100);

        std::env::remove_var("FISCSEQ_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("FISCSEQ_RETRY_BASE_MS");
        std::env::remove_var("FISCSEQ_RETRY_MAX_MS");
        std::env::remove_var("FISCSEQ_RETRY_JITTER");
    }
}
