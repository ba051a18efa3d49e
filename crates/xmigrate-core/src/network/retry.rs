//! Retry logic with exponential backoff and jitter.
//!
//! Used at two levels: individual REST calls inside the reader and writer
//! (transient transport failures), and whole units inside the orchestrator
//! (integrity failures, exhausted call retries).

use crate::error::{MigrateError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never waits; handy for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter && capped_secs > 0.0 {
            // 0.5x..1.5x keeps the mean while spreading concurrent workers apart
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Retry an async operation with exponential backoff.
///
/// `should_retry` decides whether a given error is worth another attempt.
/// Returns the final result together with statistics about the attempts.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (std::result::Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());

                if !should_retry(&e) {
                    debug!("Error is not retryable: {}", e);
                    return (Err(e), stats);
                }

                if attempt + 1 >= max_attempts {
                    warn!(
                        "All {} retry attempts exhausted. Last error: {}",
                        max_attempts, e
                    );
                    return (Err(e), stats);
                }

                let delay = config.calculate_delay(attempt);
                stats.total_delay += delay;

                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Run one REST call under a timeout, retrying transient failures.
pub async fn retry_call<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (result, stats) = retry_call_with_stats(config, timeout, operation).await;
    if stats.attempts > 1 {
        debug!(
            "Call {} after {} attempts ({:?} backing off)",
            if stats.success { "succeeded" } else { "gave up" },
            stats.attempts,
            stats.total_delay
        );
    }
    result
}

/// [`retry_call`], also returning statistics about the attempts.
pub async fn retry_call_with_stats<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_async(
        config,
        || {
            let call = operation();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrateError::Timeout(timeout)),
                }
            }
        },
        MigrateError::is_retryable,
    )
    .await
}
