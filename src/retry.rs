//! Bounded retry with exponential backoff and full jitter.
//!
//! One policy for every outbound call. Transient errors (network drops,
//! rate limits, 5xx) retry up to an attempt and elapsed-time budget;
//! anything else surfaces immediately. A server-specified Retry-After is
//! honored, capped at the policy's max delay.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the initial try.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Total elapsed budget across all attempts, in milliseconds.
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1_500,
            max_elapsed_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Load from environment with safe defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let get = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(default)
        };
        Self {
            max_attempts: get("RETRY_MAX_ATTEMPTS", d.max_attempts as u64).min(10) as u32,
            base_delay_ms: get("RETRY_BASE_DELAY_MS", d.base_delay_ms),
            max_delay_ms: get("RETRY_MAX_DELAY_MS", d.max_delay_ms),
            max_elapsed_ms: get("RETRY_MAX_ELAPSED_MS", d.max_elapsed_ms),
        }
    }

    /// Backoff for `attempt` (1-based): min(cap, base * 2^(attempt-1)) with
    /// full jitter in [0, capped). Full jitter spreads retry storms.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let capped = self.capped_backoff_ms(attempt);
        if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..capped)
        }
    }

    fn capped_backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let multiplier = if exponent >= 32 { u64::MAX } else { 1u64 << exponent };
        self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms)
    }
}

/// Implemented by error types that can signal a transient condition.
pub trait Retryable {
    /// Whether retrying could help at all.
    fn is_transient(&self) -> bool;
    /// Server-requested minimum wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry an async operation under the policy.
///
/// `op_name` labels log lines. The final error after exhausted attempts is
/// returned unchanged.
pub async fn retry_async<T, E, Fut, F>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "retry op={} succeeded after {} attempts (elapsed={}ms)",
                        op_name,
                        attempt,
                        start.elapsed().as_millis()
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_transient() {
                    debug!("retry op={} non-retryable: {}", op_name, err);
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        "retry op={} failed after {} attempts (elapsed={}ms): {}",
                        op_name,
                        attempt,
                        start.elapsed().as_millis(),
                        err
                    );
                    return Err(err);
                }
                let elapsed_ms = start.elapsed().as_millis() as u64;
                if elapsed_ms >= policy.max_elapsed_ms {
                    warn!(
                        "retry op={} elapsed budget exhausted after {}ms: {}",
                        op_name, elapsed_ms, err
                    );
                    return Err(err);
                }

                let mut backoff_ms = match err.retry_after() {
                    Some(wait) => (wait.as_millis() as u64).min(policy.max_delay_ms),
                    None => policy.backoff_ms(attempt),
                };
                backoff_ms = backoff_ms.min(policy.max_elapsed_ms.saturating_sub(elapsed_ms));

                debug!(
                    "retry op={} attempt={} backoff_ms={} err={}",
                    op_name, attempt, backoff_ms, err
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                attempt += 1;
            }
        }
    }
}
