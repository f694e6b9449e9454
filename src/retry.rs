//! Capped exponential backoff with jitter
//!
//! `RetryPolicy` decides how long to wait and whether an error class is
//! worth another attempt; `retry_with_backoff` is the executor loop every
//! provider attempt runs under. Dropping the executor future aborts the
//! backoff sleep and the loop immediately (tokio sleeps are cancel-safe).

use crate::error::{GeoError, GeoResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt cap, including the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0 to 1.0), applied uniformly within ± capped × factor
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given attempt (1-based):
    /// `min(base × multiplier^(attempt-1), max)` with uniform jitter within
    /// `± capped × jitter_factor`, floored at zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0) / 1000.0)
    }

    /// Whether a failed attempt may be retried
    pub fn should_retry(&self, attempt: u32, error: &GeoError) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        error.is_retryable()
    }
}

/// Run `operation` under the policy: back off before every attempt after the
/// first, stop on success, a permanent error, or attempt exhaustion.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> GeoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GeoResult<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        if attempt > 1 {
            let backoff = policy.delay(attempt - 1);
            debug!(
                operation = operation_name,
                attempt,
                max_retries = policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                "backing off before retry"
            );
            sleep(backoff).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempts = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.should_retry(attempt, &err) {
                    if err.is_retryable() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "retry attempts exhausted"
                        );
                    } else {
                        debug!(
                            operation = operation_name,
                            error = %err,
                            "permanent error, not retrying"
                        );
                    }
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}
