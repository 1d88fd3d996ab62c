//! Retry scheduling for deferred writes.

use chrono::Duration;
use rand::Rng;

/// Exponential backoff bounds.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::seconds(2),
            max: Duration::seconds(300),
        }
    }
}

/// Backoff before jitter: `min(base * 2^retry_count, max)`.
pub fn compute_backoff(retry_count: u32, config: &BackoffConfig) -> Duration {
    let base_ms = config.base.num_milliseconds().max(1) as u64;
    let max_ms = config.max.num_milliseconds().max(1) as u64;
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
    Duration::milliseconds(delay_ms as i64)
}

/// Backoff with ±30% jitter applied. Never zero, so a failing record can
/// never be rescheduled for immediate retry.
pub fn compute_backoff_jittered(retry_count: u32, config: &BackoffConfig) -> Duration {
    let delay_ms = compute_backoff(retry_count, config).num_milliseconds();
    let spread = (delay_ms as f64 * 0.3) as i64;
    let jitter = if spread > 0 {
        rand::thread_rng().gen_range(-spread..=spread)
    } else {
        0
    };
    Duration::milliseconds((delay_ms + jitter).max(1))
}
