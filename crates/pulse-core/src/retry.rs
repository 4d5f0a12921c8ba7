//! Reconnection budget and backoff calculation.
//!
//! Provides the portable building blocks for reconnect scheduling. The
//! timer-driven loop that consumes them lives in `pulse-stream`.
//!
//! - [`BackoffConfig`]: Retry budget, base/max delay, jitter
//! - [`calculate_backoff_delay`]: Exponential backoff upper bound
//! - [`calculate_backoff_delay_with_random`]: Exponential backoff with explicit jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum reconnect attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Reconnect budget and backoff parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Maximum consecutive reconnect attempts. `None` retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in ms, jitter included (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_retries() -> Option<u32> {
    Some(DEFAULT_MAX_RETRIES)
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Whether another attempt is allowed after `retry_count` consecutive failures.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        self.max_retries.is_none_or(|max| retry_count < max)
    }

    /// Delay before reconnect attempt `attempt` (zero-based), with random jitter.
    ///
    /// A server-suggested delay (`hint_ms`, from an SSE `retry:` field) wins
    /// when it is larger, but is still capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        let backoff = calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        );
        let delay = hint_ms.map_or(backoff, |hint| backoff.max(hint.min(self.max_delay_ms)));
        Duration::from_millis(delay)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Upper bound of the exponential backoff delay for `attempt`.
///
/// Formula: `min(max_delay, min(max_delay, base_delay * 2^attempt) * (1 + jitter))`
#[must_use]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> u64 {
    calculate_backoff_delay_with_random(attempt, base_delay_ms, max_delay_ms, jitter_factor, 1.0)
}

/// Calculate backoff delay with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG. It is mapped to
/// `[-jitter, +jitter]` around the capped exponential value, and the result
/// never exceeds `max_delay_ms`.
#[must_use]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64 * jitter).round().max(0.0) as u64;

    with_jitter.min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
