//! Coordination lock and rate shaping settings.

use serde::{Deserialize, Serialize};

/// Coordination lock settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// How long a lock entry is honoured before it counts as stale.
    pub timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Default windows for throttled and debounced handlers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateSettings {
    /// Throttle window.
    pub throttle_ms: u64,
    /// Debounce quiet period.
    pub debounce_ms: u64,
    /// Longest a debounced call may be deferred under continuous pressure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_max_wait_ms: Option<u64>,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            throttle_ms: 500,
            debounce_ms: 300,
            debounce_max_wait_ms: None,
        }
    }
}
