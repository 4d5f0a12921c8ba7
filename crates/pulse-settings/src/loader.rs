//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PulseSettings::default()`]
//! 2. If `~/.pulse/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PULSE_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::PulseSettings;

/// Resolve the path to the settings file (`~/.pulse/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pulse").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PulseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or values that fail
/// validation are errors.
pub fn load_settings_from_path(path: &Path) -> Result<PulseSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<PulseSettings> {
    let defaults = serde_json::to_value(PulseSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and fall back to file/default.
pub fn apply_env_overrides(settings: &mut PulseSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
fn apply_overrides(settings: &mut PulseSettings, get: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| get(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, parse: &dyn Fn(&str) -> bool| {
        let val = get(name)?;
        if parse(&val) {
            Some(val)
        } else {
            tracing::warn!(key = name, value = %val, "invalid env override, ignoring");
            None
        }
    };

    if let Some(v) = string("PULSE_BASE_URL") {
        settings.stream.base_url = v;
    }
    if let Some(v) = parsed("PULSE_AUTO_RECONNECT", &|v| parse_bool(v).is_some()).and_then(|v| parse_bool(&v)) {
        settings.stream.auto_reconnect = v;
    }
    if let Some(v) = get("PULSE_MAX_RETRIES") {
        match parse_retry_limit(&v) {
            Some(None) => settings.stream.unbounded_retries = true,
            Some(Some(n)) => {
                settings.stream.unbounded_retries = false;
                settings.stream.max_retries = n;
            }
            None => tracing::warn!(key = "PULSE_MAX_RETRIES", value = %v, "invalid env override, ignoring"),
        }
    }
    let ms = |name: &str, min: u64, max: u64| {
        parsed(name, &|v| parse_u64_range(v, min, max).is_some()).and_then(|v| parse_u64_range(&v, min, max))
    };
    if let Some(v) = ms("PULSE_BACKOFF_BASE_MS", 1, 3_600_000) {
        settings.stream.backoff_base_ms = v;
    }
    if let Some(v) = ms("PULSE_BACKOFF_MAX_MS", 1, 3_600_000) {
        settings.stream.backoff_max_ms = v;
    }
    if let Some(v) = ms("PULSE_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.stream.idle_timeout_ms = v;
    }
    if let Some(v) = ms("PULSE_LOCK_TIMEOUT_MS", 1, 3_600_000) {
        settings.lock.timeout_ms = v;
    }
    if let Some(v) = string("PULSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a retry limit: a count, or `unbounded`/`inf` for no limit.
///
/// Returns `None` when the value is invalid, `Some(None)` for unbounded.
pub fn parse_retry_limit(val: &str) -> Option<Option<u32>> {
    match val.to_lowercase().as_str() {
        "unbounded" | "inf" | "infinite" => Some(None),
        other => other.parse::<u32>().ok().map(Some),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
