//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may specify any subset of fields.

mod coord;
mod stream;

pub use coord::*;
pub use stream::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Stream connection settings.
    pub stream: StreamSettings,
    /// Coordination lock settings.
    pub lock: LockSettings,
    /// Throttle/debounce windows.
    pub rate: RateSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "pulse".to_string(),
            stream: StreamSettings::default(),
            lock: LockSettings::default(),
            rate: RateSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PulseSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.stream.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("stream.baseUrl is empty".into()));
        }
        if self.stream.backoff_max_ms < self.stream.backoff_base_ms {
            return Err(SettingsError::InvalidValue(format!(
                "stream.backoffMaxMs ({}) is below stream.backoffBaseMs ({})",
                self.stream.backoff_max_ms, self.stream.backoff_base_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.stream.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "stream.jitterFactor ({}) must be within 0.0..=1.0",
                self.stream.jitter_factor
            )));
        }
        if !self.stream.path_template.contains("{resource}")
            || !self.stream.channel_template.contains("{resource}")
            || !self.stream.channel_template.contains("{channel}")
        {
            return Err(SettingsError::InvalidValue(
                "stream path templates must contain {resource} (and {channel} for channelTemplate)"
                    .into(),
            ));
        }
        if self.lock.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("lock.timeoutMs must be positive".into()));
        }
        if let Some(max_wait) = self.rate.debounce_max_wait_ms {
            if max_wait < self.rate.debounce_ms {
                return Err(SettingsError::InvalidValue(format!(
                    "rate.debounceMaxWaitMs ({max_wait}) is below rate.debounceMs ({})",
                    self.rate.debounce_ms
                )));
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
