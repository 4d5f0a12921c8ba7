//! # pulse-settings
//!
//! Configuration for pulse stream clients, loaded from three layers (in
//! priority order):
//!
//! 1. **Compiled defaults**: [`PulseSettings::default()`]
//! 2. **User file**: `~/.pulse/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PULSE_*` overrides (highest priority)
//!
//! Settings are plain data. `pulse-stream` and `pulse-coord` convert the
//! relevant sections into their own option types.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
