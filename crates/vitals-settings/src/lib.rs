//! # vitals-settings
//!
//! Configuration for the Vitals real-time gateway.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`VitalsSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over the defaults
//! 3. **Environment variables**: `VITALS_*` overrides (highest priority)
//!
//! There is no process-wide settings instance: the binary loads settings once
//! and hands the relevant sections to each component it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings_from_path, settings_path};
pub use types::{LoggingSettings, RealtimeSettings, ServerSettings, VitalsSettings};
