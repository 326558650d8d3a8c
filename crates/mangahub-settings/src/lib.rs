//! # mangahub-settings
//!
//! Configuration with layered sources for the MangaHub bridge and gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MangahubSettings::default()`]
//! 2. **Settings file**: a JSON file deep-merged over defaults
//! 3. **Environment variables**: `MANGAHUB_*` overrides (highest priority)
//!
//! Settings are plain values: the gateway loads them once and passes the
//! relevant sections into each component's constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    RejectedOverride, apply_env_overrides, apply_overrides_with, deep_merge,
    load_settings_from_path, load_settings_with_report,
};
pub use types::*;
