//! Settings for the helm runtime.
//!
//! Three layers, lowest priority first:
//! 1. compiled defaults ([`HelmSettings::default()`])
//! 2. `~/.helm/settings.json`, deep-merged over the defaults
//! 3. `HELM_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, expand_home, helm_dir, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;
