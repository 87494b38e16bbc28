//! Central configuration for the Go engine workspace.
//!
//! Provides a single [`Config`] struct constructed at startup and shared
//! read-only with every component: search parameters, network settings, and
//! their defaults. Configuration is sourced from `config.toml` (searched in
//! standard locations) with `GOBAN_<SECTION>_<KEY>` environment overrides.

pub mod defaults;
mod loader;
mod structs;

pub use loader::{apply_env_overrides, load_config, load_from_path, ConfigError};
pub use structs::{Config, NetworkConfig, SearchConfig};
