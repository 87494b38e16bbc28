//! Configuration loading logic.
//!
//! Handles loading config from files and applying environment variable
//! overrides. Missing files fall back to built-in defaults; a malformed file
//! is an error only through [`load_from_path`], the strict entry point.

use crate::Config;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Standard locations to search for config.toml
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.toml",    // Current directory
    "../config.toml", // Parent directory (when running from a crate dir)
];

/// Errors from the strict config loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Load the configuration, searching standard locations.
///
/// Order:
/// 1. Path named by the `GOBAN_CONFIG` environment variable
/// 2. `config.toml` in the current directory
/// 3. `../config.toml`
///
/// A missing or malformed file falls back to defaults with a warning;
/// environment overrides are applied either way.
pub fn load_config() -> Config {
    if let Ok(path) = std::env::var("GOBAN_CONFIG") {
        if Path::new(&path).exists() {
            info!("Loading config from GOBAN_CONFIG: {}", path);
            return match load_from_path(&path) {
                Ok(config) => apply_env_overrides(config),
                Err(e) => {
                    warn!("{}, using defaults", e);
                    apply_env_overrides(Config::default())
                }
            };
        }
        warn!("GOBAN_CONFIG={} not found, searching defaults", path);
    }

    for path in CONFIG_SEARCH_PATHS {
        if Path::new(path).exists() {
            info!("Loading config from {}", path);
            return match load_from_path(path) {
                Ok(config) => apply_env_overrides(config),
                Err(e) => {
                    warn!("{}, using defaults", e);
                    apply_env_overrides(Config::default())
                }
            };
        }
    }

    debug!("No config.toml found, using built-in defaults");
    apply_env_overrides(Config::default())
}

/// Load configuration from a specific path, surfacing errors to the caller.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Macro to reduce env override boilerplate
macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (usize, u32, f32, bool, ...)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

/// Apply environment variable overrides to a configuration.
///
/// Environment variables follow the pattern: `GOBAN_<SECTION>_<KEY>`.
pub fn apply_env_overrides(mut config: Config) -> Config {
    // Search
    env_override!(config, search.num_threads, "GOBAN_SEARCH_NUM_THREADS", parse);
    env_override!(
        config,
        search.max_playouts,
        "GOBAN_SEARCH_MAX_PLAYOUTS",
        parse
    );
    env_override!(
        config,
        search.max_time_centis,
        "GOBAN_SEARCH_MAX_TIME_CENTIS",
        parse
    );
    env_override!(config, search.puct, "GOBAN_SEARCH_PUCT", parse);
    env_override!(
        config,
        search.resign_percent,
        "GOBAN_SEARCH_RESIGN_PERCENT",
        parse
    );
    env_override!(config, search.noise, "GOBAN_SEARCH_NOISE", parse);
    env_override!(
        config,
        search.random_moves,
        "GOBAN_SEARCH_RANDOM_MOVES",
        parse
    );

    // Network
    env_override!(config, network.weights_path, "GOBAN_NETWORK_WEIGHTS_PATH");
    env_override!(
        config,
        network.softmax_temp,
        "GOBAN_NETWORK_SOFTMAX_TEMP",
        parse
    );
    env_override!(
        config,
        network.selfcheck_probability,
        "GOBAN_NETWORK_SELFCHECK_PROBABILITY",
        parse
    );
    env_override!(config, network.cpu_only, "GOBAN_NETWORK_CPU_ONLY", parse);
    env_override!(config, network.precision, "GOBAN_NETWORK_PRECISION");

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_path_missing() {
        let result = load_from_path("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_path_malformed() {
        let dir = std::env::temp_dir().join("goban-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[search\nmax_playouts = nope").unwrap();
        let result = load_from_path(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
