//! Configuration struct definitions.
//!
//! All config structs with serde deserialization support and default values.
//! The [`Config`] is constructed once at startup and treated as immutable for
//! the lifetime of the process; every component reads it through a shared
//! reference.

use crate::defaults;
use serde::Deserialize;

// Serde default functions (required for #[serde(default = "...")])

fn d_num_threads() -> usize {
    defaults::NUM_THREADS
}
fn d_max_playouts() -> u32 {
    defaults::MAX_PLAYOUTS
}
fn d_max_time_centis() -> u32 {
    defaults::MAX_TIME_CENTIS
}
fn d_puct() -> f32 {
    defaults::PUCT
}
fn d_resign_percent() -> f32 {
    defaults::RESIGN_PERCENT
}
fn d_noise() -> bool {
    defaults::NOISE
}
fn d_random_moves() -> u32 {
    defaults::RANDOM_MOVES
}
fn d_dirichlet_alpha() -> f32 {
    defaults::DIRICHLET_ALPHA
}
fn d_dirichlet_epsilon() -> f32 {
    defaults::DIRICHLET_EPSILON
}
fn d_weights_path() -> String {
    defaults::WEIGHTS_PATH.into()
}
fn d_softmax_temp() -> f32 {
    defaults::SOFTMAX_TEMP
}
fn d_selfcheck_probability() -> u32 {
    defaults::SELFCHECK_PROBABILITY
}
fn d_cpu_only() -> bool {
    defaults::CPU_ONLY
}
fn d_precision() -> String {
    defaults::PRECISION.into()
}

/// Search-related settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Worker threads for the tree search. 0 selects hardware concurrency.
    #[serde(default = "d_num_threads")]
    pub num_threads: usize,

    /// Playout budget per move.
    #[serde(default = "d_max_playouts")]
    pub max_playouts: u32,

    /// Wall-clock budget per move in centiseconds. 0 disables the clock.
    #[serde(default = "d_max_time_centis")]
    pub max_time_centis: u32,

    /// PUCT exploration constant.
    #[serde(default = "d_puct")]
    pub puct: f32,

    /// Resign when the best winrate drops below this percentage.
    /// 0 disables resignation.
    #[serde(default = "d_resign_percent")]
    pub resign_percent: f32,

    /// Mix Dirichlet noise into the root priors (self-play training).
    #[serde(default = "d_noise")]
    pub noise: bool,

    /// Select the first N moves proportionally to visit counts
    /// (self-play opening temperature). 0 always plays the best move.
    #[serde(default = "d_random_moves")]
    pub random_moves: u32,

    /// Dirichlet concentration parameter for root noise.
    #[serde(default = "d_dirichlet_alpha")]
    pub dirichlet_alpha: f32,

    /// Fraction of the root prior replaced by noise.
    #[serde(default = "d_dirichlet_epsilon")]
    pub dirichlet_epsilon: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_threads: d_num_threads(),
            max_playouts: d_max_playouts(),
            max_time_centis: d_max_time_centis(),
            puct: d_puct(),
            resign_percent: d_resign_percent(),
            noise: d_noise(),
            random_moves: d_random_moves(),
            dirichlet_alpha: d_dirichlet_alpha(),
            dirichlet_epsilon: d_dirichlet_epsilon(),
        }
    }
}

/// Network evaluator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Path to the weights file (v1/v2 text or v3 binary, optionally gzipped).
    #[serde(default = "d_weights_path")]
    pub weights_path: String,

    /// Softmax temperature applied to the policy head.
    #[serde(default = "d_softmax_temp")]
    pub softmax_temp: f32,

    /// Expected number of evaluations per accelerator self-check.
    /// 0 disables the self-check entirely, 1 checks every evaluation.
    #[serde(default = "d_selfcheck_probability")]
    pub selfcheck_probability: u32,

    /// Force the reference CPU path even when an accelerated back-end
    /// is available.
    #[serde(default = "d_cpu_only")]
    pub cpu_only: bool,

    /// Accelerator precision: "auto", "single" or "half".
    #[serde(default = "d_precision")]
    pub precision: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            weights_path: d_weights_path(),
            softmax_temp: d_softmax_temp(),
            selfcheck_probability: d_selfcheck_probability(),
            cpu_only: d_cpu_only(),
            precision: d_precision(),
        }
    }
}

/// The process-wide configuration, read by all components.
///
/// Constructed at startup (see [`crate::load_config`]) and never mutated
/// after the first simulation starts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    /// Worker-thread count with the 0 = auto rule applied.
    pub fn num_threads(&self) -> usize {
        defaults::resolve_threads(self.search.num_threads)
    }

    /// Resign threshold as a winrate in [0, 1].
    pub fn resign_threshold(&self) -> f32 {
        self.search.resign_percent / 100.0
    }
}
