//! The policy/value evaluator.
//!
//! `Network` owns the loaded weights, the forward back-end, the evaluation
//! cache and the head post-processing. Evaluations flow through
//! [`Network::get_output`]: gather input planes under a symmetry, run the
//! residual tower through the [`ForwardPipe`], then finish the policy head
//! (batch-norm, fully connected, softmax) and the value head (batch-norm,
//! two fully connected layers, tanh mapped to [0, 1]) here.
//!
//! When an accelerated back-end is active, a reference evaluation runs
//! alongside it with a small configurable probability and the two outputs
//! are compared by L2 norm; a mismatch is treated as a driver bug and is
//! fatal.

use crate::cache::EvalCache;
use crate::pipe::{ForwardPipe, ReferencePipe};
use crate::symmetry::{nn_idx_table, NUM_SYMMETRIES};
use crate::weights::{WeightFile, WeightsError};
use crate::winograd::{winograd_transform_f, WINOGRAD_ALPHA};
use engine_config::Config;
use goban::{Color, GameState};
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

/// The board size the network is compiled for. States of any other size
/// evaluate to an all-zero result, which callers treat as illegal.
pub const BOARD_SIZE: usize = 19;
pub const NUM_INTERSECTIONS: usize = BOARD_SIZE * BOARD_SIZE;

/// Past positions fed to the network.
pub const INPUT_MOVES: usize = 8;
/// Two occupancy planes per past position plus the two to-move planes.
pub const INPUT_CHANNELS: usize = 2 * INPUT_MOVES + 2;

pub const OUTPUTS_POLICY: usize = 2;
pub const OUTPUTS_VALUE: usize = 1;
/// Width of the value head's hidden layer.
pub const VALUE_HIDDEN: usize = 256;

/// Moves considered "the opening"; symmetric cache probes run in the
/// first half of it.
const OPENING_MOVES: usize = NUM_INTERSECTIONS / 6;

/// L2 tolerance between accelerator and reference outputs.
const SELFCHECK_MAX_ERROR: f32 = 0.2;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Weights(#[from] WeightsError),

    #[error("no usable forward back-end: {0}")]
    Backend(String),
}

/// How to combine board symmetries for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensemble {
    /// Evaluate under the given symmetry (0..8).
    Direct(usize),
    /// Pick one of the eight symmetries uniformly.
    RandomSymmetry,
    /// Average the outputs of all eight symmetries.
    Average,
}

/// One network evaluation: move probabilities and the side-to-move winrate.
#[derive(Debug, Clone)]
pub struct NetResult {
    /// Probability per intersection, identity orientation.
    pub policy: Vec<f32>,
    /// Probability of passing.
    pub policy_pass: f32,
    /// Win probability for the side to move, in [0, 1].
    pub winrate: f32,
}

impl Default for NetResult {
    fn default() -> NetResult {
        NetResult {
            policy: vec![0.0; NUM_INTERSECTIONS],
            policy_pass: 0.0,
            winrate: 0.0,
        }
    }
}

/// Floating point width of an accelerated back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Half,
}

/// An accelerated back-end offered to [`Network::from_weights`].
pub struct PipeCandidate {
    pub precision: Precision,
    pub pipe: Box<dyn ForwardPipe>,
}

pub struct Network {
    forward: Box<dyn ForwardPipe>,
    /// Reference pipe kept for the self-check when `forward` is an
    /// accelerated back-end.
    reference: Option<Box<dyn ForwardPipe>>,
    cache: EvalCache,
    num_threads: usize,
    softmax_temp: f32,
    selfcheck_probability: u32,
    /// Symmetric cache probes are wrong for noisy self-play configs.
    symmetric_probes: bool,
    value_head_not_stm: bool,

    bn_pol_w1: Vec<f32>,
    bn_pol_w2: Vec<f32>,
    ip_pol_w: Vec<f32>,
    ip_pol_b: Vec<f32>,
    bn_val_w1: Vec<f32>,
    bn_val_w2: Vec<f32>,
    ip1_val_w: Vec<f32>,
    ip1_val_b: Vec<f32>,
    ip2_val_w: Vec<f32>,
    ip2_val_b: Vec<f32>,
}

impl Network {
    /// Load weights from the configured path and build a CPU-only network.
    pub fn initialize(cfg: &Config, playouts: u32) -> Result<Network, NetworkError> {
        let weights = WeightFile::load(&cfg.network.weights_path)?;
        Self::from_weights(cfg, playouts, weights, Vec::new())
    }

    /// Build a network from parsed weights and optional accelerated
    /// back-ends.
    ///
    /// With no candidates (or `cpu_only`), the reference pipe carries the
    /// evaluation and the self-check is disabled. With candidates, the
    /// configured precision picks one; "auto" with both widths present
    /// benchmarks each for a second of work and keeps the faster one,
    /// preferring single precision when the gap is under 5%.
    pub fn from_weights(
        cfg: &Config,
        playouts: u32,
        mut weights: WeightFile,
        backends: Vec<PipeCandidate>,
    ) -> Result<Network, NetworkError> {
        Self::transform_weights(&mut weights);
        let channels = weights.channels;

        let mut reference = Box::new(ReferencePipe::new());
        reference.initialize(channels);
        Self::push_weights(&mut *reference, &weights);

        let mut single = None;
        let mut half = None;
        if !cfg.network.cpu_only {
            for mut candidate in backends {
                candidate.pipe.initialize(channels);
                Self::push_weights(&mut *candidate.pipe, &weights);
                match candidate.precision {
                    Precision::Single if single.is_none() => single = Some(candidate.pipe),
                    Precision::Half if half.is_none() => half = Some(candidate.pipe),
                    _ => {}
                }
            }
        }

        let mut net = Network {
            forward: Box::new(ReferencePipe::new()),
            reference: None,
            cache: EvalCache::with_size_from_playouts(playouts),
            num_threads: cfg.num_threads(),
            softmax_temp: cfg.network.softmax_temp,
            selfcheck_probability: cfg.network.selfcheck_probability,
            symmetric_probes: !cfg.search.noise && cfg.search.random_moves == 0,
            value_head_not_stm: weights.value_head_not_stm,
            bn_pol_w1: weights.bn_pol_w1,
            bn_pol_w2: weights.bn_pol_w2,
            ip_pol_w: weights.ip_pol_w,
            ip_pol_b: weights.ip_pol_b,
            bn_val_w1: weights.bn_val_w1,
            bn_val_w2: weights.bn_val_w2,
            ip1_val_w: weights.ip1_val_w,
            ip1_val_b: weights.ip1_val_b,
            ip2_val_w: weights.ip2_val_w,
            ip2_val_b: weights.ip2_val_b,
        };

        match (single, half, cfg.network.precision.as_str()) {
            (None, None, _) => {
                info!("initializing CPU-only evaluation");
                net.forward = reference;
            }
            (Some(pipe), _, "single") | (Some(pipe), None, _) => {
                info!("initializing accelerated evaluation (single precision)");
                net.forward = pipe;
                net.reference = Some(reference);
            }
            (_, Some(pipe), "half") | (None, Some(pipe), _) => {
                info!("initializing accelerated evaluation (half precision)");
                net.forward = pipe;
                net.reference = Some(reference);
            }
            (Some(single_pipe), Some(half_pipe), _) => {
                info!("initializing accelerated evaluation (autodetect precision)");
                net.forward = single_pipe;
                net.reference = Some(reference);

                let score_single = net.benchmark_time(100);
                let single_pipe = std::mem::replace(&mut net.forward, half_pipe);
                let score_half =
                    std::panic::catch_unwind(AssertUnwindSafe(|| net.benchmark_time(100)))
                        .unwrap_or(-1.0);

                if score_half < 0.0 {
                    net.forward = single_pipe;
                    info!("using single precision (half precision failed to run)");
                } else if score_single * 1.05 > score_half {
                    net.forward = single_pipe;
                    info!("using single precision (less than 5% slower than half)");
                } else {
                    info!("using half precision (at least 5% faster than single)");
                }
            }
        }

        Ok(net)
    }

    /// Winograd-transform the tower convolutions and fold every convolution
    /// bias into the following batch-norm mean, so the forward path never
    /// adds biases separately.
    fn transform_weights(weights: &mut WeightFile) {
        let channels = weights.channels;

        weights.conv_weights[0] =
            winograd_transform_f(&weights.conv_weights[0], channels, INPUT_CHANNELS);
        for i in 1..weights.conv_weights.len() {
            weights.conv_weights[i] =
                winograd_transform_f(&weights.conv_weights[i], channels, channels);
        }

        for (biases, means) in weights
            .conv_biases
            .iter_mut()
            .zip(weights.batchnorm_means.iter_mut())
        {
            for (bias, mean) in biases.iter_mut().zip(means.iter_mut()) {
                *mean -= *bias;
                *bias = 0.0;
            }
        }
        for (bias, mean) in weights
            .conv_val_b
            .iter_mut()
            .zip(weights.bn_val_w1.iter_mut())
        {
            *mean -= *bias;
            *bias = 0.0;
        }
        for (bias, mean) in weights
            .conv_pol_b
            .iter_mut()
            .zip(weights.bn_pol_w1.iter_mut())
        {
            *mean -= *bias;
            *bias = 0.0;
        }
    }

    fn push_weights(pipe: &mut dyn ForwardPipe, weights: &WeightFile) {
        pipe.push_input_convolution(
            WINOGRAD_ALPHA,
            INPUT_CHANNELS,
            weights.channels,
            &weights.conv_weights[0],
            &weights.batchnorm_means[0],
            &weights.batchnorm_stddevs[0],
        );

        for block in 0..weights.residual_blocks {
            let i = 1 + 2 * block;
            pipe.push_residual(
                WINOGRAD_ALPHA,
                weights.channels,
                weights.channels,
                &weights.conv_weights[i],
                &weights.batchnorm_means[i],
                &weights.batchnorm_stddevs[i],
                &weights.conv_weights[i + 1],
                &weights.batchnorm_means[i + 1],
                &weights.batchnorm_stddevs[i + 1],
            );
        }

        pipe.push_convolve(1, weights.channels, OUTPUTS_POLICY, &weights.conv_pol_w);
        pipe.push_convolve(1, weights.channels, OUTPUTS_VALUE, &weights.conv_val_w);
    }

    /// Evaluate a state. Results are cached by state hash; during the early
    /// opening a miss also probes the seven symmetric hashes and permutes a
    /// hit back into place.
    pub fn get_output(&self, state: &GameState, ensemble: Ensemble, skip_cache: bool) -> NetResult {
        if state.board().size() != BOARD_SIZE {
            return NetResult::default();
        }

        if !skip_cache {
            if let Some(result) = self.probe_cache(state) {
                return result;
            }
        }

        let mut result = match ensemble {
            Ensemble::Direct(symmetry) => {
                assert!(symmetry < NUM_SYMMETRIES, "bad symmetry {}", symmetry);
                self.get_output_internal(state, symmetry, false)
            }
            Ensemble::Average => {
                let mut result = NetResult::default();
                for symmetry in 0..NUM_SYMMETRIES {
                    let tmp = self.get_output_internal(state, symmetry, false);
                    let scale = 1.0 / NUM_SYMMETRIES as f32;
                    result.winrate += tmp.winrate * scale;
                    result.policy_pass += tmp.policy_pass * scale;
                    for (acc, v) in result.policy.iter_mut().zip(&tmp.policy) {
                        *acc += v * scale;
                    }
                }
                result
            }
            Ensemble::RandomSymmetry => {
                let mut rng = rand::thread_rng();
                let symmetry = rng.gen_range(0..NUM_SYMMETRIES);
                let result = self.get_output_internal(state, symmetry, false);
                // Both implementations are available: spot-check the
                // accelerator against the reference on live traffic.
                if self.reference.is_some()
                    && self.selfcheck_probability > 0
                    && rng.gen_range(0..self.selfcheck_probability) == 0
                {
                    let reference = self.get_output_internal(state, symmetry, true);
                    self.compare_net_outputs(&result, &reference);
                }
                result
            }
        };

        // The v2 format reports Black's winrate, not the side to move's.
        if self.value_head_not_stm && state.to_move() == Color::White {
            result.winrate = 1.0 - result.winrate;
        }

        self.cache.insert(state.hash(), result.clone());
        result
    }

    fn probe_cache(&self, state: &GameState) -> Option<NetResult> {
        if let Some(result) = self.cache.lookup(state.hash()) {
            return Some(result);
        }

        // Early in the game, try the symmetric positions too. This assumes
        // the network is close to D4-equivariant, which holds well enough
        // for opening positions.
        if self.symmetric_probes && state.movenum() < OPENING_MOVES / 2 {
            for symmetry in 1..NUM_SYMMETRIES {
                if let Some(mut result) = self.cache.lookup(state.symmetry_hash(symmetry)) {
                    let table = &nn_idx_table()[symmetry];
                    let mut corrected = vec![0.0f32; NUM_INTERSECTIONS];
                    for (idx, out) in corrected.iter_mut().enumerate() {
                        *out = result.policy[table[idx] as usize];
                    }
                    result.policy = corrected;
                    return Some(result);
                }
            }
        }

        None
    }

    fn get_output_internal(
        &self,
        state: &GameState,
        symmetry: usize,
        use_reference: bool,
    ) -> NetResult {
        debug_assert!(symmetry < NUM_SYMMETRIES);

        let input = gather_features(state, symmetry);
        let mut policy_data = vec![0.0f32; OUTPUTS_POLICY * NUM_INTERSECTIONS];
        let mut value_data = vec![0.0f32; OUTPUTS_VALUE * NUM_INTERSECTIONS];

        let pipe: &dyn ForwardPipe = if use_reference {
            self.reference
                .as_deref()
                .expect("reference pipe requested but absent")
        } else {
            &*self.forward
        };
        pipe.forward(&input, &mut policy_data, &mut value_data);

        // Policy head
        batchnorm(
            OUTPUTS_POLICY,
            &mut policy_data,
            &self.bn_pol_w1,
            &self.bn_pol_w2,
        );
        let policy_out = innerproduct(
            &policy_data,
            &self.ip_pol_w,
            &self.ip_pol_b,
            NUM_INTERSECTIONS + 1,
            false,
        );
        let outputs = softmax(&policy_out, self.softmax_temp);

        // Value head
        batchnorm(
            OUTPUTS_VALUE,
            &mut value_data,
            &self.bn_val_w1,
            &self.bn_val_w2,
        );
        let hidden = innerproduct(
            &value_data,
            &self.ip1_val_w,
            &self.ip1_val_b,
            VALUE_HIDDEN,
            true,
        );
        let winrate_out = innerproduct(&hidden, &self.ip2_val_w, &self.ip2_val_b, 1, false);

        // Map the tanh range [-1, 1] to [0, 1]
        let winrate = (1.0 + winrate_out[0].tanh()) / 2.0;

        let mut result = NetResult {
            winrate,
            ..NetResult::default()
        };
        let table = &nn_idx_table()[symmetry];
        for (idx, &out) in outputs[..NUM_INTERSECTIONS].iter().enumerate() {
            result.policy[table[idx] as usize] = out;
        }
        result.policy_pass = outputs[NUM_INTERSECTIONS];

        result
    }

    fn compare_net_outputs(&self, data: &NetResult, reference: &NetResult) {
        let mut error = 0.0f32;
        for (a, b) in data.policy.iter().zip(&reference.policy) {
            let diff = a - b;
            error += diff * diff;
        }
        let diff_pass = data.policy_pass - reference.policy_pass;
        let diff_winrate = data.winrate - reference.winrate;
        error += diff_pass * diff_pass;
        error += diff_winrate * diff_winrate;
        let error = error.sqrt();

        if error > SELFCHECK_MAX_ERROR || error.is_nan() {
            error!(
                l2 = error,
                "self-check mismatch between accelerator and reference output"
            );
            panic!(
                "accelerator self-check mismatch (L2 norm {:.4}): \
                 update your GPU drivers or reduce the number of concurrent games",
                error
            );
        }
    }

    /// Evaluations per 100 centiseconds across the configured thread count.
    pub fn benchmark_time(&self, centiseconds: u32) -> f32 {
        let state = GameState::new(BOARD_SIZE, 7.5);
        let runcount = AtomicUsize::new(0);
        let start = Instant::now();

        std::thread::scope(|scope| {
            for _ in 0..self.num_threads {
                scope.spawn(|| loop {
                    runcount.fetch_add(1, Ordering::Relaxed);
                    self.get_output(&state, Ensemble::RandomSymmetry, true);
                    let elapsed_centis = start.elapsed().as_secs_f32() * 100.0;
                    if elapsed_centis >= centiseconds as f32 {
                        break;
                    }
                });
            }
        });

        let elapsed_centis = (start.elapsed().as_secs_f32() * 100.0).max(1e-3);
        100.0 * runcount.load(Ordering::Relaxed) as f32 / elapsed_centis
    }

    /// Run a fixed number of evaluations across the configured threads and
    /// report the throughput.
    pub fn benchmark(&self, state: &GameState, iterations: usize) {
        let runcount = AtomicUsize::new(0);
        let start = Instant::now();

        std::thread::scope(|scope| {
            for _ in 0..self.num_threads {
                scope.spawn(|| {
                    while runcount.fetch_add(1, Ordering::Relaxed) < iterations {
                        self.get_output(state, Ensemble::RandomSymmetry, true);
                    }
                });
            }
        });

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            evaluations = iterations,
            seconds = %format!("{:.2}", elapsed),
            per_second = (iterations as f64 / elapsed) as u64,
            "benchmark finished"
        );
    }

    /// (hits, lookups, entries) of the evaluation cache.
    pub fn cache_stats(&self) -> (u64, u64, usize) {
        self.cache.stats()
    }
}

/// Batch-normalize head planes in place with fused ReLU.
fn batchnorm(channels: usize, data: &mut [f32], means: &[f32], stddevs: &[f32]) {
    for c in 0..channels {
        let mean = means[c];
        let stddev = stddevs[c];
        for v in data[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS].iter_mut() {
            *v = (stddev * (*v - mean)).max(0.0);
        }
    }
}

/// Dense layer: `output = weights . input + biases`, optional ReLU.
fn innerproduct(
    input: &[f32],
    weights: &[f32],
    biases: &[f32],
    outputs: usize,
    relu: bool,
) -> Vec<f32> {
    let inputs = input.len();
    debug_assert_eq!(weights.len(), inputs * outputs);
    let mut output = Vec::with_capacity(outputs);
    for o in 0..outputs {
        let row = &weights[o * inputs..(o + 1) * inputs];
        let mut acc = biases[o];
        for (w, x) in row.iter().zip(input) {
            acc += w * x;
        }
        output.push(if relu { acc.max(0.0) } else { acc });
    }
    output
}

/// Softmax with temperature; components sum to 1.
fn softmax(input: &[f32], temperature: f32) -> Vec<f32> {
    let alpha = input.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut output: Vec<f32> = input
        .iter()
        .map(|&v| ((v - alpha) / temperature).exp())
        .collect();
    let denom: f32 = output.iter().sum();
    for v in output.iter_mut() {
        *v /= denom;
    }
    output
}

/// Fill the occupancy planes for one historical board under a symmetry.
fn fill_input_plane_pair(
    board: &goban::Board,
    input: &mut [f32],
    black_offset: usize,
    white_offset: usize,
    symmetry: usize,
) {
    let table = &nn_idx_table()[symmetry];
    for idx in 0..NUM_INTERSECTIONS {
        let sym_idx = table[idx] as usize;
        let x = sym_idx % BOARD_SIZE;
        let y = sym_idx / BOARD_SIZE;
        match board.cell_xy(x, y) {
            goban::Cell::Black => input[black_offset + idx] = 1.0,
            goban::Cell::White => input[white_offset + idx] = 1.0,
            _ => {}
        }
    }
}

/// Gather the INPUT_CHANNELS x 361 input tensor: own/opponent occupancy for
/// each of the last eight positions, then the to-move indicator planes.
pub(crate) fn gather_features(state: &GameState, symmetry: usize) -> Vec<f32> {
    let mut input = vec![0.0f32; INPUT_CHANNELS * NUM_INTERSECTIONS];

    let blacks_move = state.to_move() == Color::Black;
    let black_offset = if blacks_move {
        0
    } else {
        INPUT_MOVES * NUM_INTERSECTIONS
    };
    let white_offset = if blacks_move {
        INPUT_MOVES * NUM_INTERSECTIONS
    } else {
        0
    };
    let to_move_offset = if blacks_move {
        2 * INPUT_MOVES * NUM_INTERSECTIONS
    } else {
        (2 * INPUT_MOVES + 1) * NUM_INTERSECTIONS
    };

    let moves = (state.movenum() + 1).min(INPUT_MOVES);
    for h in 0..moves {
        fill_input_plane_pair(
            state.past_board(h),
            &mut input,
            black_offset + h * NUM_INTERSECTIONS,
            white_offset + h * NUM_INTERSECTIONS,
            symmetry,
        );
    }

    for v in input[to_move_offset..to_move_offset + NUM_INTERSECTIONS].iter_mut() {
        *v = 1.0;
    }

    input
}
