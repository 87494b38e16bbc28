//! Neural-network evaluation for the Go engine.
//!
//! The [`Network`] maps a [`goban::GameState`] to a policy over moves and a
//! winrate, in the AlphaGo Zero style: input planes are gathered from the
//! last eight positions, pushed through a residual convolution stack behind
//! the pluggable [`ForwardPipe`] contract, and finished with the policy and
//! value heads in this crate. Results are cached by position hash in a
//! bounded [`EvalCache`].
//!
//! The convolution stack itself is *not* implemented here beyond the
//! [`ReferencePipe`] correctness oracle; accelerated back-ends (OpenCL,
//! BLAS) plug in through [`ForwardPipe`] and are validated against the
//! oracle by a probabilistic self-check.

mod cache;
mod network;
mod pipe;
mod symmetry;
mod weights;
mod winograd;

pub use cache::EvalCache;
pub use network::{
    Ensemble, NetResult, Network, NetworkError, PipeCandidate, Precision, BOARD_SIZE,
    INPUT_CHANNELS, INPUT_MOVES, NUM_INTERSECTIONS, OUTPUTS_POLICY, OUTPUTS_VALUE,
};
pub use pipe::{ForwardPipe, ReferencePipe};
pub use symmetry::{
    get_symmetry, inverse_symmetry, nn_idx_table, IDENTITY_SYMMETRY, NUM_SYMMETRIES,
};
pub use weights::{WeightFile, WeightsError};
pub use winograd::{winograd_transform_f, winograd_untransform_f, WINOGRAD_ALPHA, WINOGRAD_TILE};
