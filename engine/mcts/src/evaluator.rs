//! Evaluator seam between the search and the network.
//!
//! The search only needs "give me a prior and a winrate for this state";
//! putting that behind a trait lets tests and benchmarks run against cheap
//! synthetic evaluators while play uses [`network::Network`].

use goban::GameState;
use network::{Ensemble, NetResult, Network, NetworkError, NUM_INTERSECTIONS};

/// A position evaluator: policy priors plus a side-to-move winrate.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, state: &GameState) -> Result<NetResult, NetworkError>;
}

impl Evaluator for Network {
    fn evaluate(&self, state: &GameState) -> Result<NetResult, NetworkError> {
        Ok(self.get_output(state, Ensemble::RandomSymmetry, false))
    }
}

/// Uniform priors and a fixed winrate. The standard mock for search tests:
/// with a 0.5 winrate every path looks equal and tree statistics become
/// exactly predictable.
#[derive(Debug, Clone)]
pub struct UniformEvaluator {
    winrate: f32,
}

impl Default for UniformEvaluator {
    fn default() -> Self {
        UniformEvaluator::new(0.5)
    }
}

impl UniformEvaluator {
    pub fn new(winrate: f32) -> UniformEvaluator {
        UniformEvaluator { winrate }
    }
}

impl Evaluator for UniformEvaluator {
    fn evaluate(&self, state: &GameState) -> Result<NetResult, NetworkError> {
        let size = state.board().size();
        let intersections = size * size;
        let probability = 1.0 / (intersections + 1) as f32;

        // NetResult carries the compiled board's plane count; for smaller
        // boards the tail entries stay zero and are never consulted.
        let mut policy = vec![0.0f32; intersections.max(NUM_INTERSECTIONS)];
        for p in policy.iter_mut().take(intersections) {
            *p = probability;
        }

        Ok(NetResult {
            policy,
            policy_pass: probability,
            winrate: self.winrate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_evaluator_is_a_distribution() {
        let evaluator = UniformEvaluator::default();
        let state = GameState::new(9, 7.5);
        let result = evaluator.evaluate(&state).unwrap();

        let sum: f32 = result.policy.iter().take(81).sum::<f32>() + result.policy_pass;
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((result.winrate - 0.5).abs() < 1e-6);
    }
}
