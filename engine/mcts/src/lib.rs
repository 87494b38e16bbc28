//! Parallel Monte Carlo tree search for the Go engine.
//!
//! The search couples a UCT tree with the policy/value network: workers
//! descend by PUCT, expand leaves through the [`Evaluator`] seam, and
//! backpropagate Black-perspective evals into atomic per-node statistics.
//! Virtual losses keep concurrent workers apart; an expansion state
//! machine guarantees each leaf is expanded exactly once.
//!
//! # Layout
//!
//! - [`smp`]: spinlock, atomic f64 accumulator, fixed thread pool
//! - [`NodePointer`]: lazily inflated child handles
//! - [`UctNode`]: the tree node and its statistics
//! - [`UctSearch`]: the search driver (budgets, workers, tree reuse)

mod evaluator;
mod node;
mod node_pointer;
mod search;
pub mod smp;

pub use evaluator::{Evaluator, UniformEvaluator};
pub use node::{NodeStatus, UctNode, VIRTUAL_LOSS_COUNT};
pub use node_pointer::NodePointer;
pub use search::UctSearch;
