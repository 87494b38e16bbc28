//! The search-tree node.
//!
//! A `UctNode` carries atomic statistics (visits, virtual losses, the
//! Black-perspective eval sum) so many workers can descend and backprop
//! without serializing on the hot path. Children are created once through
//! an expansion state machine: a compare-exchange singles out one expander,
//! the children vector is populated under a short spinlock, and the
//! `Expanded` state is released only afterwards so any thread that observes
//! `has_children()` also observes the full vector and the net eval.
//!
//! Concurrency invariants:
//! - `visits` increments exactly once per completed backpropagation.
//! - `blackevals / visits` is the Black-perspective winrate; virtual
//!   losses are folded in on read, never written into the sum.
//! - The children vector is only mutated while in `Expanding` (behind the
//!   spinlock) or through `&mut self` during root surgery.

use crate::evaluator::Evaluator;
use crate::node_pointer::NodePointer;
use crate::smp::{AtomicF64, SpinMutex};
use goban::{Cell, Color, GameState, Move, PASS};
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use tracing::warn;

/// Virtual losses added per descending worker, to push concurrent workers
/// onto different paths.
pub const VIRTUAL_LOSS_COUNT: i32 = 3;

/// First-play-urgency reduction below the parent net eval, scaled by the
/// explored policy mass. The root explores optimistically and skips it.
const FPU_REDUCTION: f32 = 0.25;

/// Node liveness for selection; superko children become `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeStatus {
    Invalid = 0,
    Pruned = 1,
    Active = 2,
}

const EXPAND_INITIAL: u8 = 0;
const EXPAND_EXPANDING: u8 = 1;
const EXPAND_EXPANDED: u8 = 2;
const EXPAND_SINGLE_THREAD_USE: u8 = 3;

pub struct UctNode {
    mv: Move,
    /// Prior from the policy network. Only mutated through `&mut self`
    /// (root noise), so plain storage is fine.
    policy: f32,
    /// This node's own network eval (Black perspective), f32 bits.
    /// Published together with the children by the `Expanded` release.
    net_eval: AtomicU32,
    visits: AtomicI32,
    virtual_loss: AtomicI32,
    /// Sum of Black-perspective evals backpropagated through this node.
    blackevals: AtomicF64,
    status: AtomicU8,
    expand_state: AtomicU8,
    children: UnsafeCell<Vec<NodePointer>>,
    children_lock: SpinMutex,
}

// The UnsafeCell is only written while Expanding (single writer behind the
// CAS plus the spinlock) or through &mut self; readers gate on the
// Expanded acquire load.
unsafe impl Send for UctNode {}
unsafe impl Sync for UctNode {}

impl UctNode {
    pub fn new(mv: Move, policy: f32) -> UctNode {
        UctNode {
            mv,
            policy,
            net_eval: AtomicU32::new(0.0f32.to_bits()),
            visits: AtomicI32::new(0),
            virtual_loss: AtomicI32::new(0),
            blackevals: AtomicF64::new(0.0),
            status: AtomicU8::new(NodeStatus::Active as u8),
            expand_state: AtomicU8::new(EXPAND_INITIAL),
            children: UnsafeCell::new(Vec::new()),
            children_lock: SpinMutex::new(),
        }
    }

    #[inline]
    pub fn get_move(&self) -> Move {
        self.mv
    }

    #[inline]
    pub fn get_policy(&self) -> f32 {
        self.policy
    }

    #[inline]
    pub fn set_policy(&mut self, policy: f32) {
        self.policy = policy;
    }

    #[inline]
    pub fn get_visits(&self) -> i32 {
        self.visits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn get_virtual_loss(&self) -> i32 {
        self.virtual_loss.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn first_visit(&self) -> bool {
        self.get_visits() == 0
    }

    // -- Expansion state machine ------------------------------------------

    fn acquire_expanding(&self) -> bool {
        self.expand_state
            .compare_exchange(
                EXPAND_INITIAL,
                EXPAND_EXPANDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn expand_done(&self) {
        let previous = self.expand_state.swap(EXPAND_EXPANDED, Ordering::AcqRel);
        debug_assert_eq!(previous, EXPAND_EXPANDING);
    }

    fn expand_cancel(&self) {
        let previous = self.expand_state.swap(EXPAND_INITIAL, Ordering::AcqRel);
        debug_assert_eq!(previous, EXPAND_EXPANDING);
    }

    /// Mark the node for exclusive tree surgery (root preparation).
    pub fn decl_single_thread_use(&self) {
        let previous = self
            .expand_state
            .swap(EXPAND_SINGLE_THREAD_USE, Ordering::AcqRel);
        debug_assert_eq!(previous, EXPAND_EXPANDED);
    }

    pub fn finish_single_thread_use(&self) {
        let previous = self.expand_state.swap(EXPAND_EXPANDED, Ordering::AcqRel);
        debug_assert_eq!(previous, EXPAND_SINGLE_THREAD_USE);
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        self.expand_state.load(Ordering::Acquire) >= EXPAND_EXPANDED
    }

    /// The children, or an empty slice before expansion completes.
    pub fn get_children(&self) -> &[NodePointer] {
        if self.has_children() {
            unsafe { &*self.children.get() }
        } else {
            &[]
        }
    }

    fn children_mut(&mut self) -> &mut Vec<NodePointer> {
        self.children.get_mut()
    }

    // -- Expansion --------------------------------------------------------

    /// Claim and run the expansion of this leaf.
    ///
    /// Exactly one caller wins the `Initial -> Expanding` transition; the
    /// others return false immediately and their simulation is abandoned
    /// (the virtual loss they hold keeps them off this path for a while).
    /// On success the network's Black-perspective eval is written to
    /// `eval`; children are filtered for suicide and the simple ko, their
    /// priors renormalized and sorted descending.
    pub fn create_children<E: Evaluator>(
        &self,
        network: &E,
        nodecount: &AtomicUsize,
        state: &GameState,
        eval: &mut f32,
    ) -> bool {
        if self.has_children() {
            return false;
        }
        // No successors in a final state
        if state.passes() >= 2 {
            return false;
        }
        if !self.acquire_expanding() {
            return false;
        }

        let raw = match network.evaluate(state) {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "network evaluation failed; leaving node unexpanded");
                self.expand_cancel();
                return false;
            }
        };

        // The network scores the side to move; the tree works from
        // Black's point of view.
        let to_move = state.to_move();
        let net_eval = if to_move == Color::White {
            1.0 - raw.winrate
        } else {
            raw.winrate
        };
        *eval = net_eval;
        self.net_eval.store(net_eval.to_bits(), Ordering::Relaxed);

        let board = state.board();
        let size = board.size();
        let mut nodelist: Vec<(f32, Move)> = Vec::new();
        let mut legal_sum = 0.0f32;
        for y in 0..size {
            for x in 0..size {
                let vertex = board.vertex(x, y);
                if board.cell(vertex) != Cell::Empty {
                    continue;
                }
                if Some(vertex) == state.ko_move() {
                    continue;
                }
                if board.is_suicide(vertex, to_move) {
                    continue;
                }
                let policy = raw.policy[y * size + x];
                nodelist.push((policy, vertex as Move));
                legal_sum += policy;
            }
        }
        nodelist.push((raw.policy_pass, PASS));
        legal_sum += raw.policy_pass;

        // If the legal mass is zero or denormal, don't try to normalize.
        if legal_sum > f32::MIN_POSITIVE {
            for entry in nodelist.iter_mut() {
                entry.0 /= legal_sum;
            }
        }

        nodelist.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(CmpOrdering::Equal));

        {
            let _guard = self.children_lock.lock();
            // Single writer: we hold the Expanding state, readers wait for
            // the Expanded release below.
            let children = unsafe { &mut *self.children.get() };
            children.reserve(nodelist.len());
            for (policy, mv) in nodelist {
                children.push(NodePointer::new(mv, policy));
            }
            nodecount.fetch_add(children.len(), Ordering::Relaxed);
        }

        self.expand_done();
        true
    }

    // -- Statistics -------------------------------------------------------

    /// Record one completed backpropagation.
    pub fn update(&self, eval: f32) {
        self.visits.fetch_add(1, Ordering::Relaxed);
        self.blackevals.add(eval as f64);
    }

    pub fn virtual_loss(&self) {
        self.virtual_loss
            .fetch_add(VIRTUAL_LOSS_COUNT, Ordering::Relaxed);
    }

    pub fn virtual_loss_undo(&self) {
        self.virtual_loss
            .fetch_sub(VIRTUAL_LOSS_COUNT, Ordering::Relaxed);
    }

    /// This node's own network eval from `tomove`'s point of view.
    pub fn get_net_eval(&self, tomove: Color) -> f32 {
        let eval = f32::from_bits(self.net_eval.load(Ordering::Relaxed));
        if tomove == Color::White {
            1.0 - eval
        } else {
            eval
        }
    }

    /// Winrate estimate from `tomove`'s point of view, with outstanding
    /// virtual losses counted as losses for the side to move. Falls back
    /// to the node's net eval before the first visit.
    pub fn get_eval(&self, tomove: Color) -> f32 {
        // Visits and virtual losses move underneath us; read once and
        // compute from the snapshot.
        let virtual_loss = self.get_virtual_loss();
        let visits = self.get_visits() + virtual_loss;
        if visits > 0 {
            let mut blackevals = self.blackevals.get();
            if tomove == Color::White {
                blackevals += virtual_loss as f64;
            }
            let mut eval = (blackevals / visits as f64) as f32;
            if tomove == Color::White {
                eval = 1.0 - eval;
            }
            eval.clamp(0.0, 1.0)
        } else {
            self.get_net_eval(tomove)
        }
    }

    #[doc(hidden)]
    pub fn get_blackevals(&self) -> f64 {
        self.blackevals.get()
    }

    // -- Status -----------------------------------------------------------

    pub fn invalidate(&self) {
        self.status.store(NodeStatus::Invalid as u8, Ordering::Relaxed);
    }

    pub fn set_active(&self, active: bool) {
        let status = if active {
            NodeStatus::Active
        } else {
            NodeStatus::Pruned
        };
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn valid(&self) -> bool {
        self.status.load(Ordering::Relaxed) != NodeStatus::Invalid as u8
    }

    pub fn active(&self) -> bool {
        self.status.load(Ordering::Relaxed) == NodeStatus::Active as u8
    }

    // -- Selection --------------------------------------------------------

    /// PUCT child selection: maximize `Q + c_puct * P * sqrt(N) / (1 + n)`.
    /// Invalid children are excluded from the visit total, inactive ones
    /// from selection. The winner is inflated and returned.
    pub fn uct_select_child(&self, color: Color, is_root: bool, puct: f32) -> Option<&UctNode> {
        let children = self.get_children();
        if children.is_empty() {
            return None;
        }

        // Count the parent's visits over its valid children to dodge
        // inconsistencies from our own in-flight update.
        let mut parentvisits: i64 = 0;
        let mut total_visited_policy = 0.0f32;
        for child in children {
            if !child.valid() {
                continue;
            }
            let visits = child.get_visits();
            parentvisits += visits as i64;
            if visits > 0 {
                total_visited_policy += child.get_policy();
            }
        }
        let numerator = (parentvisits as f32).sqrt();

        let base_reduction = if is_root { 0.0 } else { FPU_REDUCTION };
        let fpu_eval = self.get_net_eval(color) - base_reduction * total_visited_policy.sqrt();

        let mut best: Option<&NodePointer> = None;
        let mut best_value = f32::NEG_INFINITY;
        for child in children {
            if !child.active() {
                continue;
            }

            let winrate = match child.get() {
                Some(node) if node.get_visits() + node.get_virtual_loss() > 0 => {
                    node.get_eval(color)
                }
                _ => fpu_eval,
            };
            let psa = child.get_policy();
            let denom = 1.0 + child.get_visits() as f32;
            let value = winrate + puct * psa * (numerator / denom);

            if value > best_value {
                best_value = value;
                best = Some(child);
            }
        }

        let best = best?;
        best.inflate();
        best.get()
    }

    /// Remove children whose move immediately repeats a previous whole
    /// board position.
    pub fn kill_superkos(&mut self, state: &GameState) {
        self.children_mut().retain(|child| {
            let mv = child.get_move();
            if mv != PASS {
                let mut successor = state.clone();
                successor.play_move(mv);
                if successor.superko() {
                    return false;
                }
            }
            true
        });
    }

    /// Mix an alpha-Dirichlet sample into the children's priors:
    /// `P' = (1 - epsilon) * P + epsilon * eta`. Root-only, self-play.
    pub fn dirichlet_noise<R: Rng>(&mut self, epsilon: f32, alpha: f32, rng: &mut R) {
        let children = self.children_mut();
        if children.is_empty() || alpha <= 0.0 {
            return;
        }

        let gamma = Gamma::new(alpha as f64, 1.0).expect("alpha checked positive");
        let mut noise: Vec<f64> = children.iter().map(|_| gamma.sample(rng)).collect();
        let sample_sum: f64 = noise.iter().sum();
        // If the noise vector sums to 0 or a denormal, don't normalize.
        if sample_sum < f64::MIN_POSITIVE {
            return;
        }
        for eta in noise.iter_mut() {
            *eta /= sample_sum;
        }

        for (child, eta) in children.iter_mut().zip(noise) {
            let mixed = child.get_policy() * (1.0 - epsilon) + epsilon * eta as f32;
            child.set_policy(mixed);
        }
    }

    /// Pick a child proportionally to visit counts and swap it into the
    /// first slot (self-play opening temperature).
    pub fn randomize_first_proportionally<R: Rng>(&mut self, rng: &mut R) {
        let children = self.children_mut();
        let mut accum = 0u64;
        let mut accum_vector = Vec::with_capacity(children.len());
        for child in children.iter() {
            accum += child.get_visits().max(0) as u64;
            accum_vector.push(accum);
        }
        if accum == 0 {
            return;
        }

        let pick = rng.gen_range(0..accum);
        let index = accum_vector
            .iter()
            .position(|&cumulative| pick < cumulative)
            .unwrap_or(0);

        // Take the early out
        if index == 0 {
            return;
        }
        children.swap(0, index);
    }

    /// Lexicographic root ordering: a node with visits beats one without,
    /// more visits win, then higher winrate, then higher prior.
    fn root_order(a: &NodePointer, b: &NodePointer, color: Color) -> CmpOrdering {
        let a_visits = a.get_visits();
        let b_visits = b.get_visits();
        let ordering = (a_visits > 0).cmp(&(b_visits > 0));
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
        let ordering = a_visits.cmp(&b_visits);
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
        let a_winrate = a.get().map_or(0.0, |node| node.get_eval(color));
        let b_winrate = b.get().map_or(0.0, |node| node.get_eval(color));
        let ordering = a_winrate
            .partial_cmp(&b_winrate)
            .unwrap_or(CmpOrdering::Equal);
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
        a.get_policy()
            .partial_cmp(&b.get_policy())
            .unwrap_or(CmpOrdering::Equal)
    }

    /// Best child of the (root) node for move selection.
    pub fn get_best_root_child(&self, color: Color) -> Option<&NodePointer> {
        let children = self.get_children();
        let mut best = children.first()?;
        for child in &children[1..] {
            if Self::root_order(child, best, color) == CmpOrdering::Greater {
                best = child;
            }
        }
        Some(best)
    }

    pub fn get_first_child(&self) -> Option<&NodePointer> {
        self.get_children().first()
    }

    /// First child that is neither a pass nor fills one of our own eyes.
    /// Used when the caller refuses to let the engine pass.
    pub fn get_nopass_child(&self, state: &GameState) -> Option<&NodePointer> {
        self.get_children().iter().find(|child| {
            let mv = child.get_move();
            mv != PASS && !state.board().is_eye(state.to_move(), mv as usize)
        })
    }

    /// Detach the child playing `mv`, inflating it if needed. The caller
    /// holds exclusive access (root surgery); remaining siblings are
    /// released when the old root drops.
    pub fn take_child(&mut self, mv: Move) -> Option<Box<UctNode>> {
        let children = self.children_mut();
        let index = children.iter().position(|child| child.get_move() == mv)?;
        let pointer = children.swap_remove(index);
        Some(pointer.into_node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformEvaluator;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn expanded_node(state: &GameState) -> (UctNode, f32) {
        let node = UctNode::new(PASS, 1.0);
        let nodecount = AtomicUsize::new(0);
        let mut eval = 0.0;
        let created = node.create_children(&UniformEvaluator::default(), &nodecount, state, &mut eval);
        assert!(created);
        (node, eval)
    }

    #[test]
    fn test_expansion_creates_sorted_children() {
        let state = GameState::new(5, 7.5);
        let (node, eval) = expanded_node(&state);

        assert!(node.has_children());
        let children = node.get_children();
        // 25 board moves plus the pass
        assert_eq!(children.len(), 26);
        assert!((eval - 0.5).abs() < 1e-6);

        let priors: Vec<f32> = children.iter().map(|c| c.get_policy()).collect();
        let sum: f32 = priors.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "renormalized priors sum to {}", sum);
        assert!(priors.windows(2).all(|w| w[0] >= w[1]), "not sorted: {:?}", priors);
    }

    #[test]
    fn test_expansion_claims_only_once() {
        let state = GameState::new(5, 7.5);
        let node = UctNode::new(PASS, 1.0);
        let nodecount = AtomicUsize::new(0);
        let mut eval = 0.0;
        assert!(node.create_children(&UniformEvaluator::default(), &nodecount, &state, &mut eval));
        assert!(!node.create_children(&UniformEvaluator::default(), &nodecount, &state, &mut eval));
        assert_eq!(nodecount.load(Ordering::Relaxed), 26);
    }

    #[test]
    fn test_no_expansion_after_two_passes() {
        let mut state = GameState::new(5, 7.5);
        state.play_move(PASS);
        state.play_move(PASS);

        let node = UctNode::new(PASS, 1.0);
        let nodecount = AtomicUsize::new(0);
        let mut eval = 0.0;
        assert!(!node.create_children(&UniformEvaluator::default(), &nodecount, &state, &mut eval));
        assert!(!node.has_children());
    }

    #[test]
    fn test_concurrent_expansion_single_winner() {
        for _ in 0..20 {
            let state = GameState::new(5, 7.5);
            let node = UctNode::new(PASS, 1.0);
            let nodecount = AtomicUsize::new(0);
            let winners = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        let mut eval = 0.0;
                        if node.create_children(
                            &UniformEvaluator::default(),
                            &nodecount,
                            &state,
                            &mut eval,
                        ) {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(winners.load(Ordering::Relaxed), 1);
            assert_eq!(node.get_children().len(), 26);
        }
    }

    #[test]
    fn test_expansion_skips_ko_vertex() {
        // Build a board where Black just took a ko; the recapture must not
        // appear among White's children.
        let mut state = GameState::new(5, 7.5);
        let seq = [
            (1, 2),
            (3, 1),
            (2, 1),
            (3, 3),
            (2, 3),
            (4, 2),
            (0, 0),
            (2, 2),
        ];
        for (x, y) in seq {
            state.play_move(state.board().vertex(x, y) as Move);
        }
        state.play_move(state.board().vertex(3, 2) as Move);
        let ko = state.ko_move().expect("ko should be set") as Move;

        let (node, _) = expanded_node(&state);
        assert!(
            node.get_children().iter().all(|c| c.get_move() != ko),
            "ko recapture must be filtered"
        );
    }

    #[test]
    fn test_update_and_get_eval() {
        let node = UctNode::new(0, 0.5);
        node.update(1.0);
        node.update(1.0);
        node.update(1.0);
        node.update(0.0);

        assert_eq!(node.get_visits(), 4);
        assert!((node.get_eval(Color::Black) - 0.75).abs() < 1e-6);
        assert!((node.get_eval(Color::White) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_virtual_loss_repels_and_restores() {
        let node = UctNode::new(0, 0.5);
        node.update(0.5);
        let before = node.get_eval(Color::Black);

        node.virtual_loss();
        // A virtual loss counts as Black losses while Black is to move
        assert!(node.get_eval(Color::Black) < before);
        // ...and as White losses when White is to move
        assert!(node.get_eval(Color::White) < 1.0 - before + 1e-6);

        node.virtual_loss_undo();
        assert_eq!(node.get_virtual_loss(), 0);
        assert!((node.get_eval(Color::Black) - before).abs() < 1e-6);
    }

    #[test]
    fn test_uct_select_prefers_prior_then_unexplored() {
        let state = GameState::new(5, 7.5);
        let (node, _) = expanded_node(&state);
        node.update(0.5);

        let first = node
            .uct_select_child(Color::Black, true, 0.8)
            .expect("children exist");
        // With uniform priors and no visits, selection takes the first
        // (highest-prior) child
        assert_eq!(
            first.get_move(),
            node.get_children()[0].get_move(),
            "first selection should follow priors"
        );
    }

    #[test]
    fn test_uct_select_skips_invalid_children() {
        let state = GameState::new(5, 7.5);
        let (node, _) = expanded_node(&state);
        node.update(0.5);

        let first = node.uct_select_child(Color::Black, true, 0.8).unwrap();
        first.invalidate();
        let second = node.uct_select_child(Color::Black, true, 0.8).unwrap();
        assert_ne!(
            first as *const UctNode, second as *const UctNode,
            "invalidated child must not be selected again"
        );
    }

    #[test]
    fn test_dirichlet_noise_keeps_distribution() {
        let state = GameState::new(5, 7.5);
        let (mut node, _) = expanded_node(&state);
        let mut rng = ChaCha20Rng::seed_from_u64(11);

        node.dirichlet_noise(0.25, 0.03, &mut rng);
        let sum: f32 = node.get_children().iter().map(|c| c.get_policy()).sum();
        assert!((sum - 1.0).abs() < 1e-4, "noised priors sum to {}", sum);
    }

    #[test]
    fn test_randomize_first_proportionally() {
        let state = GameState::new(5, 7.5);
        let (mut node, _) = expanded_node(&state);

        // Give the third child an overwhelming visit count
        let third = &node.get_children()[2];
        third.inflate();
        for _ in 0..1000 {
            third.get().unwrap().update(0.5);
        }
        let third_move = third.get_move();

        let mut rng = ChaCha20Rng::seed_from_u64(3);
        node.randomize_first_proportionally(&mut rng);
        assert_eq!(
            node.get_children()[0].get_move(),
            third_move,
            "dominant child should be swapped to the front"
        );
    }

    #[test]
    fn test_best_root_child_ordering() {
        let state = GameState::new(5, 7.5);
        let (node, _) = expanded_node(&state);

        let children = node.get_children();
        // visits beat no visits
        children[3].inflate();
        children[3].get().unwrap().update(0.1);
        let best = node.get_best_root_child(Color::Black).unwrap();
        assert_eq!(best.get_move(), children[3].get_move());

        // more visits beat fewer, even at worse winrate
        children[5].inflate();
        children[5].get().unwrap().update(0.9);
        children[3].get().unwrap().update(0.1);
        let best = node.get_best_root_child(Color::Black).unwrap();
        assert_eq!(best.get_move(), children[3].get_move());
    }

    /// Double ko on 7x7: ko A around (2,2)/(3,2), ko B around (2,5)/(3,5).
    /// The flips cycle the whole-board position back to its start, which
    /// the simple-ko rule cannot see.
    fn double_ko_state() -> GameState {
        let mut state = GameState::new(7, 7.5);
        let mut play = |s: &mut GameState, x: usize, y: usize| {
            let mv = s.board().vertex(x, y) as Move;
            s.play_move(mv);
        };
        // Walls of both kos, alternating colors
        for (bx, by, wx, wy) in [
            (1, 2, 3, 1),
            (2, 1, 3, 3),
            (2, 3, 4, 2),
            (1, 5, 3, 4),
            (2, 4, 3, 6),
            (2, 6, 4, 5),
        ] {
            play(&mut state, bx, by);
            play(&mut state, wx, wy);
        }
        // Start configuration: ko A held by Black, ko B held by White
        play(&mut state, 3, 2);
        play(&mut state, 2, 5);

        // Black takes ko B, White takes ko A, Black must pass, White
        // takes ko B back. Black retaking ko A would now restore the
        // start position exactly.
        play(&mut state, 3, 5);
        play(&mut state, 2, 2);
        state.play_move(PASS);
        play(&mut state, 2, 5);
        state
    }

    #[test]
    fn test_kill_superkos_removes_repeating_child() {
        let state = double_ko_state();
        let retake = state.board().vertex(3, 2) as Move;

        // The retake is legal under the simple-ko rule (the ban sits on
        // the other ko) but repeats the whole-board position.
        assert!(state.is_move_legal(retake));
        {
            let mut successor = state.clone();
            successor.play_move(retake);
            assert!(successor.superko());
        }

        let (mut node, _) = expanded_node(&state);
        assert!(
            node.get_children().iter().any(|c| c.get_move() == retake),
            "expansion keeps the simple-ko-legal retake"
        );

        node.kill_superkos(&state);
        assert!(
            node.get_children().iter().all(|c| c.get_move() != retake),
            "superko sweep must remove the repeating child"
        );
        assert!(!node.get_children().is_empty());
    }

    #[test]
    fn test_take_child_detaches_subtree() {
        let state = GameState::new(5, 7.5);
        let (mut node, _) = expanded_node(&state);
        let mv = node.get_children()[1].get_move();

        let taken = node.take_child(mv).expect("child exists");
        assert_eq!(taken.get_move(), mv);
        assert_eq!(node.get_children().len(), 25);
        assert!(node.take_child(mv).is_none());
    }

    #[test]
    fn test_get_nopass_child_skips_pass() {
        let state = GameState::new(5, 7.5);
        let (node, _) = expanded_node(&state);
        let child = node.get_nopass_child(&state).unwrap();
        assert_ne!(child.get_move(), PASS);
    }
}
