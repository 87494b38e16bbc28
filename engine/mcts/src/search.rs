//! The parallel search driver.
//!
//! `think` launches the configured number of workers; each one repeatedly
//! copies the root state, descends the tree by PUCT, expands a leaf
//! through the evaluator and backpropagates the Black-perspective eval.
//! Virtual losses are added on the way down and removed on the way back
//! up, which keeps concurrent workers spread over different lines without
//! locking the statistics.
//!
//! The main thread polls the budgets (playouts, wall clock in
//! centiseconds, and an early stop once no other child can catch up) and
//! then clears the run flag; workers finish their current simulation and
//! exit. Between external moves the matching subtree is kept as the new
//! root and the siblings are released.

use crate::evaluator::Evaluator;
use crate::node::UctNode;
use crate::smp::ThreadGroup;
use engine_config::Config;
use goban::{Color, GameState, Move, PASS, RESIGN};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct SearchParams {
    num_threads: usize,
    max_playouts: u32,
    max_time_centis: u32,
    puct: f32,
    resign_threshold: f32,
    noise: bool,
    random_moves: u32,
    dirichlet_alpha: f32,
    dirichlet_epsilon: f32,
}

impl SearchParams {
    fn from_config(cfg: &Config) -> SearchParams {
        SearchParams {
            num_threads: cfg.num_threads(),
            max_playouts: cfg.search.max_playouts,
            max_time_centis: cfg.search.max_time_centis,
            puct: cfg.search.puct,
            resign_threshold: cfg.resign_threshold(),
            noise: cfg.search.noise,
            random_moves: cfg.search.random_moves,
            dirichlet_alpha: cfg.search.dirichlet_alpha,
            dirichlet_epsilon: cfg.search.dirichlet_epsilon,
        }
    }
}

/// Everything a worker needs, shared behind one Arc.
struct WorkerCtx<E: Evaluator> {
    root: Arc<UctNode>,
    root_state: GameState,
    network: Arc<E>,
    nodecount: Arc<AtomicUsize>,
    run: AtomicBool,
    playouts: AtomicUsize,
    params: SearchParams,
}

pub struct UctSearch<E: Evaluator> {
    network: Arc<E>,
    params: SearchParams,
    root_state: GameState,
    root: Arc<UctNode>,
    nodecount: Arc<AtomicUsize>,
    last_playouts: usize,
}

impl<E: Evaluator + 'static> UctSearch<E> {
    pub fn new(cfg: &Config, network: Arc<E>, state: GameState) -> UctSearch<E> {
        UctSearch {
            network,
            params: SearchParams::from_config(cfg),
            root: Arc::new(UctNode::new(PASS, 1.0)),
            root_state: state,
            nodecount: Arc::new(AtomicUsize::new(0)),
            last_playouts: 0,
        }
    }

    #[inline]
    pub fn root_state(&self) -> &GameState {
        &self.root_state
    }

    #[inline]
    pub fn root(&self) -> &UctNode {
        &self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodecount.load(Ordering::Relaxed)
    }

    pub fn last_playouts(&self) -> usize {
        self.last_playouts
    }

    /// Replace the game state and drop the whole tree.
    pub fn set_state(&mut self, state: GameState) {
        self.root_state = state;
        self.root = Arc::new(UctNode::new(PASS, 1.0));
        self.nodecount.store(0, Ordering::Relaxed);
    }

    /// Record an external move (either side): the matching child becomes
    /// the new root and its siblings are released. An unexplored move
    /// starts a fresh root.
    pub fn play_move(&mut self, mv: Move) {
        let new_root = {
            let root = Arc::get_mut(&mut self.root).expect("search is not running");
            if root.has_children() {
                root.decl_single_thread_use();
                let child = root.take_child(mv);
                root.finish_single_thread_use();
                child
            } else {
                None
            }
        };

        self.root = match new_root {
            Some(node) => {
                debug!(
                    mv = %self.root_state.board().move_to_text(mv),
                    visits = node.get_visits(),
                    "reusing subtree as new root"
                );
                Arc::from(node)
            }
            None => Arc::new(UctNode::new(mv, 1.0)),
        };
        self.root_state.play_move(mv);
    }

    /// Step one move back, discarding the tree.
    pub fn undo_move(&mut self) -> bool {
        if self.root_state.undo_move() {
            self.root = Arc::new(UctNode::new(PASS, 1.0));
            true
        } else {
            false
        }
    }

    /// Play an external move for an explicit color, dropping the tree if
    /// the color does not match the side the tree was searched for.
    pub fn play_move_as(&mut self, color: Color, mv: Move) {
        if self.root_state.to_move() != color {
            self.root_state.set_to_move(color);
            self.root = Arc::new(UctNode::new(PASS, 1.0));
        }
        self.play_move(mv);
    }

    /// Search the current position for the side `color` and return the
    /// chosen move (possibly PASS or RESIGN).
    pub fn think(&mut self, color: Color) -> Move {
        if self.root_state.to_move() != color {
            // The tree holds statistics for the other side; start over.
            self.root_state.set_to_move(color);
            self.root = Arc::new(UctNode::new(PASS, 1.0));
        }
        let start = Instant::now();

        self.prepare_root_node();
        if !self.root.has_children() {
            // Two passes already: the game is over, nothing to search.
            return PASS;
        }

        let ctx = Arc::new(WorkerCtx {
            root: Arc::clone(&self.root),
            root_state: self.root_state.clone(),
            network: Arc::clone(&self.network),
            nodecount: Arc::clone(&self.nodecount),
            run: AtomicBool::new(true),
            playouts: AtomicUsize::new(0),
            params: self.params,
        });

        let group = ThreadGroup::new(self.params.num_threads);
        for _ in 0..self.params.num_threads {
            let ctx = Arc::clone(&ctx);
            group.add_task(move || worker_loop(&ctx));
        }

        loop {
            std::thread::sleep(Duration::from_millis(10));
            let elapsed_centis = (start.elapsed().as_secs_f64() * 100.0) as u32;
            let playouts = ctx.playouts.load(Ordering::Relaxed);

            if playouts >= self.params.max_playouts as usize {
                break;
            }
            if self.params.max_time_centis > 0 && elapsed_centis >= self.params.max_time_centis {
                break;
            }
            if self.no_second_chance(playouts, elapsed_centis) {
                debug!("early stop: the best move can no longer be overtaken");
                break;
            }
        }
        ctx.run.store(false, Ordering::Release);
        group.wait_all();

        self.last_playouts = ctx.playouts.load(Ordering::Relaxed);
        drop(ctx);

        self.select_move(color, start)
    }

    /// Expand and clean the root before workers start: claim the first
    /// evaluation as the root's own visit, prune superko children, and mix
    /// in Dirichlet noise for self-play.
    fn prepare_root_node(&mut self) {
        let root = Arc::get_mut(&mut self.root).expect("search is not running");

        if !root.has_children() {
            let mut root_eval = 0.0f32;
            let created = root.create_children(
                self.network.as_ref(),
                &self.nodecount,
                &self.root_state,
                &mut root_eval,
            );
            if created {
                // The +1 visit for the root's own first evaluation
                root.update(root_eval);
                debug!(
                    eval = %format!("{:.2}%", root_eval * 100.0),
                    "expanded root node"
                );
            }
        }

        if root.has_children() {
            root.decl_single_thread_use();
            root.kill_superkos(&self.root_state);
            if self.params.noise {
                let mut rng = ChaCha20Rng::from_entropy();
                root.dirichlet_noise(
                    self.params.dirichlet_epsilon,
                    self.params.dirichlet_alpha,
                    &mut rng,
                );
            }
            root.finish_single_thread_use();
        }
    }

    /// True when the second-best child cannot reach the best one within
    /// the remaining budget.
    fn no_second_chance(&self, playouts: usize, elapsed_centis: u32) -> bool {
        if playouts == 0 {
            return false;
        }
        let children = self.root.get_children();
        if children.is_empty() {
            return false;
        }

        let mut first = 0i32;
        let mut second = 0i32;
        for child in children {
            let visits = child.get_visits();
            if visits > first {
                second = first;
                first = visits;
            } else if visits > second {
                second = visits;
            }
        }

        let mut remaining = self.params.max_playouts.saturating_sub(playouts as u32) as f64;
        if self.params.max_time_centis > 0 && elapsed_centis > 0 {
            let rate = playouts as f64 / elapsed_centis as f64;
            let time_left = self
                .params
                .max_time_centis
                .saturating_sub(elapsed_centis) as f64;
            remaining = remaining.min(rate * time_left);
        }

        (second as f64 + remaining) < first as f64
    }

    fn select_move(&mut self, color: Color, start: Instant) -> Move {
        // Opening temperature for self-play: pick proportionally to visits
        let randomize = (self.root_state.movenum() as u32) < self.params.random_moves;
        if randomize {
            let root = Arc::get_mut(&mut self.root).expect("workers joined");
            let mut rng = ChaCha20Rng::from_entropy();
            root.decl_single_thread_use();
            root.randomize_first_proportionally(&mut rng);
            root.finish_single_thread_use();
        }

        let best = if randomize {
            self.root.get_first_child()
        } else {
            self.root.get_best_root_child(color)
        };
        let Some(best) = best else {
            return PASS;
        };

        let best_move = best.get_move();
        let winrate = best
            .get()
            .map_or_else(|| self.root.get_net_eval(color), |node| node.get_eval(color));

        info!(
            mv = %self.root_state.board().move_to_text(best_move),
            winrate = %format!("{:.2}%", winrate * 100.0),
            playouts = self.last_playouts,
            nodes = self.node_count(),
            centis = (start.elapsed().as_secs_f64() * 100.0) as u64,
            "search finished"
        );

        if self.should_resign(winrate) {
            info!(
                winrate = %format!("{:.2}%", winrate * 100.0),
                "below resign threshold"
            );
            return RESIGN;
        }

        best_move
    }

    fn should_resign(&self, winrate: f32) -> bool {
        if self.params.resign_threshold <= 0.0 {
            return false;
        }
        let size = self.root_state.board().size();
        // Too early in the game to judge
        if self.root_state.movenum() <= size * size / 4 {
            return false;
        }
        winrate < self.params.resign_threshold
    }

    fn worker_ctx(&self) -> WorkerCtx<E> {
        WorkerCtx {
            root: Arc::clone(&self.root),
            root_state: self.root_state.clone(),
            network: Arc::clone(&self.network),
            nodecount: Arc::clone(&self.nodecount),
            run: AtomicBool::new(true),
            playouts: AtomicUsize::new(0),
            params: self.params,
        }
    }

    /// Run exactly `per_thread` completed simulations on each of `threads`
    /// workers, synchronously. Test and benchmark support: the visit
    /// accounting afterwards is exact.
    pub fn run_parallel_playouts(&self, threads: usize, per_thread: usize) {
        let ctx = Arc::new(self.worker_ctx());
        std::thread::scope(|scope| {
            for _ in 0..threads {
                let ctx = Arc::clone(&ctx);
                scope.spawn(move || {
                    let mut done = 0;
                    while done < per_thread {
                        let mut state = ctx.root_state.clone();
                        if play_simulation(&ctx, &mut state, &ctx.root).is_some() {
                            done += 1;
                        }
                    }
                });
            }
        });
    }
}

fn worker_loop<E: Evaluator>(ctx: &WorkerCtx<E>) {
    loop {
        if !ctx.run.load(Ordering::Acquire) {
            break;
        }
        if ctx.playouts.load(Ordering::Relaxed) >= ctx.params.max_playouts as usize {
            break;
        }
        let mut state = ctx.root_state.clone();
        if play_simulation(ctx, &mut state, &ctx.root).is_some() {
            ctx.playouts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One descent. Returns the Black-perspective eval of the reached leaf, or
/// None when the simulation was abandoned (an expansion race was lost or a
/// superko child was discovered); abandoned simulations update nothing.
fn play_simulation<E: Evaluator>(
    ctx: &WorkerCtx<E>,
    state: &mut GameState,
    node: &UctNode,
) -> Option<f32> {
    let color = state.to_move();
    let is_root = std::ptr::eq(node, ctx.root.as_ref());
    let mut result: Option<f32> = None;

    node.virtual_loss();

    if !node.has_children() {
        if state.passes() >= 2 {
            // Terminal: the exact score decides
            result = Some(score_to_eval(state.final_score()));
        } else {
            let mut eval = 0.0f32;
            if node.create_children(ctx.network.as_ref(), &ctx.nodecount, state, &mut eval) {
                result = Some(eval);
            }
            // Losing the expansion race abandons the simulation; the
            // loser's virtual loss already steered other workers away.
        }
    }

    if result.is_none() && node.has_children() {
        if let Some(next) = node.uct_select_child(color, is_root, ctx.params.puct) {
            let mv = next.get_move();
            state.play_move(mv);
            if mv != PASS && state.superko() {
                next.invalidate();
            } else {
                result = play_simulation(ctx, state, next);
            }
        }
    }

    if let Some(eval) = result {
        node.update(eval);
    }
    node.virtual_loss_undo();

    result
}

/// Map a Tromp-Taylor score (Black positive) onto the eval scale.
fn score_to_eval(score: f32) -> f32 {
    if score > 1e-4 {
        1.0
    } else if score < -1e-4 {
        0.0
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformEvaluator;
    use crate::node_pointer::NodePointer;

    fn test_config(playouts: u32, threads: usize) -> Config {
        let mut cfg = Config::default();
        cfg.search.max_playouts = playouts;
        cfg.search.num_threads = threads;
        cfg.search.max_time_centis = 0;
        cfg.search.resign_percent = 0.0;
        cfg
    }

    fn make_search(size: usize, komi: f32, playouts: u32, threads: usize) -> UctSearch<UniformEvaluator> {
        UctSearch::new(
            &test_config(playouts, threads),
            Arc::new(UniformEvaluator::default()),
            GameState::new(size, komi),
        )
    }

    /// Sum of visits over the inflated subtree below `pointer`, and the
    /// check that no virtual losses are left anywhere.
    fn walk(pointer: &NodePointer, visit_total: &mut i64) {
        if let Some(node) = pointer.get() {
            assert_eq!(
                node.get_virtual_loss(),
                0,
                "virtual losses must cancel out after the search"
            );
            *visit_total += node.get_visits() as i64;
            for child in node.get_children() {
                walk(child, visit_total);
            }
        }
    }

    #[test]
    fn test_serial_visit_accounting() {
        let search = make_search(5, 0.0, 100, 1);
        search.run_parallel_playouts(1, 100);

        let root = search.root();
        assert_eq!(root.get_visits(), 100);

        // The root's own expansion counts as one visit; the rest descend
        let children_visits: i64 = root
            .get_children()
            .iter()
            .map(|c| c.get_visits() as i64)
            .sum();
        assert_eq!(root.get_visits() as i64, 1 + children_visits);
    }

    #[test]
    fn test_parallel_search_consistency() {
        // Four workers, ten thousand completed simulations each, against a
        // constant-policy evaluator: statistics must come out exact.
        let search = make_search(9, 0.0, 40_000, 4);
        search.run_parallel_playouts(4, 10_000);

        let root = search.root();
        assert_eq!(root.get_visits(), 40_000);

        let mut children_visits = 0i64;
        let mut subtree_visits = 0i64;
        for child in root.get_children() {
            children_visits += child.get_visits() as i64;
            walk(child, &mut subtree_visits);
        }
        assert_eq!(root.get_visits() as i64, 1 + children_visits);
        assert_eq!(root.get_virtual_loss(), 0);

        // With every eval pinned at 0.5 (komi 0 makes even the terminal
        // double-pass lines score to a draw), all winrates are exact
        for child in root.get_children() {
            if child.get_visits() > 0 {
                let node = child.get().unwrap();
                let winrate = node.get_eval(Color::Black);
                assert!(
                    (winrate - 0.5).abs() < 1e-3,
                    "child winrate {} drifted from 0.5",
                    winrate
                );
            }
        }
    }

    #[test]
    fn test_think_returns_legal_move() {
        let mut search = make_search(5, 7.5, 200, 2);
        let mv = search.think(Color::Black);
        assert_ne!(mv, RESIGN);
        assert!(search.root_state().is_move_legal(mv));
        assert!(search.last_playouts() >= 200);
    }

    #[test]
    fn test_think_on_finished_game_passes() {
        let mut search = make_search(5, 7.5, 100, 1);
        search.play_move(PASS);
        search.play_move(PASS);
        assert_eq!(search.think(Color::Black), PASS);
    }

    #[test]
    fn test_tree_reuse_on_play_move() {
        let mut search = make_search(5, 7.5, 300, 2);
        search.think(Color::Black);

        let mv = search
            .root()
            .get_best_root_child(Color::Black)
            .unwrap()
            .get_move();
        let child_visits = search
            .root()
            .get_children()
            .iter()
            .find(|c| c.get_move() == mv)
            .unwrap()
            .get_visits();

        search.play_move(mv);
        assert_eq!(
            search.root().get_visits(),
            child_visits,
            "the chosen child's statistics carry over to the new root"
        );
        assert_eq!(search.root().get_move(), mv);
    }

    #[test]
    fn test_play_move_without_tree_starts_fresh() {
        let mut search = make_search(5, 7.5, 100, 1);
        let mv = search.root_state().board().vertex(2, 2) as Move;
        search.play_move(mv);
        assert_eq!(search.root().get_visits(), 0);
        assert_eq!(search.root_state().movenum(), 1);
    }

    #[test]
    fn test_undo_move_rolls_back() {
        let mut search = make_search(5, 7.5, 100, 1);
        assert!(!search.undo_move());

        let mv = search.root_state().board().vertex(1, 1) as Move;
        search.play_move(mv);
        assert!(search.undo_move());
        assert_eq!(search.root_state().movenum(), 0);
    }

    #[test]
    fn test_score_to_eval_mapping() {
        assert_eq!(score_to_eval(3.5), 1.0);
        assert_eq!(score_to_eval(-0.5), 0.0);
        assert_eq!(score_to_eval(0.0), 0.5);
    }

    /// Uniform priors, but Black is always nearly lost regardless of who
    /// is to move.
    struct BlackIsLostEvaluator;

    impl Evaluator for BlackIsLostEvaluator {
        fn evaluate(
            &self,
            state: &GameState,
        ) -> Result<network::NetResult, network::NetworkError> {
            let mut result = UniformEvaluator::default().evaluate(state)?;
            // The winrate is for the side to move; keep Black at 1%.
            result.winrate = match state.to_move() {
                Color::Black => 0.01,
                Color::White => 0.99,
            };
            Ok(result)
        }
    }

    #[test]
    fn test_resignation_when_hopeless() {
        let mut cfg = test_config(100, 1);
        cfg.search.resign_percent = 10.0;
        let mut search = UctSearch::new(
            &cfg,
            Arc::new(BlackIsLostEvaluator),
            GameState::new(5, 7.5),
        );
        // Get past the opening guard (movenum > 25 / 4)
        for i in 0..8 {
            let mv = search.root_state().board().vertex(i % 5, i / 5) as Move;
            search.play_move(mv);
        }
        let mv = search.think(Color::Black);
        assert_eq!(mv, RESIGN);
    }
}
