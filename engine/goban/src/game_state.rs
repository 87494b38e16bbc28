//! Full game state: ko tracking plus the move history the evaluator needs.
//!
//! `GameState` keeps a snapshot of the [`KoState`] after every move. The
//! last eight snapshots become the network input planes, and the full list
//! supports `undo_move` for the GTP surface.

use crate::board::{Board, Color, Move};
use crate::ko_state::KoState;

/// Number of past positions the evaluator consumes.
pub const HISTORY_MOVES: usize = 8;

#[derive(Clone)]
pub struct GameState {
    state: KoState,
    /// Snapshot after every move; index m is the state at move number m.
    game_history: Vec<KoState>,
    komi: f32,
}

impl GameState {
    pub fn new(size: usize, komi: f32) -> GameState {
        let state = KoState::new(size);
        GameState {
            game_history: vec![state.clone()],
            state,
            komi,
        }
    }

    /// Restart on a fresh board.
    pub fn reset(&mut self, size: usize, komi: f32) {
        self.state.reset(size);
        self.komi = komi;
        self.game_history.clear();
        self.game_history.push(self.state.clone());
    }

    #[inline]
    pub fn board(&self) -> &Board {
        self.state.board()
    }

    #[inline]
    pub fn to_move(&self) -> Color {
        self.state.to_move()
    }

    /// Override the side to move (GTP allows either side to move next).
    #[inline]
    pub fn set_to_move(&mut self, color: Color) {
        self.state.set_to_move(color);
    }

    #[inline]
    pub fn movenum(&self) -> usize {
        self.state.movenum()
    }

    #[inline]
    pub fn passes(&self) -> u32 {
        self.state.passes()
    }

    #[inline]
    pub fn ko_move(&self) -> Option<usize> {
        self.state.ko_move()
    }

    #[inline]
    pub fn komi(&self) -> f32 {
        self.komi
    }

    #[inline]
    pub fn set_komi(&mut self, komi: f32) {
        self.komi = komi;
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.state.hash()
    }

    #[inline]
    pub fn symmetry_hash(&self, symmetry: usize) -> u64 {
        self.state.symmetry_hash(symmetry)
    }

    #[inline]
    pub fn superko(&self) -> bool {
        self.state.superko()
    }

    #[inline]
    pub fn is_move_legal(&self, mv: Move) -> bool {
        self.state.is_move_legal(mv)
    }

    /// Play a move for the side to move and snapshot the result.
    pub fn play_move(&mut self, mv: Move) {
        self.state.play_move(mv);
        // A play after undo discards the abandoned continuation.
        self.game_history.truncate(self.state.movenum());
        self.game_history.push(self.state.clone());
    }

    /// Step one move back. Returns false at the start of the game.
    pub fn undo_move(&mut self) -> bool {
        let movenum = self.state.movenum();
        if movenum == 0 {
            return false;
        }
        self.state = self.game_history[movenum - 1].clone();
        true
    }

    /// The board as it was `moves_ago` plies back (0 = current).
    /// Callers keep `moves_ago <= movenum`.
    pub fn past_board(&self, moves_ago: usize) -> &Board {
        debug_assert!(moves_ago <= self.state.movenum());
        self.game_history[self.state.movenum() - moves_ago].board()
    }

    /// Tromp-Taylor score from Black's point of view, komi applied.
    pub fn final_score(&self) -> f32 {
        self.board().area_score(self.komi)
    }
}
