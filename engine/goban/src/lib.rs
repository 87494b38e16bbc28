//! Incremental Go board and game state.
//!
//! This crate holds the pure data layer of the engine: the [`Board`] with
//! union-find string tracking and incremental liberty counts, the Zobrist
//! hashing tables, the [`KoState`] layer that adds ko and positional-superko
//! detection, and the [`GameState`] that carries the move history the
//! evaluator consumes.
//!
//! Everything here is plain by-value data: states are cloned freely during
//! the tree search and no type in this crate spawns threads or blocks.

mod board;
mod game_state;
mod ko_state;
mod zobrist;

pub use board::{Board, Cell, Color, Move, MAX_BOARD_SIZE, NUM_VERTICES, PASS, RESIGN};
pub use game_state::{GameState, HISTORY_MOVES};
pub use ko_state::KoState;
pub use zobrist::zobrist;
