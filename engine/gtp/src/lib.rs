//! The engine surface a GTP controller drives.
//!
//! The command loop, flag parsing and I/O live outside the core; this
//! crate exposes just the six operations the protocol needs, mapped onto
//! the search and game state. Moves travel as GTP text ("D4", "pass",
//! "resign"); colors as [`goban::Color`].

use engine_config::Config;
use goban::{Color, GameState, RESIGN};
use mcts::{Evaluator, UctSearch};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GtpError {
    #[error("invalid vertex \"{0}\"")]
    InvalidVertex(String),

    #[error("illegal move {0}")]
    IllegalMove(String),

    #[error("unsupported board size {0}")]
    UnsupportedSize(usize),

    #[error("cannot undo: no moves played")]
    NothingToUndo,
}

/// The production engine type: the search backed by the convolutional
/// policy/value network.
pub type NetworkEngine = GtpEngine<network::Network>;

/// The engine behind a GTP controller: one game, one search tree.
pub struct GtpEngine<E: Evaluator> {
    search: UctSearch<E>,
    cfg: Config,
    network: Arc<E>,
}

impl<E: Evaluator + 'static> GtpEngine<E> {
    pub fn new(cfg: Config, network: Arc<E>, size: usize, komi: f32) -> GtpEngine<E> {
        let search = UctSearch::new(&cfg, Arc::clone(&network), GameState::new(size, komi));
        GtpEngine {
            search,
            cfg,
            network,
        }
    }

    #[inline]
    pub fn state(&self) -> &GameState {
        self.search.root_state()
    }

    /// Search for the best move for `color`, play it, and return its GTP
    /// text ("pass" and "resign" included).
    pub fn genmove(&mut self, color: Color) -> String {
        let mv = self.search.think(color);
        if mv != RESIGN {
            self.search.play_move(mv);
        }
        self.state().board().move_to_text(mv)
    }

    /// Play an external move given as GTP text.
    pub fn play(&mut self, color: Color, vertex: &str) -> Result<(), GtpError> {
        let mv = self
            .state()
            .board()
            .text_to_move(vertex)
            .ok_or_else(|| GtpError::InvalidVertex(vertex.to_string()))?;
        if mv == RESIGN {
            return Err(GtpError::InvalidVertex(vertex.to_string()));
        }

        // Legality is judged for the color actually playing
        let mut probe = self.state().clone();
        probe.set_to_move(color);
        if !probe.is_move_legal(mv) {
            return Err(GtpError::IllegalMove(vertex.to_string()));
        }

        self.search.play_move_as(color, mv);
        Ok(())
    }

    /// Take back the last move.
    pub fn undo(&mut self) -> Result<(), GtpError> {
        if self.search.undo_move() {
            Ok(())
        } else {
            Err(GtpError::NothingToUndo)
        }
    }

    /// Start a fresh game.
    pub fn clear_board(&mut self, size: usize, komi: f32) -> Result<(), GtpError> {
        if !(3..=goban::MAX_BOARD_SIZE).contains(&size) || size % 2 == 0 {
            return Err(GtpError::UnsupportedSize(size));
        }
        info!(size, komi, "clearing board");
        self.search = UctSearch::new(
            &self.cfg,
            Arc::clone(&self.network),
            GameState::new(size, komi),
        );
        Ok(())
    }

    /// Tromp-Taylor result in GTP form: "B+2.5", "W+0.5" or "0".
    pub fn final_score(&self) -> String {
        let score = self.state().final_score();
        if score > 1e-4 {
            format!("B+{:.1}", score)
        } else if score < -1e-4 {
            format!("W+{:.1}", -score)
        } else {
            "0".to_string()
        }
    }

    /// ASCII rendering of the current position.
    pub fn showboard(&self) -> String {
        self.state().board().serialize_board()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcts::UniformEvaluator;

    fn engine(playouts: u32) -> GtpEngine<UniformEvaluator> {
        let mut cfg = Config::default();
        cfg.search.max_playouts = playouts;
        cfg.search.num_threads = 2;
        cfg.search.max_time_centis = 0;
        cfg.search.resign_percent = 0.0;
        GtpEngine::new(cfg, Arc::new(UniformEvaluator::default()), 5, 7.5)
    }

    #[test]
    fn test_play_and_showboard() {
        let mut engine = engine(10);
        engine.play(Color::Black, "C3").unwrap();
        let board = engine.showboard();
        assert!(board.contains('X'), "black stone should be rendered:\n{}", board);
        assert_eq!(engine.state().movenum(), 1);
    }

    #[test]
    fn test_play_rejects_bad_vertices() {
        let mut engine = engine(10);
        assert!(matches!(
            engine.play(Color::Black, "I1"),
            Err(GtpError::InvalidVertex(_))
        ));
        assert!(matches!(
            engine.play(Color::Black, "Z9"),
            Err(GtpError::InvalidVertex(_))
        ));

        engine.play(Color::Black, "C3").unwrap();
        assert!(matches!(
            engine.play(Color::White, "C3"),
            Err(GtpError::IllegalMove(_))
        ));
    }

    #[test]
    fn test_play_accepts_pass() {
        let mut engine = engine(10);
        engine.play(Color::Black, "pass").unwrap();
        assert_eq!(engine.state().passes(), 1);
    }

    #[test]
    fn test_genmove_plays_its_move() {
        let mut engine = engine(50);
        let text = engine.genmove(Color::Black);
        assert_ne!(text, "resign");
        assert_eq!(engine.state().movenum(), 1);
        assert_eq!(engine.state().to_move(), Color::White);
        // The reply must parse back as a vertex or pass
        assert!(engine.state().board().text_to_move(&text).is_some());
    }

    #[test]
    fn test_undo() {
        let mut engine = engine(10);
        assert!(matches!(engine.undo(), Err(GtpError::NothingToUndo)));
        engine.play(Color::Black, "C3").unwrap();
        engine.undo().unwrap();
        assert_eq!(engine.state().movenum(), 0);
    }

    #[test]
    fn test_clear_board() {
        let mut engine = engine(10);
        engine.play(Color::Black, "C3").unwrap();
        engine.clear_board(9, 5.5).unwrap();
        assert_eq!(engine.state().movenum(), 0);
        assert_eq!(engine.state().board().size(), 9);
        assert!((engine.state().komi() - 5.5).abs() < 1e-6);

        assert!(matches!(
            engine.clear_board(8, 5.5),
            Err(GtpError::UnsupportedSize(8))
        ));
        assert!(matches!(
            engine.clear_board(25, 5.5),
            Err(GtpError::UnsupportedSize(25))
        ));
    }

    #[test]
    fn test_final_score_empty_board() {
        let engine = engine(10);
        // Empty board: White takes the komi
        assert_eq!(engine.final_score(), "W+7.5");
    }

    #[test]
    fn test_out_of_turn_play() {
        let mut engine = engine(10);
        // White plays first; the engine follows the controller
        engine.play(Color::White, "C3").unwrap();
        assert_eq!(engine.state().to_move(), Color::Black);
        engine.play(Color::Black, "D3").unwrap();
        assert_eq!(engine.state().movenum(), 2);
    }
}
