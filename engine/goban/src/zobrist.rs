//! Zobrist hashing keys.
//!
//! One 64-bit key per (vertex, color) pair, plus keys for the ko vertex,
//! the pass counter and the side to move. The table is generated once from
//! a fixed seed so hashes are stable across runs and processes.

use crate::board::NUM_VERTICES;
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const ZOBRIST_SEED: u64 = 0x5eed_c0de_0451_0721;

/// Base value of the empty-position hash.
pub const EMPTY_HASH: u64 = 0x1234_5678_8765_4321;

pub struct Zobrist {
    /// Keys for a Black/White stone on each vertex.
    pub stones: [[u64; NUM_VERTICES]; 2],
    /// Keys for the forbidden ko vertex; index NUM_VERTICES means "no ko".
    pub ko: [u64; NUM_VERTICES + 1],
    /// Keys for the trailing pass count (capped at 3).
    pub passes: [u64; 4],
    /// Key XORed in when White is to move.
    pub white_to_move: u64,
}

static TABLE: Lazy<Zobrist> = Lazy::new(|| {
    let mut rng = ChaCha20Rng::seed_from_u64(ZOBRIST_SEED);
    let mut stones = [[0u64; NUM_VERTICES]; 2];
    for row in stones.iter_mut() {
        for key in row.iter_mut() {
            *key = rng.gen();
        }
    }
    let mut ko = [0u64; NUM_VERTICES + 1];
    for key in ko.iter_mut() {
        *key = rng.gen();
    }
    let mut passes = [0u64; 4];
    for key in passes.iter_mut() {
        *key = rng.gen();
    }
    Zobrist {
        stones,
        ko,
        passes,
        white_to_move: rng.gen(),
    }
});

/// Shared access to the key table.
pub fn zobrist() -> &'static Zobrist {
    &TABLE
}
