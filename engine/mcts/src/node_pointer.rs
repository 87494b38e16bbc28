//! Lazily inflated child handles.
//!
//! A freshly expanded node would waste most of its memory on children that
//! are never visited. A [`NodePointer`] therefore starts as a packed
//! (move, prior) pair inside a single atomic word and only becomes a heap
//! allocated [`UctNode`] when a selection actually descends into it. The
//! inflation is a compare-exchange: under concurrent selection exactly one
//! thread's node wins and the losers free theirs.
//!
//! Word layout: an inflated handle stores the node address (always
//! aligned, so the low bit is 0); an uninflated handle sets the low bit
//! and keeps the prior's f32 bits in the high half and the move in bits
//! 16..32.

use crate::node::UctNode;
use goban::Move;
use std::sync::atomic::{AtomicU64, Ordering};

const UNINFLATED_TAG: u64 = 1;

fn pack(mv: Move, policy: f32) -> u64 {
    ((policy.to_bits() as u64) << 32) | (((mv as u16) as u64) << 16) | UNINFLATED_TAG
}

enum Repr {
    Inflated(*mut UctNode),
    Uninflated { mv: Move, policy: f32 },
}

pub struct NodePointer {
    data: AtomicU64,
}

// The raw pointer is owned by this handle alone; UctNode itself is Sync.
unsafe impl Send for NodePointer {}
unsafe impl Sync for NodePointer {}

impl NodePointer {
    pub fn new(mv: Move, policy: f32) -> NodePointer {
        NodePointer {
            data: AtomicU64::new(pack(mv, policy)),
        }
    }

    fn read(&self) -> Repr {
        let data = self.data.load(Ordering::Acquire);
        if data & UNINFLATED_TAG != 0 {
            Repr::Uninflated {
                mv: (data >> 16) as u16 as i16,
                policy: f32::from_bits((data >> 32) as u32),
            }
        } else {
            Repr::Inflated(data as *mut UctNode)
        }
    }

    pub fn is_inflated(&self) -> bool {
        matches!(self.read(), Repr::Inflated(_))
    }

    /// Turn the packed pair into a real node. Loses the race gracefully:
    /// if another thread inflated first, our allocation is dropped and
    /// theirs is used.
    pub fn inflate(&self) {
        loop {
            let current = self.data.load(Ordering::Acquire);
            if current & UNINFLATED_TAG == 0 {
                return;
            }
            let mv = (current >> 16) as u16 as i16;
            let policy = f32::from_bits((current >> 32) as u32);
            let node = Box::into_raw(Box::new(UctNode::new(mv, policy)));
            debug_assert_eq!(node as u64 & UNINFLATED_TAG, 0);
            match self.data.compare_exchange(
                current,
                node as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => {
                    // Someone else inflated or mutated; retry with theirs.
                    drop(unsafe { Box::from_raw(node) });
                }
            }
        }
    }

    /// The inflated node, if any.
    pub fn get(&self) -> Option<&UctNode> {
        match self.read() {
            Repr::Inflated(ptr) => Some(unsafe { &*ptr }),
            Repr::Uninflated { .. } => None,
        }
    }

    /// Exclusive access to the inflated node.
    pub fn get_mut(&mut self) -> Option<&mut UctNode> {
        match self.read() {
            Repr::Inflated(ptr) => Some(unsafe { &mut *ptr }),
            Repr::Uninflated { .. } => None,
        }
    }

    /// Take ownership of the node, inflating if necessary. Used when a
    /// child becomes the new search root.
    pub fn into_node(self) -> Box<UctNode> {
        self.inflate();
        let data = self.data.load(Ordering::Acquire);
        std::mem::forget(self);
        unsafe { Box::from_raw(data as *mut UctNode) }
    }

    pub fn get_move(&self) -> Move {
        match self.read() {
            Repr::Inflated(ptr) => unsafe { &*ptr }.get_move(),
            Repr::Uninflated { mv, .. } => mv,
        }
    }

    pub fn get_policy(&self) -> f32 {
        match self.read() {
            Repr::Inflated(ptr) => unsafe { &*ptr }.get_policy(),
            Repr::Uninflated { policy, .. } => policy,
        }
    }

    /// Update the prior. Requires exclusive access (root preparation).
    pub fn set_policy(&mut self, policy: f32) {
        match self.read() {
            Repr::Inflated(ptr) => unsafe { &mut *ptr }.set_policy(policy),
            Repr::Uninflated { mv, .. } => {
                self.data.store(pack(mv, policy), Ordering::Release);
            }
        }
    }

    /// Visit count; an uninflated child has never been visited.
    pub fn get_visits(&self) -> i32 {
        self.get().map_or(0, |node| node.get_visits())
    }

    pub fn valid(&self) -> bool {
        self.get().map_or(true, |node| node.valid())
    }

    pub fn active(&self) -> bool {
        self.get().map_or(true, |node| node.active())
    }
}

impl Drop for NodePointer {
    fn drop(&mut self) {
        if let Repr::Inflated(ptr) = self.read() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninflated_roundtrip() {
        let pointer = NodePointer::new(42, 0.25);
        assert!(!pointer.is_inflated());
        assert_eq!(pointer.get_move(), 42);
        assert!((pointer.get_policy() - 0.25).abs() < 1e-6);
        assert_eq!(pointer.get_visits(), 0);
        assert!(pointer.get().is_none());
    }

    #[test]
    fn test_pass_move_packs() {
        let pointer = NodePointer::new(goban::PASS, 0.5);
        assert_eq!(pointer.get_move(), goban::PASS);
    }

    #[test]
    fn test_inflation_preserves_move_and_policy() {
        let pointer = NodePointer::new(17, 0.125);
        pointer.inflate();
        assert!(pointer.is_inflated());
        assert_eq!(pointer.get_move(), 17);
        assert!((pointer.get_policy() - 0.125).abs() < 1e-6);
        let node = pointer.get().unwrap();
        assert_eq!(node.get_visits(), 0);
    }

    #[test]
    fn test_concurrent_inflation_single_winner() {
        for _ in 0..50 {
            let pointer = NodePointer::new(5, 0.1);
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| pointer.inflate());
                }
            });
            assert!(pointer.is_inflated());
            // All threads observe the same node
            let addrs: Vec<_> = (0..4)
                .map(|_| pointer.get().unwrap() as *const UctNode as usize)
                .collect();
            assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        }
    }

    #[test]
    fn test_into_node_takes_ownership() {
        let pointer = NodePointer::new(9, 0.3);
        let node = pointer.into_node();
        assert_eq!(node.get_move(), 9);
    }

    #[test]
    fn test_set_policy_both_representations() {
        let mut pointer = NodePointer::new(3, 0.1);
        pointer.set_policy(0.9);
        assert!((pointer.get_policy() - 0.9).abs() < 1e-6);

        pointer.inflate();
        pointer.set_policy(0.4);
        assert!((pointer.get_policy() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_negative_policy_survives_packing() {
        // Priors are never negative in practice, but the packing must not
        // mangle arbitrary f32 bit patterns.
        let pointer = NodePointer::new(7, -0.0);
        assert_eq!(pointer.get_policy().to_bits(), (-0.0f32).to_bits());
    }
}
