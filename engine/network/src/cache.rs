//! Bounded cache of network evaluations.
//!
//! Keyed by the 64-bit state hash. Eviction is by insertion order: a queue
//! of keys runs alongside the map and the oldest entries fall out when the
//! capacity is exceeded. All operations take one short critical section, so
//! readers never observe torn results.

use crate::network::NetResult;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Lower bound on the entry count regardless of the playout budget.
const MIN_CACHE_ENTRIES: usize = 6_000;

/// Cache entries kept per configured playout.
const ENTRIES_PER_PLAYOUT: usize = 18;

struct CacheInner {
    map: HashMap<u64, NetResult>,
    order: VecDeque<u64>,
    capacity: usize,
    hits: u64,
    lookups: u64,
}

pub struct EvalCache {
    inner: Mutex<CacheInner>,
}

impl EvalCache {
    pub fn new(capacity: usize) -> EvalCache {
        EvalCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity,
                hits: 0,
                lookups: 0,
            }),
        }
    }

    /// Size the cache for a playout budget (roughly 18 entries per playout).
    pub fn with_size_from_playouts(playouts: u32) -> EvalCache {
        let capacity = (playouts as usize)
            .saturating_mul(ENTRIES_PER_PLAYOUT)
            .max(MIN_CACHE_ENTRIES);
        debug!(capacity, playouts, "sized evaluation cache");
        EvalCache::new(capacity)
    }

    /// Look up a cached evaluation by state hash.
    pub fn lookup(&self, hash: u64) -> Option<NetResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.lookups += 1;
        let result = inner.map.get(&hash).cloned();
        if result.is_some() {
            inner.hits += 1;
        }
        result
    }

    /// Insert an evaluation. An existing entry for the hash is kept as-is;
    /// results for the same position are interchangeable.
    pub fn insert(&self, hash: u64, result: NetResult) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&hash) {
            return;
        }
        inner.map.insert(hash, result);
        inner.order.push_back(hash);
        while inner.order.len() > inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
    }

    /// (hits, lookups, entries) since construction.
    pub fn stats(&self) -> (u64, u64, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.hits, inner.lookups, inner.map.len())
    }
}
