//! Table of live relay pairs.
//!
//! A pair is registered once both sockets exist and released by whichever
//! teardown path runs first. Releasing an id that is no longer present is a
//! no-op, which is what makes teardown idempotent.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Unique pair identifier.
pub type PairId = u64;

/// Bookkeeping for one registered pair.
#[derive(Debug, Clone)]
pub struct PairRecord {
    /// Pair identifier
    pub id: PairId,
    /// Client peer address
    pub client: SocketAddr,
    /// Upstream peer address
    pub upstream: SocketAddrV4,
    /// Registration time
    pub opened_at: Instant,
}

impl PairRecord {
    /// Time since the pair was registered.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Registry of live pairs, bounded by a capacity.
pub struct PairRegistry {
    pairs: Mutex<HashMap<PairId, PairRecord>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl PairRegistry {
    /// Create a registry holding at most `capacity` pairs.
    pub fn new(capacity: usize) -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Register a pair and return its id.
    pub fn register(&self, client: SocketAddr, upstream: SocketAddrV4) -> Result<PairId> {
        let mut pairs = self.pairs.lock();
        if pairs.len() >= self.capacity {
            return Err(Error::ResourceExhausted(self.capacity));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        pairs.insert(
            id,
            PairRecord {
                id,
                client,
                upstream,
                opened_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Remove a pair. Returns `None` if it was already released.
    pub fn release(&self, id: PairId) -> Option<PairRecord> {
        self.pairs.lock().remove(&id)
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: PairId) -> bool {
        self.pairs.lock().contains_key(&id)
    }

    /// Number of live pairs.
    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Whether no pair is live.
    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }

    /// Whether another pair would be refused.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Maximum number of live pairs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of every live record.
    pub fn snapshot(&self) -> Vec<PairRecord> {
        self.pairs.lock().values().cloned().collect()
    }
}
