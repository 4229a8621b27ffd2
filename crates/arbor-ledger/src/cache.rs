//! Bounded LRU caches over blocks.
//!
//! The ledger keeps two of these: one for headers (body-less blocks) and
//! one for fully reconstructed blocks. Entries are shared as `Arc` so
//! readers never hold references into the cache itself. Reorg and
//! truncation paths must invalidate eagerly — a stale `in_trunk` flag is
//! an observable correctness bug, not a performance issue.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use arbor_core::types::{Block, Hash256};

/// A bounded LRU cache of blocks keyed by block id.
#[derive(Debug)]
pub struct BlockCache {
    inner: Mutex<LruCache<Hash256, Arc<Block>>>,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Hash256, Arc<Block>>> {
        // A poisoned cache mutex only means a panic elsewhere mid-insert;
        // the LRU contents are still structurally valid.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a block, promoting it to most-recently-used.
    pub fn get(&self, block_id: &Hash256) -> Option<Arc<Block>> {
        self.lock().get(block_id).cloned()
    }

    /// Insert a block keyed by its own id, evicting the LRU entry if full.
    pub fn add(&self, block: Arc<Block>) {
        self.lock().put(block.block_id, block);
    }

    /// Drop a block from the cache.
    pub fn remove(&self, block_id: &Hash256) {
        self.lock().pop(block_id);
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
