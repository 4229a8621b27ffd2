//! Ledger tunables.
//!
//! Process-wide configuration applied when a ledger opens. Production
//! deployments keep the defaults; `disable_tx_dedup` exists for test
//! rigs that replay known-unique transactions and must stay `false`
//! everywhere else.

use arbor_core::constants::{BLOCK_CACHE_SIZE, FILE_HANDLES_CACHE_SIZE, MEM_CACHE_SIZE_MB};

/// Configuration for an open ledger instance.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Write-buffer budget handed to the storage engine, in MB.
    pub mem_cache_size_mb: usize,
    /// Cap on open file handles held by the storage engine.
    pub file_handles_cache_size: i32,
    /// Capacity of each of the header and full-block LRU caches.
    pub block_cache_size: usize,
    /// Skip the confirmed-table pre-existence probe and the parent
    /// `next_hash` rewrite on trunk extension. Disables trunk
    /// tx-uniqueness tracking.
    pub disable_tx_dedup: bool,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            mem_cache_size_mb: MEM_CACHE_SIZE_MB,
            file_handles_cache_size: FILE_HANDLES_CACHE_SIZE,
            block_cache_size: BLOCK_CACHE_SIZE,
            disable_tx_dedup: false,
        }
    }
}
