//! RocksDB-backed table storage.
//!
//! All six logical tables share one RocksDB namespace; each table is a
//! fixed one-byte ASCII key prefix. The prefixes are frozen — changing
//! one is an on-disk migration. Multi-table state transitions are staged
//! into a [`WriteBatch`] and flushed atomically.

use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use arbor_core::error::LedgerError;
use arbor_core::types::{Block, LedgerMeta, Transaction};

use crate::options::LedgerOptions;

/// Ledger meta record (single entry, empty suffix).
pub const META_PREFIX: u8 = b'M';
/// Block headers by block id.
pub const BLOCKS_PREFIX: u8 = b'B';
/// Confirmed transactions by txid.
pub const CONFIRMED_PREFIX: u8 = b'C';
/// Trunk height index: zero-padded decimal height to block id.
pub const HEIGHT_PREFIX: u8 = b'H';
/// Staged full blocks awaiting confirmation, by block id.
pub const PENDING_PREFIX: u8 = b'P';
/// Branch tips: block id to tip height.
pub const BRANCH_PREFIX: u8 = b'R';

/// Prefix-keyed table storage over a single RocksDB instance.
#[derive(Debug)]
pub struct Store {
    db: DB,
}

impl Store {
    /// Open (or create) the database at `path`, applying the ledger's
    /// engine tunables.
    pub fn open(path: impl AsRef<Path>, opts: &LedgerOptions) -> Result<Self, LedgerError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.set_write_buffer_size(opts.mem_cache_size_mb * 1024 * 1024);
        db_opts.set_max_open_files(opts.file_handles_cache_size);

        let db = DB::open(&db_opts, path.as_ref())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// Build a full key from a table prefix and suffix.
    pub fn key(prefix: u8, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + suffix.len());
        key.push(prefix);
        key.extend_from_slice(suffix);
        key
    }

    /// The height-index key suffix: zero-padded 20-digit decimal.
    pub fn height_key(height: u64) -> Vec<u8> {
        format!("{height:020}").into_bytes()
    }

    pub fn get(&self, prefix: u8, suffix: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        self.db
            .get(Self::key(prefix, suffix))
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub fn has(&self, prefix: u8, suffix: &[u8]) -> Result<bool, LedgerError> {
        Ok(self.get(prefix, suffix)?.is_some())
    }

    pub fn put(&self, prefix: u8, suffix: &[u8], value: &[u8]) -> Result<(), LedgerError> {
        self.db
            .put(Self::key(prefix, suffix), value)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub fn delete(&self, prefix: u8, suffix: &[u8]) -> Result<(), LedgerError> {
        self.db
            .delete(Self::key(prefix, suffix))
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Flush a staged batch atomically.
    pub fn write(&self, batch: WriteBatch) -> Result<(), LedgerError> {
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// All `(suffix, value)` pairs under a table prefix, in key order.
    pub fn scan_prefix(&self, prefix: u8) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LedgerError> {
        let start = [prefix];
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            if key.first() != Some(&prefix) {
                break;
            }
            entries.push((key[1..].to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// Stage a put into a batch under a table prefix.
pub fn batch_put(batch: &mut WriteBatch, prefix: u8, suffix: &[u8], value: &[u8]) {
    batch.put(Store::key(prefix, suffix), value);
}

/// Stage a delete into a batch under a table prefix.
pub fn batch_delete(batch: &mut WriteBatch, prefix: u8, suffix: &[u8]) {
    batch.delete(Store::key(prefix, suffix));
}

// --- Record codecs ---
//
// Identity hashes never cover these encodings, so the wire format is
// free to stay bincode-standard.

pub fn encode_block(block: &Block) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(block, bincode::config::standard())
        .map_err(|e| LedgerError::Corrupt(e.to_string()))
}

pub fn decode_block(bytes: &[u8]) -> Result<Block, LedgerError> {
    let (block, _): (Block, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(block)
}

pub fn encode_tx(tx: &Transaction) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(tx, bincode::config::standard())
        .map_err(|e| LedgerError::Corrupt(e.to_string()))
}

pub fn decode_tx(bytes: &[u8]) -> Result<Transaction, LedgerError> {
    let (tx, _): (Transaction, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(tx)
}

pub fn encode_meta(meta: &LedgerMeta) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| LedgerError::Corrupt(e.to_string()))
}

pub fn decode_meta(bytes: &[u8]) -> Result<LedgerMeta, LedgerError> {
    let (meta, _): (LedgerMeta, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(meta)
}
