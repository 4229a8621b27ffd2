//! Parallel transaction pre-check.
//!
//! Before the confirm engine walks a block's transactions, every
//! transaction is stamped with the block id, serialized to its storage
//! bytes, and probed for prior existence in the confirmed table. The
//! work fans out over `min(tx_count, available_parallelism)` scoped
//! threads; each worker fills its own result buffer and the buffers are
//! merged at join, so no lock is shared during the scan. The check never
//! writes to storage — all mutations happen in the commit path.

use std::collections::HashMap;
use std::thread;

use arbor_core::types::{Hash256, Transaction};

use crate::store::{encode_tx, Store, CONFIRMED_PREFIX};

/// Outcome of the pre-check, keyed by txid.
pub struct TxCheck {
    /// Whether a confirmed entry already exists. Empty when the probe
    /// was skipped (`disable_tx_dedup` on a trunk block).
    pub exist: HashMap<Hash256, bool>,
    /// Serialized transaction bytes; `None` if serialization failed.
    pub data: HashMap<Hash256, Option<Vec<u8>>>,
}

impl TxCheck {
    /// Whether a confirmed entry was seen for `txid`.
    pub fn exists(&self, txid: &Hash256) -> bool {
        self.exist.get(txid).copied().unwrap_or(false)
    }
}

/// Stamp `block_id` into every transaction, then serialize and probe
/// them in parallel.
///
/// The existence probe is skipped when `disable_tx_dedup` is set and the
/// block is on the trunk, mirroring the dedup escape hatch.
pub fn parallel_check_txs(
    store: &Store,
    txs: &mut [Transaction],
    block_id: Hash256,
    in_trunk: bool,
    disable_tx_dedup: bool,
) -> TxCheck {
    for tx in txs.iter_mut() {
        tx.block_id = block_id;
    }

    let probe = !disable_tx_dedup || !in_trunk;
    let mut exist = HashMap::with_capacity(txs.len());
    let mut data = HashMap::with_capacity(txs.len());
    if txs.is_empty() {
        return TxCheck { exist, data };
    }

    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(txs.len());
    let chunk_size = txs.len().div_ceil(workers);

    thread::scope(|s| {
        let handles: Vec<_> = txs
            .chunks(chunk_size)
            .map(|chunk| {
                s.spawn(move || {
                    let mut exist_buf = Vec::with_capacity(chunk.len());
                    let mut data_buf = Vec::with_capacity(chunk.len());
                    for tx in chunk {
                        data_buf.push((tx.txid, encode_tx(tx).ok()));
                        if probe {
                            let has = store
                                .has(CONFIRMED_PREFIX, tx.txid.as_bytes())
                                .unwrap_or(false);
                            exist_buf.push((tx.txid, has));
                        }
                    }
                    (exist_buf, data_buf)
                })
            })
            .collect();

        for handle in handles {
            let (exist_buf, data_buf) = handle.join().expect("tx check worker panicked");
            exist.extend(exist_buf);
            data.extend(data_buf);
        }
    });

    TxCheck { exist, data }
}
