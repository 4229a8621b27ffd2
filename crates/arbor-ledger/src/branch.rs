//! Branch tip registry.
//!
//! Every chain tip — the trunk tip included — has a record under the
//! branch prefix mapping its block id to its height. Confirming a block
//! registers it as a tip and unregisters its parent, so the set of tips
//! is always reconstructible from disk alone after a crash.

use rocksdb::WriteBatch;

use arbor_core::error::LedgerError;
use arbor_core::types::Hash256;

use crate::store::{batch_delete, batch_put, Store, BRANCH_PREFIX};

/// Register `block_id` as a tip at `height` and unregister its parent.
pub fn update_branch_info(
    batch: &mut WriteBatch,
    block_id: &Hash256,
    pre_hash: &Hash256,
    height: u64,
) {
    batch_put(batch, BRANCH_PREFIX, block_id.as_bytes(), &height.to_le_bytes());
    if !pre_hash.is_zero() {
        batch_delete(batch, BRANCH_PREFIX, pre_hash.as_bytes());
    }
}

/// All registered tips as `(block_id, height)`, in key order.
pub fn branch_tips(store: &Store) -> Result<Vec<(Hash256, u64)>, LedgerError> {
    let mut tips = Vec::new();
    for (suffix, value) in store.scan_prefix(BRANCH_PREFIX)? {
        let id: [u8; 32] = suffix
            .try_into()
            .map_err(|_| LedgerError::Corrupt("branch tip key is not 32 bytes".into()))?;
        let height_bytes: [u8; 8] = value
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Corrupt("branch tip height is not 8 bytes".into()))?;
        tips.push((Hash256(id), u64::from_le_bytes(height_bytes)));
    }
    Ok(tips)
}

/// Tips strictly higher than `height`, excluding `exclude` itself.
/// These are the chains a truncation to `height` must prune.
pub fn branch_tips_above(
    store: &Store,
    height: u64,
    exclude: &Hash256,
) -> Result<Vec<Hash256>, LedgerError> {
    Ok(branch_tips(store)?
        .into_iter()
        .filter(|(id, h)| *h > height && id != exclude)
        .map(|(id, _)| id)
        .collect())
}
