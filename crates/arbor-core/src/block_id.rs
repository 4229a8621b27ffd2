//! Block identity hashing.
//!
//! The block id is double SHA-256 over a canonical encoding of the
//! immutable header fields plus the merkle root. Excluded from the
//! encoding: `block_id` itself, `sign` (signs the id), `merkle_tree`
//! (represented by its root), and the fields the confirm engine rewrites
//! after formatting — `height`, `in_trunk`, `next_hash`. A block must
//! keep hashing to the same id through trunk extension, reorgs, and
//! truncation.

use crate::types::{put_bytes, sha256d, Block, Hash256};

/// Compute a block's id from its canonical header encoding.
pub fn make_block_id(block: &Block) -> Hash256 {
    let mut data = Vec::new();
    data.extend_from_slice(&block.version.to_le_bytes());
    data.extend_from_slice(block.pre_hash.as_bytes());
    put_bytes(&mut data, &block.proposer);
    put_bytes(&mut data, &block.pubkey);
    data.extend_from_slice(&block.timestamp.to_le_bytes());
    data.extend_from_slice(&block.cur_term.to_le_bytes());
    data.extend_from_slice(&block.cur_block_num.to_le_bytes());
    data.extend_from_slice(&block.target_bits.to_le_bytes());
    match &block.justify {
        Some(qc) => {
            data.push(1);
            put_bytes(&mut data, &qc.proposal_id);
            put_bytes(&mut data, &qc.proposal_msg);
            data.extend_from_slice(&qc.view.to_le_bytes());
        }
        None => data.push(0),
    }
    data.extend_from_slice(&block.tx_count.to_le_bytes());
    data.extend_from_slice(&(block.failed_txs.len() as u64).to_le_bytes());
    for (txid, reason) in &block.failed_txs {
        put_bytes(&mut data, txid.as_bytes());
        put_bytes(&mut data, reason.as_bytes());
    }
    data.extend_from_slice(block.merkle_root.as_bytes());
    sha256d(&data)
}
