//! Flat-array merkle tree over transaction ids.
//!
//! The tree is stored as a single vector: the first `tx_count` entries are
//! the leaf txids in block order, followed by the internal levels built
//! bottom-up; the final entry is the root. Odd levels duplicate their last
//! node. A single-transaction block has a one-entry tree whose root is the
//! txid itself; an empty block has an empty tree and a ZERO root.

use crate::types::{sha256d, Block, Hash256};

/// Hash of an internal node: double SHA-256 of `left || right`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    sha256d(&data)
}

/// Build the full flat tree from leaf txids.
pub fn make_merkle_tree(leaves: &[Hash256]) -> Vec<Hash256> {
    let mut tree: Vec<Hash256> = leaves.to_vec();
    let mut level_start = 0;
    let mut level_len = leaves.len();
    while level_len > 1 {
        let mut next = Vec::with_capacity(level_len.div_ceil(2));
        let mut i = 0;
        while i < level_len {
            let left = tree[level_start + i];
            let right = if i + 1 < level_len {
                tree[level_start + i + 1]
            } else {
                left
            };
            next.push(node_hash(&left, &right));
            i += 2;
        }
        level_start += level_len;
        level_len = next.len();
        tree.extend(next);
    }
    tree
}

/// The root of a flat tree: its last entry, or ZERO for an empty tree.
pub fn tree_root(tree: &[Hash256]) -> Hash256 {
    tree.last().copied().unwrap_or(Hash256::ZERO)
}

/// Check a block's stored merkle tree against its leaves.
///
/// Recomputes the full tree from the first `tx_count` entries and compares
/// it to the stored tree and root. Fake blocks (leaves-only trees) do not
/// pass; they are never persisted.
pub fn verify_merkle(block: &Block) -> bool {
    let Some(leaves) = block.tx_leaves() else {
        return false;
    };
    let recomputed = make_merkle_tree(leaves);
    recomputed == block.merkle_tree && tree_root(&recomputed) == block.merkle_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn h(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    fn block_with_tree(leaves: &[Hash256]) -> Block {
        let tree = make_merkle_tree(leaves);
        Block {
            block_id: Hash256::ZERO,
            version: 1,
            pre_hash: Hash256::ZERO,
            proposer: vec![],
            pubkey: vec![],
            sign: vec![],
            timestamp: 0,
            cur_term: 0,
            cur_block_num: 0,
            target_bits: 0,
            justify: None,
            height: 0,
            in_trunk: false,
            next_hash: Hash256::ZERO,
            merkle_root: tree_root(&tree),
            merkle_tree: tree,
            tx_count: leaves.len() as u32,
            failed_txs: BTreeMap::new(),
            transactions: vec![],
        }
    }

    // --- Tree shapes ---

    #[test]
    fn empty_tree() {
        assert!(make_merkle_tree(&[]).is_empty());
        assert_eq!(tree_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_leaf_tree_is_the_leaf() {
        let tree = make_merkle_tree(&[h(0xAA)]);
        assert_eq!(tree, vec![h(0xAA)]);
        assert_eq!(tree_root(&tree), h(0xAA));
    }

    #[test]
    fn two_leaf_tree() {
        let tree = make_merkle_tree(&[h(1), h(2)]);
        assert_eq!(tree.len(), 3);
        assert_eq!(&tree[..2], &[h(1), h(2)]);
        assert_eq!(tree[2], node_hash(&h(1), &h(2)));
    }

    #[test]
    fn three_leaf_tree_duplicates_last() {
        // Level 0: [1, 2, 3]
        // Level 1: [n(1,2), n(3,3)]
        // Level 2: [n(n(1,2), n(3,3))]
        let tree = make_merkle_tree(&[h(1), h(2), h(3)]);
        assert_eq!(tree.len(), 6);
        let n01 = node_hash(&h(1), &h(2));
        let n22 = node_hash(&h(3), &h(3));
        assert_eq!(tree[3], n01);
        assert_eq!(tree[4], n22);
        assert_eq!(tree[5], node_hash(&n01, &n22));
    }

    #[test]
    fn four_leaf_tree_balanced() {
        let tree = make_merkle_tree(&[h(1), h(2), h(3), h(4)]);
        assert_eq!(tree.len(), 7);
        let n01 = node_hash(&h(1), &h(2));
        let n23 = node_hash(&h(3), &h(4));
        assert_eq!(tree_root(&tree), node_hash(&n01, &n23));
    }

    #[test]
    fn five_leaf_tree_length() {
        // 5 leaves + 3 + 2 + 1 = 11 entries.
        assert_eq!(make_merkle_tree(&[h(1), h(2), h(3), h(4), h(5)]).len(), 11);
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let a = make_merkle_tree(&[h(1), h(2), h(3)]);
        let b = make_merkle_tree(&[h(1), h(2), h(4)]);
        assert_ne!(tree_root(&a), tree_root(&b));
    }

    #[test]
    fn root_changes_with_order() {
        let a = make_merkle_tree(&[h(1), h(2)]);
        let b = make_merkle_tree(&[h(2), h(1)]);
        assert_ne!(tree_root(&a), tree_root(&b));
    }

    #[test]
    fn node_hash_order_matters() {
        assert_ne!(node_hash(&h(1), &h(2)), node_hash(&h(2), &h(1)));
    }

    // --- verify_merkle ---

    #[test]
    fn verify_accepts_correct_tree() {
        for count in 0..=6u8 {
            let leaves: Vec<Hash256> = (1..=count).map(h).collect();
            let block = block_with_tree(&leaves);
            assert!(verify_merkle(&block), "failed at {count} leaves");
        }
    }

    #[test]
    fn verify_rejects_tampered_leaf() {
        let mut block = block_with_tree(&[h(1), h(2), h(3)]);
        block.merkle_tree[1] = h(0xFF);
        assert!(!verify_merkle(&block));
    }

    #[test]
    fn verify_rejects_tampered_root() {
        let mut block = block_with_tree(&[h(1), h(2)]);
        block.merkle_root = h(0xFF);
        assert!(!verify_merkle(&block));
    }

    #[test]
    fn verify_rejects_tampered_internal_node() {
        let mut block = block_with_tree(&[h(1), h(2), h(3), h(4)]);
        block.merkle_tree[4] = h(0xFF);
        assert!(!verify_merkle(&block));
    }

    #[test]
    fn verify_rejects_short_tree() {
        let mut block = block_with_tree(&[h(1), h(2)]);
        block.tx_count = 5;
        assert!(!verify_merkle(&block));
    }

    #[test]
    fn verify_rejects_leaves_only_fake_tree() {
        let leaves = vec![h(1), h(2), h(3)];
        let mut block = block_with_tree(&leaves);
        block.merkle_tree = leaves; // drop the internal nodes
        block.merkle_root = h(3);
        assert!(!verify_merkle(&block));
    }
}
