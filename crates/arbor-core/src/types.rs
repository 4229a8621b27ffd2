//! Core protocol types: blocks, transactions, ledger metadata.
//!
//! All persisted types carry both serde and bincode derives; the on-disk
//! format is bincode with the standard config. Identity hashes (block ids,
//! tx ids, merkle nodes) are double SHA-256 over explicit fixed byte
//! layouts, never over the bincode encoding, so the wire format can evolve
//! without changing identities.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte hash value: block ids, transaction ids, merkle nodes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Doubles as "no block": an empty `pre_hash`,
    /// `next_hash`, or unset ledger meta field.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a Hash256 from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Double SHA-256 of a byte string.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Append a length-prefixed byte string to a canonical encoding buffer.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// A transaction input, referencing an output of a prior transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// Id of the transaction whose output is consumed.
    pub ref_txid: Hash256,
    /// Index of the consumed output within that transaction.
    pub ref_offset: u32,
    /// Address the funds are drawn from.
    pub from_addr: Vec<u8>,
    /// Amount drawn.
    pub amount: u64,
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Amount carried by this output. For a coinbase transaction,
    /// `outputs[0].amount` is the block award.
    pub amount: u64,
    /// Receiving address.
    pub to_addr: Vec<u8>,
}

/// An extended output: an opaque contract state write carried through
/// the ledger untouched.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutputExt {
    pub bucket: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Amendment record attached to a confirmed transaction by
/// `update_blockchain_data`. Presence of the record marks the
/// transaction as amended.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ModifyBlock {
    /// Hex id of the transaction that carries the amendment.
    pub effective_txid: String,
    /// Height at which the amendment takes effect.
    pub effective_height: u64,
    /// Amender's public key, hex encoded.
    pub public_key: String,
    /// Amender's signature, hex encoded.
    pub sign: String,
}

/// A transaction as persisted in the confirmed table.
///
/// `txid` is the content hash computed by [`Transaction::compute_txid`];
/// `block_id` names the block currently claiming the transaction and is
/// rewritten by the ledger during reorgs, so it is excluded from the
/// content hash (as are `txid` itself and any amendment).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub txid: Hash256,
    pub coinbase: bool,
    pub desc: Vec<u8>,
    pub tx_inputs: Vec<TxInput>,
    pub tx_outputs: Vec<TxOutput>,
    pub tx_outputs_ext: Vec<TxOutputExt>,
    pub initiator: String,
    pub nonce: String,
    pub timestamp: i64,
    /// Block currently claiming this transaction. Maintained by the ledger.
    pub block_id: Hash256,
    /// Amendment record, set by `update_blockchain_data`.
    pub modify_block: Option<ModifyBlock>,
}

impl Transaction {
    /// Compute the transaction id: double SHA-256 over the canonical
    /// encoding, which excludes `txid`, `block_id` and `modify_block`.
    pub fn compute_txid(&self) -> Hash256 {
        let mut data = Vec::new();
        data.push(self.coinbase as u8);
        put_bytes(&mut data, &self.desc);
        data.extend_from_slice(&(self.tx_inputs.len() as u64).to_le_bytes());
        for input in &self.tx_inputs {
            data.extend_from_slice(input.ref_txid.as_bytes());
            data.extend_from_slice(&input.ref_offset.to_le_bytes());
            put_bytes(&mut data, &input.from_addr);
            data.extend_from_slice(&input.amount.to_le_bytes());
        }
        data.extend_from_slice(&(self.tx_outputs.len() as u64).to_le_bytes());
        for output in &self.tx_outputs {
            data.extend_from_slice(&output.amount.to_le_bytes());
            put_bytes(&mut data, &output.to_addr);
        }
        data.extend_from_slice(&(self.tx_outputs_ext.len() as u64).to_le_bytes());
        for ext in &self.tx_outputs_ext {
            put_bytes(&mut data, ext.bucket.as_bytes());
            put_bytes(&mut data, &ext.key);
            put_bytes(&mut data, &ext.value);
        }
        put_bytes(&mut data, self.initiator.as_bytes());
        put_bytes(&mut data, self.nonce.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        sha256d(&data)
    }
}

/// Consensus quorum certificate, carried through the ledger opaquely.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct QuorumCert {
    pub proposal_id: Vec<u8>,
    pub proposal_msg: Vec<u8>,
    pub view: i64,
}

/// A block. The block table stores it with `transactions` empty; the
/// body is reconstructed from the first `tx_count` merkle leaves.
///
/// `height`, `in_trunk` and `next_hash` are chain-position fields owned
/// by the confirm engine; everything else is fixed at format time.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub block_id: Hash256,
    pub version: u32,
    pub pre_hash: Hash256,
    /// Proposer address bytes.
    pub proposer: Vec<u8>,
    /// Proposer's raw Ed25519 public key.
    pub pubkey: Vec<u8>,
    /// Ed25519 signature over `block_id`.
    pub sign: Vec<u8>,
    pub timestamp: i64,
    pub cur_term: i64,
    pub cur_block_num: i64,
    pub target_bits: i32,
    pub justify: Option<QuorumCert>,
    pub height: u64,
    /// Whether the block currently sits on the trunk.
    pub in_trunk: bool,
    /// Id of the trunk successor; ZERO for the tip and for branch blocks.
    pub next_hash: Hash256,
    /// Flat merkle tree: `tx_count` leaf txids in block order, then the
    /// internal levels bottom-up; the last entry is the root.
    pub merkle_tree: Vec<Hash256>,
    pub merkle_root: Hash256,
    pub tx_count: u32,
    /// Txids the proposer dropped during pre-execution, with reasons.
    /// Ordered map so the canonical encoding is deterministic.
    pub failed_txs: BTreeMap<String, String>,
    /// Block body. Empty in the block table.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The leaf txids of the merkle tree, in block order.
    ///
    /// Returns `None` when the stored tree is shorter than `tx_count`
    /// (a corrupt record).
    pub fn tx_leaves(&self) -> Option<&[Hash256]> {
        self.merkle_tree.get(..self.tx_count as usize)
    }

    /// The coinbase transaction, if the body is loaded and has one.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.coinbase)
    }
}

/// The durable commit point of the ledger: one record holding the root
/// block id, the trunk tip, and the trunk height.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct LedgerMeta {
    /// Genesis block id; ZERO until a root block is confirmed.
    pub root_block_id: Hash256,
    /// Id of the highest trunk block.
    pub tip_block_id: Hash256,
    /// Height of the block at `tip_block_id`.
    pub trunk_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            coinbase: false,
            desc: b"transfer".to_vec(),
            tx_inputs: vec![TxInput {
                ref_txid: Hash256([0x11; 32]),
                ref_offset: 0,
                from_addr: b"alice".to_vec(),
                amount: 100,
            }],
            tx_outputs: vec![TxOutput {
                amount: 100,
                to_addr: b"bob".to_vec(),
            }],
            initiator: "alice".into(),
            nonce: "1".into(),
            timestamp: 1_700_000_000,
            ..Transaction::default()
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(Hash256::ZERO, Hash256::default());
    }

    #[test]
    fn hash256_nonzero_is_not_zero() {
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash256_hex_round_trip() {
        let h = Hash256([0x5C; 32]);
        assert_eq!(Hash256::from_hex(&format!("{h}")), Some(h));
    }

    #[test]
    fn hash256_from_hex_rejects_bad_input() {
        assert_eq!(Hash256::from_hex("zz"), None);
        assert_eq!(Hash256::from_hex("ab"), None); // too short
    }

    #[test]
    fn sha256d_differs_from_single_sha256() {
        let single: [u8; 32] = Sha256::digest(b"arbor").into();
        assert_ne!(sha256d(b"arbor"), Hash256(single));
    }

    // --- Transaction ids ---

    #[test]
    fn txid_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.compute_txid(), tx.compute_txid());
    }

    #[test]
    fn txid_changes_with_content() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.nonce = "2".into();
        assert_ne!(tx1.compute_txid(), tx2.compute_txid());
    }

    #[test]
    fn txid_ignores_ledger_owned_fields() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.txid = Hash256([0xFF; 32]);
        tx2.block_id = Hash256([0xEE; 32]);
        tx2.modify_block = Some(ModifyBlock {
            effective_txid: "aa".into(),
            effective_height: 9,
            public_key: String::new(),
            sign: String::new(),
        });
        assert_eq!(tx1.compute_txid(), tx2.compute_txid());
    }

    #[test]
    fn txid_length_prefix_prevents_field_bleed() {
        // Moving a byte between adjacent variable-length fields must
        // change the id.
        let mut tx1 = sample_tx();
        tx1.initiator = "ab".into();
        tx1.nonce = "c".into();
        let mut tx2 = sample_tx();
        tx2.initiator = "a".into();
        tx2.nonce = "bc".into();
        assert_ne!(tx1.compute_txid(), tx2.compute_txid());
    }

    // --- Block accessors ---

    fn sample_block(tx_count: u32, tree_len: usize) -> Block {
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
            merkle_tree: (0..tree_len).map(|i| Hash256([i as u8; 32])).collect(),
            merkle_root: Hash256::ZERO,
            tx_count,
            failed_txs: BTreeMap::new(),
            transactions: vec![],
        }
    }

    #[test]
    fn tx_leaves_returns_leaf_prefix() {
        let block = sample_block(2, 3);
        let leaves = block.tx_leaves().unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0], Hash256([0; 32]));
        assert_eq!(leaves[1], Hash256([1; 32]));
    }

    #[test]
    fn tx_leaves_detects_short_tree() {
        let block = sample_block(4, 3);
        assert!(block.tx_leaves().is_none());
    }

    #[test]
    fn coinbase_accessor_finds_coinbase() {
        let mut block = sample_block(0, 0);
        let mut cb = sample_tx();
        cb.coinbase = true;
        block.transactions = vec![sample_tx(), cb];
        assert!(block.coinbase().unwrap().coinbase);
    }

    // --- Bincode round-trips ---

    #[test]
    fn bincode_round_trip_transaction() {
        let tx = sample_tx();
        let encoded = bincode::encode_to_vec(&tx, bincode::config::standard()).unwrap();
        let (decoded, _): (Transaction, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn bincode_round_trip_block() {
        let mut block = sample_block(1, 1);
        block.failed_txs.insert("aa".into(), "timeout".into());
        block.justify = Some(QuorumCert {
            proposal_id: vec![1, 2],
            proposal_msg: vec![3],
            view: 7,
        });
        let encoded = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();
        let (decoded, _): (Block, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn bincode_round_trip_meta() {
        let meta = LedgerMeta {
            root_block_id: Hash256([1; 32]),
            tip_block_id: Hash256([2; 32]),
            trunk_height: 42,
        };
        let encoded = bincode::encode_to_vec(&meta, bincode::config::standard()).unwrap();
        let (decoded, _): (LedgerMeta, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(meta, decoded);
    }
}
