//! The ledger engine.
//!
//! A [`Ledger`] owns the six storage tables, two block caches, and one
//! reader/writer lock. Writers (`confirm_block`, `truncate`,
//! `update_blockchain_data`) hold the lock exclusively for the whole
//! operation and stage every mutation into a single [`WriteBatch`]; the
//! in-memory meta is swapped only after the batch lands, so readers
//! observe either the pre-commit or post-commit chain, never a partial
//! one. Failed confirms leave the disk untouched.
//!
//! Chain shape: the trunk is the path from the root block to
//! `meta.tip_block_id`; every other maximal chain is a branch. A block
//! whose parent out-heights the trunk triggers a trunk switch, repainting
//! the losing path to branch and the winning path to trunk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rocksdb::WriteBatch;
use tracing::{debug, info, warn};

use arbor_core::block_id::make_block_id;
use arbor_core::constants::{BLOCK_VERSION, ROOT_BLOCK_VERSION};
use arbor_core::crypto::{verify_block_signature, KeyPair};
use arbor_core::error::LedgerError;
use arbor_core::genesis::GenesisBlock;
use arbor_core::merkle;
use arbor_core::types::{Block, Hash256, LedgerMeta, ModifyBlock, QuorumCert, Transaction};

use crate::branch;
use crate::cache::BlockCache;
use crate::options::LedgerOptions;
use crate::par_check::parallel_check_txs;
use crate::store::{
    batch_delete, batch_put, decode_block, decode_meta, decode_tx, encode_block, encode_meta,
    encode_tx, Store, BLOCKS_PREFIX, CONFIRMED_PREFIX, HEIGHT_PREFIX, META_PREFIX, PENDING_PREFIX,
};

/// Outcome of a `confirm_block` call. Never an `Err`: failures are
/// reported through `succ == false` plus `error`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfirmStatus {
    /// Whether the block was committed.
    pub succ: bool,
    /// Whether the ledger now holds more than one chain.
    pub split: bool,
    /// Whether the block landed on a branch rather than the trunk.
    pub orphan: bool,
    /// Whether the commit switched the trunk to a different chain.
    pub trunk_switch: bool,
    /// Failure cause when `succ` is false.
    pub error: Option<LedgerError>,
}

impl ConfirmStatus {
    fn with_error(mut self, error: LedgerError) -> Self {
        self.succ = false;
        self.error = Some(error);
        self
    }
}

#[derive(Debug)]
struct LedgerState {
    meta: LedgerMeta,
    genesis: GenesisBlock,
}

/// The append-and-fork ledger.
#[derive(Debug)]
pub struct Ledger {
    store: Store,
    state: RwLock<LedgerState>,
    /// Fully reconstructed blocks, for `query_block`.
    block_cache: BlockCache,
    /// Body-less headers, for internal chain walks.
    header_cache: BlockCache,
    options: LedgerOptions,
}

/// Read a block record and reconstruct its body from the confirmed table.
fn read_block_with_body(store: &Store, block_id: &Hash256) -> Result<Block, LedgerError> {
    let bytes = store
        .get(BLOCKS_PREFIX, block_id.as_bytes())?
        .ok_or(LedgerError::BlockNotExist)?;
    let mut block = decode_block(&bytes)?;
    let leaves = block
        .tx_leaves()
        .ok_or_else(|| LedgerError::Corrupt("merkle tree shorter than tx count".into()))?
        .to_vec();
    let mut txs = Vec::with_capacity(leaves.len());
    for txid in leaves {
        let tx_bytes = store.get(CONFIRMED_PREFIX, txid.as_bytes())?.ok_or_else(|| {
            warn!(%txid, "confirmed entry missing while rebuilding block body");
            LedgerError::TxNotFound
        })?;
        txs.push(decode_tx(&tx_bytes)?);
    }
    block.transactions = txs;
    Ok(block)
}

impl Ledger {
    /// Create a ledger at `path`, or open it if one already exists.
    ///
    /// `genesis_cfg` is the genesis configuration JSON; it is ignored when
    /// the ledger on disk already has a root block (the configuration is
    /// then recovered from the root coinbase).
    pub fn create(
        path: impl AsRef<Path>,
        genesis_cfg: &[u8],
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        Self::new_ledger(path, Some(genesis_cfg), options)
    }

    /// Open a ledger that already exists at `path`.
    pub fn open(path: impl AsRef<Path>, options: LedgerOptions) -> Result<Self, LedgerError> {
        Self::new_ledger(path, None, options)
    }

    fn new_ledger(
        path: impl AsRef<Path>,
        genesis_cfg: Option<&[u8]>,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        let store = Store::open(path, &options)?;

        let meta = match store.get(META_PREFIX, b"")? {
            Some(bytes) => decode_meta(&bytes)?,
            None => {
                if genesis_cfg.is_none() {
                    return Err(LedgerError::BlockNotExist);
                }
                let meta = LedgerMeta::default();
                store.put(META_PREFIX, b"", &encode_meta(&meta)?)?;
                meta
            }
        };
        info!(
            root = %meta.root_block_id,
            tip = %meta.tip_block_id,
            height = meta.trunk_height,
            "ledger meta loaded"
        );

        let genesis = if meta.root_block_id.is_zero() {
            let cfg = genesis_cfg.ok_or(LedgerError::BlockNotExist)?;
            GenesisBlock::new(cfg)?
        } else {
            Self::load_genesis_from_root(&store, &meta)?
        };

        Ok(Self {
            block_cache: BlockCache::new(options.block_cache_size),
            header_cache: BlockCache::new(options.block_cache_size),
            store,
            state: RwLock::new(LedgerState { meta, genesis }),
            options,
        })
    }

    fn load_genesis_from_root(store: &Store, meta: &LedgerMeta) -> Result<GenesisBlock, LedgerError> {
        let root = read_block_with_body(store, &meta.root_block_id)?;
        let coinbase = root
            .coinbase()
            .ok_or_else(|| LedgerError::Genesis("root block has no coinbase".into()))?;
        GenesisBlock::new(&coinbase.desc)
    }

    /// Close the ledger, releasing the underlying database handle.
    pub fn close(self) {}

    fn read_state(&self) -> RwLockReadGuard<'_, LedgerState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LedgerState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current ledger meta: root block id, tip block id, trunk height.
    pub fn meta(&self) -> LedgerMeta {
        self.read_state().meta.clone()
    }

    // --- Genesis configuration ---

    /// The parsed genesis block parameters.
    pub fn genesis_block(&self) -> GenesisBlock {
        self.read_state().genesis.clone()
    }

    /// The coinbase award owed at `height`.
    pub fn calc_award(&self, height: u64) -> u64 {
        self.read_state().genesis.calc_award(height)
    }

    /// Maximum serialized block size in bytes.
    pub fn max_block_size(&self) -> u64 {
        self.read_state().genesis.config().max_block_size
    }

    /// Width of the irreversibility window.
    pub fn irreversible_slide_window(&self) -> u64 {
        self.read_state().genesis.config().irreversible_slide_window
    }

    /// Whether transactions are exempt from fees.
    pub fn no_fee(&self) -> bool {
        self.read_state().genesis.config().no_fee
    }

    /// Flat gas price.
    pub fn gas_price(&self) -> u64 {
        self.read_state().genesis.config().gas_price
    }

    // --- Block formatting ---

    /// Format the genesis block from its transaction list.
    pub fn format_root_block(&self, txs: Vec<Transaction>) -> Result<Block, LedgerError> {
        info!("formatting root block");
        self.assemble_block(
            txs,
            &[],
            None,
            0,
            0,
            0,
            Hash256::ZERO,
            0,
            None,
            BTreeMap::new(),
            0,
            true,
            ROOT_BLOCK_VERSION,
        )
    }

    /// Format and sign a regular block on top of `pre_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn format_block(
        &self,
        txs: Vec<Transaction>,
        proposer: &[u8],
        keypair: &KeyPair,
        timestamp: i64,
        cur_term: i64,
        cur_block_num: i64,
        pre_hash: Hash256,
    ) -> Result<Block, LedgerError> {
        self.assemble_block(
            txs,
            proposer,
            Some(keypair),
            timestamp,
            cur_term,
            cur_block_num,
            pre_hash,
            0,
            None,
            BTreeMap::new(),
            0,
            true,
            BLOCK_VERSION,
        )
    }

    /// Format and sign a miner block, carrying the full consensus fields.
    #[allow(clippy::too_many_arguments)]
    pub fn format_miner_block(
        &self,
        txs: Vec<Transaction>,
        proposer: &[u8],
        keypair: &KeyPair,
        timestamp: i64,
        cur_term: i64,
        cur_block_num: i64,
        pre_hash: Hash256,
        target_bits: i32,
        justify: Option<QuorumCert>,
        failed_txs: BTreeMap<String, String>,
        height: u64,
    ) -> Result<Block, LedgerError> {
        self.assemble_block(
            txs,
            proposer,
            Some(keypair),
            timestamp,
            cur_term,
            cur_block_num,
            pre_hash,
            target_bits,
            justify,
            failed_txs,
            height,
            true,
            BLOCK_VERSION,
        )
    }

    /// Format an unsigned block for contract pre-execution.
    ///
    /// The merkle tree holds only the leaf txids; the block id is still
    /// deterministic. Fake blocks are never persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn format_fake_block(
        &self,
        txs: Vec<Transaction>,
        proposer: &[u8],
        keypair: &KeyPair,
        timestamp: i64,
        cur_term: i64,
        cur_block_num: i64,
        pre_hash: Hash256,
        height: u64,
    ) -> Result<Block, LedgerError> {
        self.assemble_block(
            txs,
            proposer,
            Some(keypair),
            timestamp,
            cur_term,
            cur_block_num,
            pre_hash,
            0,
            None,
            BTreeMap::new(),
            height,
            false,
            BLOCK_VERSION,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_block(
        &self,
        txs: Vec<Transaction>,
        proposer: &[u8],
        keypair: Option<&KeyPair>,
        timestamp: i64,
        cur_term: i64,
        cur_block_num: i64,
        pre_hash: Hash256,
        target_bits: i32,
        justify: Option<QuorumCert>,
        failed_txs: BTreeMap<String, String>,
        height: u64,
        need_sign: bool,
        version: u32,
    ) -> Result<Block, LedgerError> {
        debug!(%pre_hash, tx_count = txs.len(), "formatting block");
        let leaves: Vec<Hash256> = txs.iter().map(|tx| tx.txid).collect();
        let merkle_tree = if need_sign {
            merkle::make_merkle_tree(&leaves)
        } else {
            leaves
        };
        let merkle_root = merkle::tree_root(&merkle_tree);

        let mut block = Block {
            block_id: Hash256::ZERO,
            version,
            pre_hash,
            proposer: proposer.to_vec(),
            pubkey: keypair
                .map(|kp| kp.public_key().to_bytes().to_vec())
                .unwrap_or_default(),
            sign: vec![],
            timestamp,
            cur_term,
            cur_block_num,
            target_bits,
            justify,
            height,
            in_trunk: false,
            next_hash: Hash256::ZERO,
            merkle_tree,
            merkle_root,
            tx_count: txs.len() as u32,
            failed_txs,
            transactions: txs,
        };
        block.block_id = make_block_id(&block);
        if need_sign && !block.pre_hash.is_zero() {
            if let Some(kp) = keypair {
                block.sign = kp.sign(block.block_id.as_bytes()).to_vec();
            }
        }
        Ok(block)
    }

    /// Verify a block's identity, merkle tree, and proposer signature.
    ///
    /// Semantic rejections return `false`; this never errors.
    pub fn verify_block(&self, block: &Block) -> bool {
        let id = make_block_id(block);
        if id != block.block_id {
            warn!(claimed = %block.block_id, recomputed = %id, "block id mismatch");
            return false;
        }
        if !merkle::verify_merkle(block) {
            warn!(block_id = %block.block_id, "merkle tree mismatch");
            return false;
        }
        if let Err(e) = verify_block_signature(block, &block.block_id) {
            warn!(block_id = %block.block_id, error = %e, "block signature rejected");
            return false;
        }
        true
    }

    // --- Confirm engine ---

    /// Submit a block to the ledger.
    ///
    /// Classifies the block (trunk extension, branch extension, or trunk
    /// switch), validates its transactions against the confirmed table,
    /// and commits header, transactions, height index, branch registry
    /// and meta in one atomic batch. Holds the write lock throughout.
    pub fn confirm_block(&self, block: &mut Block, is_root: bool) -> ConfirmStatus {
        let mut state = self.write_state();
        info!(
            block_id = %block.block_id,
            tx_count = block.transactions.len(),
            "confirming block"
        );

        // The block table never stores transaction bodies.
        let mut real_txs = std::mem::take(&mut block.transactions);
        let status = self.confirm_block_locked(&mut state, block, &mut real_txs, is_root);
        block.transactions = real_txs;

        if status.succ {
            self.block_cache.add(Arc::new(block.clone()));
        }
        status
    }

    fn confirm_block_locked(
        &self,
        state: &mut LedgerState,
        block: &mut Block,
        real_txs: &mut [Transaction],
        is_root: bool,
    ) -> ConfirmStatus {
        let mut status = ConfirmStatus::default();
        let mut batch = WriteBatch::default();
        let mut new_meta = state.meta.clone();
        let mut split_height = new_meta.trunk_height;

        if is_root {
            if !block.pre_hash.is_zero() {
                warn!("root block must not have a pre_hash");
                return status
                    .with_error(LedgerError::Corrupt("root block carries a pre_hash".into()));
            }
            if !state.meta.root_block_id.is_zero() {
                warn!("ledger already has a root block");
                return status.with_error(LedgerError::RootBlockAlreadyExist);
            }
            new_meta.root_block_id = block.block_id;
            new_meta.tip_block_id = block.block_id;
            new_meta.trunk_height = 0;
            block.in_trunk = true;
            block.height = 0;
        } else {
            let pre_block = match self.fetch_block(&block.pre_hash) {
                Ok(b) => b,
                Err(e) => {
                    warn!(pre_hash = %block.pre_hash, "predecessor not found");
                    return status.with_error(e);
                }
            };
            // Trunk or branch, the height always follows the parent.
            block.height = pre_block.height + 1;

            if pre_block.block_id == new_meta.tip_block_id {
                // Trunk extension.
                block.in_trunk = true;
                new_meta.tip_block_id = block.block_id;
                new_meta.trunk_height += 1;
                if !self.options.disable_tx_dedup {
                    // The parent's next_hash changed, so it must be rewritten.
                    let mut pre = (*pre_block).clone();
                    pre.next_hash = block.block_id;
                    if let Err(e) = self.save_block(&pre, &mut batch) {
                        warn!(error = %e, "failed to re-save parent block");
                        return status.with_error(e);
                    }
                }
            } else if pre_block.height + 1 > new_meta.trunk_height {
                // A branch outgrew the trunk: switch to it.
                let old_tip = new_meta.tip_block_id;
                new_meta.trunk_height = pre_block.height + 1;
                new_meta.tip_block_id = block.block_id;
                block.in_trunk = true;
                match self.handle_fork(&old_tip, &pre_block.block_id, &block.block_id, &mut batch)
                {
                    Ok(split_block) => {
                        split_height = split_block.height;
                        status.split = true;
                        status.trunk_switch = true;
                        info!(
                            split_block = %split_block.block_id,
                            split_height,
                            "trunk switched at fork point"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "fork handling failed");
                        return status.with_error(e);
                    }
                }
            } else {
                // Extends a branch that stays behind the trunk.
                block.in_trunk = false;
                status.split = true;
                status.orphan = true;
            }
        }

        if let Err(e) = self.save_block(block, &mut batch) {
            warn!(error = %e, "failed to save block header");
            return status.with_error(e);
        }
        branch::update_branch_info(&mut batch, &block.block_id, &block.pre_hash, block.height);

        let check = parallel_check_txs(
            &self.store,
            real_txs,
            block.block_id,
            block.in_trunk,
            self.options.disable_tx_dedup,
        );

        let mut coinbase_count = 0u32;
        let mut old_blocks: HashMap<Hash256, Block> = HashMap::new();
        for tx in real_txs.iter() {
            if tx.coinbase {
                coinbase_count += 1;
                if coinbase_count > 1 {
                    warn!(block_id = %block.block_id, "block carries multiple coinbase transactions");
                    return status.with_error(LedgerError::MultipleCoinbase);
                }
                let Some(first_out) = tx.tx_outputs.first() else {
                    return status
                        .with_error(LedgerError::InvalidCoinbase("coinbase has no outputs".into()));
                };
                let expected = state.genesis.calc_award(block.height);
                if first_out.amount != expected {
                    warn!(got = first_out.amount, expected, "coinbase award mismatch");
                    return status.with_error(LedgerError::InvalidAward {
                        got: first_out.amount,
                        expected,
                    });
                }
            }

            let Some(tx_bytes) = check.data.get(&tx.txid).and_then(|b| b.as_deref()) else {
                warn!(txid = %tx.txid, "transaction failed to serialize");
                return status
                    .with_error(LedgerError::Corrupt("transaction failed to serialize".into()));
            };

            if !check.exists(&tx.txid) {
                batch_put(&mut batch, CONFIRMED_PREFIX, tx.txid.as_bytes(), tx_bytes);
                continue;
            }

            // A confirmed entry already exists: decide from the block that
            // currently claims the transaction.
            let old_tx = match self.store.get(CONFIRMED_PREFIX, tx.txid.as_bytes()) {
                Ok(Some(bytes)) => match decode_tx(&bytes) {
                    Ok(t) => t,
                    Err(e) => return status.with_error(e),
                },
                Ok(None) => {
                    batch_put(&mut batch, CONFIRMED_PREFIX, tx.txid.as_bytes(), tx_bytes);
                    continue;
                }
                Err(e) => return status.with_error(e),
            };

            if !old_blocks.contains_key(&old_tx.block_id) {
                match self.store.get(BLOCKS_PREFIX, old_tx.block_id.as_bytes()) {
                    Ok(Some(bytes)) => match decode_block(&bytes) {
                        Ok(b) => {
                            old_blocks.insert(old_tx.block_id, b);
                        }
                        Err(e) => return status.with_error(e),
                    },
                    Ok(None) => {
                        // The claiming block was truncated away; the new
                        // copy simply takes over the entry.
                        warn!(
                            txid = %tx.txid,
                            old_block = %old_tx.block_id,
                            "claiming block was truncated, overwriting entry"
                        );
                        batch_put(&mut batch, CONFIRMED_PREFIX, tx.txid.as_bytes(), tx_bytes);
                        continue;
                    }
                    Err(e) => return status.with_error(e),
                }
            }
            let old_block = &old_blocks[&old_tx.block_id];

            if old_block.in_trunk && block.in_trunk && old_block.height <= split_height {
                // The transaction would appear twice in the live trunk.
                warn!(
                    txid = %tx.txid,
                    old_block = %old_block.block_id,
                    "transaction duplicated in a prior trunk block"
                );
                return status.with_error(LedgerError::TxDuplicated);
            } else if block.in_trunk {
                debug!(txid = %tx.txid, block_id = %block.block_id, "relocating confirmed transaction");
                batch_put(&mut batch, CONFIRMED_PREFIX, tx.txid.as_bytes(), tx_bytes);
            }
            // Duplicate on a branch: the trunk copy keeps the entry.
        }

        batch_delete(&mut batch, PENDING_PREFIX, block.block_id.as_bytes());
        let meta_bytes = match encode_meta(&new_meta) {
            Ok(bytes) => bytes,
            Err(e) => return status.with_error(e),
        };
        batch_put(&mut batch, META_PREFIX, b"", &meta_bytes);

        if let Err(e) = self.store.write(batch) {
            warn!(error = %e, "batch write failed when confirming block");
            return status.with_error(e);
        }
        status.succ = true;
        state.meta = new_meta;

        if is_root {
            // The genesis configuration now lives in the root coinbase.
            if let Err(e) = self.reload_genesis(state) {
                warn!(error = %e, "failed to reload genesis configuration");
                return status.with_error(e);
            }
        }
        status
    }

    fn reload_genesis(&self, state: &mut LedgerState) -> Result<(), LedgerError> {
        state.genesis = Self::load_genesis_from_root(&self.store, &state.meta)?;
        Ok(())
    }

    /// Stage a header write (and height-index entry for trunk blocks),
    /// invalidating both caches for the block.
    fn save_block(&self, block: &Block, batch: &mut WriteBatch) -> Result<(), LedgerError> {
        let mut header = block.clone();
        header.transactions = Vec::new();
        let bytes = encode_block(&header)?;
        self.header_cache.remove(&block.block_id);
        self.block_cache.remove(&block.block_id);
        batch_put(batch, BLOCKS_PREFIX, block.block_id.as_bytes(), &bytes);
        if block.in_trunk {
            batch_put(
                batch,
                HEIGHT_PREFIX,
                &Store::height_key(block.height),
                block.block_id.as_bytes(),
            );
        }
        Ok(())
    }

    /// Fetch a header (body-less block) through the header cache.
    fn fetch_block(&self, block_id: &Hash256) -> Result<Arc<Block>, LedgerError> {
        if let Some(block) = self.header_cache.get(block_id) {
            return Ok(block);
        }
        let bytes = self
            .store
            .get(BLOCKS_PREFIX, block_id.as_bytes())?
            .ok_or(LedgerError::BlockNotExist)?;
        let block = Arc::new(decode_block(&bytes)?);
        self.header_cache.add(block.clone());
        Ok(block)
    }

    // --- Fork handling ---

    /// Recolor the block at `block_id` into the trunk: fix its
    /// transactions' claiming block, link `next_hash`, and re-save.
    /// Returns the parent id.
    fn adopt_trunk_block(
        &self,
        block_id: &Hash256,
        next_hash: &mut Hash256,
        batch: &mut WriteBatch,
    ) -> Result<Hash256, LedgerError> {
        let mut block = (*self.fetch_block(block_id)?).clone();
        block.in_trunk = true;
        self.correct_txs_block_id(block_id, batch)?;
        block.next_hash = *next_hash;
        *next_hash = block.block_id;
        let pre = block.pre_hash;
        self.save_block(&block, batch)?;
        Ok(pre)
    }

    /// Recolor the block at `block_id` off the trunk. Returns the parent id.
    fn evict_trunk_block(
        &self,
        block_id: &Hash256,
        batch: &mut WriteBatch,
    ) -> Result<Hash256, LedgerError> {
        let mut block = (*self.fetch_block(block_id)?).clone();
        block.in_trunk = false;
        block.next_hash = Hash256::ZERO;
        let pre = block.pre_hash;
        self.save_block(&block, batch)?;
        Ok(pre)
    }

    /// Repaint the two paths of a trunk switch down to their fork point.
    ///
    /// `p` walks the losing trunk from `old_tip`; `q` walks the winning
    /// branch from `new_tip_pre`. The taller side walks alone until both
    /// cursors sit at the same height, then both walk in lockstep until
    /// the ids match — the fork point, which is re-linked to the adopted
    /// chain and returned.
    fn handle_fork(
        &self,
        old_tip: &Hash256,
        new_tip_pre: &Hash256,
        new_tip: &Hash256,
        batch: &mut WriteBatch,
    ) -> Result<Block, LedgerError> {
        let mut p = *old_tip;
        let mut q = *new_tip_pre;
        let mut next_hash = *new_tip;

        while p != q {
            let p_height = self.fetch_block(&p)?.height;
            let q_height = self.fetch_block(&q)?.height;
            if q_height > p_height {
                q = self.adopt_trunk_block(&q, &mut next_hash, batch)?;
            } else if p_height > q_height {
                p = self.evict_trunk_block(&p, batch)?;
            } else {
                p = self.evict_trunk_block(&p, batch)?;
                q = self.adopt_trunk_block(&q, &mut next_hash, batch)?;
            }
        }

        let mut split = (*self.fetch_block(&q)?).clone();
        split.in_trunk = true;
        split.next_hash = next_hash;
        self.save_block(&split, batch)?;
        Ok(split)
    }

    /// Rewrite every transaction of a newly adopted trunk block to point
    /// back at it. Usually a no-op; it pins relocations from earlier
    /// reorgs.
    fn correct_txs_block_id(
        &self,
        block_id: &Hash256,
        batch: &mut WriteBatch,
    ) -> Result<(), LedgerError> {
        let block = read_block_with_body(&self.store, block_id)?;
        for tx in &block.transactions {
            if tx.block_id != *block_id {
                warn!(
                    txid = %tx.txid,
                    old_block = %tx.block_id,
                    new_block = %block_id,
                    "correcting claiming block of transaction"
                );
                let mut fixed = tx.clone();
                fixed.block_id = *block_id;
                let bytes = encode_tx(&fixed)?;
                batch_put(batch, CONFIRMED_PREFIX, fixed.txid.as_bytes(), &bytes);
            }
        }
        Ok(())
    }

    // --- Queries ---

    /// Whether a block exists in the block table.
    pub fn exist_block(&self, block_id: &Hash256) -> bool {
        self.store
            .has(BLOCKS_PREFIX, block_id.as_bytes())
            .unwrap_or(false)
    }

    fn query_block_unlocked(&self, block_id: &Hash256) -> Result<Arc<Block>, LedgerError> {
        if let Some(block) = self.block_cache.get(block_id) {
            debug!(%block_id, "query_block cache hit");
            return Ok(block);
        }
        let block = Arc::new(read_block_with_body(&self.store, block_id)?);
        self.block_cache.add(block.clone());
        Ok(block)
    }

    /// Look up a block with its body reconstructed from the confirmed
    /// table.
    pub fn query_block(&self, block_id: &Hash256) -> Result<Arc<Block>, LedgerError> {
        let _state = self.read_state();
        self.query_block_unlocked(block_id)
    }

    /// Look up a block header (no body).
    pub fn query_block_header(&self, block_id: &Hash256) -> Result<Arc<Block>, LedgerError> {
        self.fetch_block(block_id)
    }

    /// Whether a transaction has been confirmed.
    pub fn has_transaction(&self, txid: &Hash256) -> Result<bool, LedgerError> {
        self.store.has(CONFIRMED_PREFIX, txid.as_bytes())
    }

    fn query_transaction_unlocked(&self, txid: &Hash256) -> Result<Transaction, LedgerError> {
        let bytes = self
            .store
            .get(CONFIRMED_PREFIX, txid.as_bytes())?
            .ok_or(LedgerError::TxNotFound)?;
        decode_tx(&bytes)
    }

    /// Look up a confirmed transaction.
    pub fn query_transaction(&self, txid: &Hash256) -> Result<Transaction, LedgerError> {
        let _state = self.read_state();
        self.query_transaction_unlocked(txid)
    }

    /// Whether a confirmed transaction currently sits on the trunk.
    pub fn is_tx_in_trunk(&self, txid: &Hash256) -> bool {
        let _state = self.read_state();
        let Ok(tx) = self.query_transaction_unlocked(txid) else {
            return false;
        };
        if let Some(block) = self.block_cache.get(&tx.block_id) {
            return block.in_trunk;
        }
        match self.fetch_block(&tx.block_id) {
            Ok(block) => block.in_trunk,
            Err(e) => {
                warn!(block_id = %tx.block_id, error = %e, "claiming block not found");
                false
            }
        }
    }

    /// Look up the trunk block at a height.
    pub fn query_block_by_height(&self, height: u64) -> Result<Arc<Block>, LedgerError> {
        let _state = self.read_state();
        let bytes = self
            .store
            .get(HEIGHT_PREFIX, &Store::height_key(height))?
            .ok_or(LedgerError::BlockNotExist)?;
        let id: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Corrupt("height index entry is not 32 bytes".into()))?;
        self.query_block_unlocked(&Hash256(id))
    }

    /// Look up the block claiming a confirmed transaction.
    pub fn query_block_by_txid(&self, txid: &Hash256) -> Result<Block, LedgerError> {
        let _state = self.read_state();
        if !self.store.has(CONFIRMED_PREFIX, txid.as_bytes())? {
            return Err(LedgerError::TxNotConfirmed);
        }
        let tx = self.query_transaction_unlocked(txid)?;
        let bytes = self
            .store
            .get(BLOCKS_PREFIX, tx.block_id.as_bytes())?
            .ok_or(LedgerError::BlockNotExist)?;
        decode_block(&bytes)
    }

    /// All registered chain tips (the trunk tip included) with heights.
    pub fn branch_tips(&self) -> Result<Vec<(Hash256, u64)>, LedgerError> {
        let _state = self.read_state();
        branch::branch_tips(&self.store)
    }

    // --- Reorg walker ---

    /// Blocks to undo and to apply, in order, to move the state machine
    /// from `cur_block_id` to `dest_block_id`. Both lists carry full
    /// bodies; the fork point is in neither.
    pub fn find_undo_and_todo_blocks(
        &self,
        cur_block_id: &Hash256,
        dest_block_id: &Hash256,
    ) -> Result<(Vec<Block>, Vec<Block>), LedgerError> {
        let state = self.read_state();
        let mut undo_blocks = Vec::new();
        let mut todo_blocks = Vec::new();
        if cur_block_id == dest_block_id {
            return Ok((undo_blocks, todo_blocks));
        }
        let root = state.meta.root_block_id;

        let mut old_tip = read_block_with_body(&self.store, cur_block_id)?;
        let mut new_tip = read_block_with_body(&self.store, dest_block_id)?;
        let mut visited: HashSet<Hash256> = HashSet::new();
        visited.insert(old_tip.block_id);
        visited.insert(new_tip.block_id);
        undo_blocks.push(old_tip.clone());
        todo_blocks.push(new_tip.clone());

        // Walk both cursors backward, always advancing the higher side
        // (ties advance both); the first revisited id is the fork point.
        let split_id;
        loop {
            let old_pre = old_tip.pre_hash;
            if !old_pre.is_zero() && old_tip.height >= new_tip.height {
                old_tip = read_block_with_body(&self.store, &old_pre)?;
                if visited.contains(&old_tip.block_id) {
                    split_id = old_tip.block_id;
                    break;
                }
                visited.insert(old_tip.block_id);
                undo_blocks.push(old_tip.clone());
            }
            let new_pre = new_tip.pre_hash;
            if !new_pre.is_zero() && new_tip.height >= old_tip.height {
                new_tip = read_block_with_body(&self.store, &new_pre)?;
                if visited.contains(&new_tip.block_id) {
                    split_id = new_tip.block_id;
                    break;
                }
                visited.insert(new_tip.block_id);
                todo_blocks.push(new_tip.clone());
            }
            if old_pre.is_zero() && new_pre.is_zero() {
                split_id = root;
                break;
            }
        }

        if undo_blocks.last().map(|b| b.block_id) == Some(split_id) {
            undo_blocks.pop();
        }
        if todo_blocks.last().map(|b| b.block_id) == Some(split_id) {
            todo_blocks.pop();
        }
        Ok((undo_blocks, todo_blocks))
    }

    // --- Pending blocks ---

    /// Stage a full block (header and body) for later confirmation.
    pub fn save_pending_block(&self, block: &Block) -> Result<(), LedgerError> {
        debug!(
            block_id = %block.block_id,
            tx_count = block.transactions.len(),
            "saving pending block"
        );
        let bytes = encode_block(block)?;
        self.store
            .put(PENDING_PREFIX, block.block_id.as_bytes(), &bytes)
    }

    /// Fetch a staged block.
    pub fn get_pending_block(&self, block_id: &Hash256) -> Result<Block, LedgerError> {
        let bytes = self
            .store
            .get(PENDING_PREFIX, block_id.as_bytes())?
            .ok_or_else(|| {
                debug!(%block_id, "block not in pending table");
                LedgerError::BlockNotExist
            })?;
        decode_block(&bytes)
    }

    // --- Amendments ---

    /// Amend a confirmed transaction in place: attach a [`ModifyBlock`]
    /// record and blank its `desc` and extended outputs. The txid is
    /// unchanged, so the claiming block's merkle leaves stay valid.
    pub fn update_blockchain_data(
        &self,
        txid: &str,
        ptxid: &str,
        public_key: &str,
        sign: &str,
        height: u64,
    ) -> Result<(), LedgerError> {
        if txid.is_empty() || ptxid.is_empty() {
            return Err(LedgerError::Corrupt("amendment request missing a txid".into()));
        }
        let _state = self.write_state();
        info!(txid, ptxid, "amending confirmed transaction");

        let raw_txid = Hash256::from_hex(txid)
            .ok_or_else(|| LedgerError::Corrupt("malformed txid hex".into()))?;
        let mut tx = self.query_transaction_unlocked(&raw_txid)?;
        tx.modify_block = Some(ModifyBlock {
            effective_txid: ptxid.to_string(),
            effective_height: height,
            public_key: public_key.to_string(),
            sign: sign.to_string(),
        });
        tx.desc = Vec::new();
        tx.tx_outputs_ext = Vec::new();

        let bytes = encode_tx(&tx)?;
        self.store.put(CONFIRMED_PREFIX, tx.txid.as_bytes(), &bytes)?;
        // The claiming block's cached body is now stale.
        self.block_cache.remove(&tx.block_id);
        info!(txid, "amendment persisted");
        Ok(())
    }

    // --- Truncation ---

    /// Roll the ledger back so `dest_block_id` becomes the trunk tip.
    ///
    /// Every chain above the target height is walked backward and its
    /// blocks deleted from the block table and height index; affected
    /// cache entries are purged eagerly. Branch registry and meta are
    /// rewritten in the same batch. Destructive — the inverse of append.
    pub fn truncate(&self, dest_block_id: &Hash256) -> Result<(), LedgerError> {
        let mut state = self.write_state();
        info!(block_id = %dest_block_id, "truncating ledger");

        let mut batch = WriteBatch::default();
        let mut new_meta = state.meta.clone();
        new_meta.tip_block_id = *dest_block_id;

        let target = (*self.fetch_block(dest_block_id)?).clone();
        let tips = branch::branch_tips_above(&self.store, target.height, dest_block_id)?;
        for tip in &tips {
            self.remove_blocks(tip, &target, &mut batch)?;
            branch::update_branch_info(&mut batch, dest_block_id, tip, target.height);
        }

        // The target is the tip now; its trunk successor is gone.
        let mut new_tip = target.clone();
        new_tip.next_hash = Hash256::ZERO;
        self.save_block(&new_tip, &mut batch)?;

        new_meta.trunk_height = target.height;
        batch_put(&mut batch, META_PREFIX, b"", &encode_meta(&new_meta)?);
        self.store.write(batch)?;
        state.meta = new_meta;

        info!(height = target.height, "truncate complete");
        Ok(())
    }

    /// Walk backward from `from_id`, deleting blocks while they sit above
    /// the target height. A missing predecessor ends the walk (orphan).
    fn remove_blocks(
        &self,
        from_id: &Hash256,
        target: &Block,
        batch: &mut WriteBatch,
    ) -> Result<(), LedgerError> {
        let mut cursor = self.fetch_block(from_id)?;
        while cursor.height > target.height {
            info!(block_id = %cursor.block_id, height = cursor.height, "removing block");
            self.header_cache.remove(&cursor.block_id);
            self.block_cache.remove(&cursor.block_id);
            batch_delete(batch, BLOCKS_PREFIX, cursor.block_id.as_bytes());
            if cursor.in_trunk {
                batch_delete(batch, HEIGHT_PREFIX, &Store::height_key(cursor.height));
            }
            cursor = match self.fetch_block(&cursor.pre_hash) {
                Ok(block) => block,
                Err(_) => {
                    warn!(pre_hash = %cursor.pre_hash, "predecessor missing, stopping walk");
                    break;
                }
            };
        }
        Ok(())
    }

    // --- Introspection ---

    /// The whole block table grouped by height: one summary string per
    /// block, trunk and branches alike.
    pub fn dump(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        let state = self.read_state();
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); state.meta.trunk_height as usize + 1];
        for (_, value) in self.store.scan_prefix(BLOCKS_PREFIX)? {
            let block = decode_block(&value)?;
            let line = format!(
                "{{id: {}, txs: {}, in_trunk: {}, tm: {}, proposer: {}}}",
                block.block_id,
                block.tx_count,
                block.in_trunk,
                block.timestamp,
                String::from_utf8_lossy(&block.proposer),
            );
            if let Some(level) = levels.get_mut(block.height as usize) {
                level.push(line);
            }
        }
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis_json(award: u64) -> Vec<u8> {
        serde_json::json!({
            "version": "1",
            "award": award,
            "max_block_size": 16_777_216u64,
            "irreversible_slide_window": 20u64,
            "gas_price": 3u64,
        })
        .to_string()
        .into_bytes()
    }

    fn coinbase(award: u64, height: u64) -> Transaction {
        coinbase_with_desc(award, height, format!("coinbase-{height}").into_bytes())
    }

    fn coinbase_with_desc(award: u64, height: u64, desc: Vec<u8>) -> Transaction {
        let mut tx = Transaction {
            coinbase: true,
            desc,
            tx_outputs: vec![arbor_core::types::TxOutput {
                amount: award,
                to_addr: b"miner".to_vec(),
            }],
            nonce: height.to_string(),
            ..Transaction::default()
        };
        tx.txid = tx.compute_txid();
        tx
    }

    fn create_ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger =
            Ledger::create(dir.path(), &genesis_json(100), LedgerOptions::default()).unwrap();
        (dir, ledger)
    }

    fn confirm_root(ledger: &Ledger) -> Block {
        let cb = coinbase_with_desc(100, 0, genesis_json(100));
        let mut root = ledger.format_root_block(vec![cb]).unwrap();
        let status = ledger.confirm_block(&mut root, true);
        assert!(status.succ, "root confirm failed: {:?}", status.error);
        root
    }

    // --- Open / create ---

    #[test]
    fn open_missing_ledger_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Ledger::open(dir.path().join("absent"), LedgerOptions::default()).unwrap_err();
        assert_eq!(err, LedgerError::BlockNotExist);
    }

    #[test]
    fn create_starts_empty() {
        let (_dir, ledger) = create_ledger();
        let meta = ledger.meta();
        assert!(meta.root_block_id.is_zero());
        assert!(meta.tip_block_id.is_zero());
        assert_eq!(meta.trunk_height, 0);
    }

    #[test]
    fn genesis_getters_reflect_config() {
        let (_dir, ledger) = create_ledger();
        assert_eq!(ledger.calc_award(0), 100);
        assert_eq!(ledger.max_block_size(), 16_777_216);
        assert_eq!(ledger.irreversible_slide_window(), 20);
        assert_eq!(ledger.gas_price(), 3);
        assert!(!ledger.no_fee());
    }

    // --- Formatting and verification ---

    #[test]
    fn formatted_block_verifies() {
        let (_dir, ledger) = create_ledger();
        let root = confirm_root(&ledger);
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let block = ledger
            .format_miner_block(
                vec![coinbase(100, 1)],
                kp.address().as_bytes(),
                &kp,
                1_700_000_000,
                1,
                1,
                root.block_id,
                0,
                None,
                BTreeMap::new(),
                1,
            )
            .unwrap();
        assert!(ledger.verify_block(&block));
    }

    #[test]
    fn tampered_block_fails_verification() {
        let (_dir, ledger) = create_ledger();
        let root = confirm_root(&ledger);
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let mut block = ledger
            .format_block(
                vec![coinbase(100, 1)],
                kp.address().as_bytes(),
                &kp,
                1_700_000_000,
                1,
                1,
                root.block_id,
            )
            .unwrap();
        block.timestamp += 1; // id no longer matches
        assert!(!ledger.verify_block(&block));
    }

    #[test]
    fn fake_block_has_leaves_only_tree_and_no_sign() {
        let (_dir, ledger) = create_ledger();
        let root = confirm_root(&ledger);
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let txs = vec![coinbase(100, 1), coinbase(100, 2), coinbase(100, 3)];
        let fake = ledger
            .format_fake_block(
                txs,
                kp.address().as_bytes(),
                &kp,
                1_700_000_000,
                1,
                1,
                root.block_id,
                1,
            )
            .unwrap();
        assert_eq!(fake.merkle_tree.len(), 3);
        assert!(fake.sign.is_empty());
        assert!(!fake.block_id.is_zero());
    }

    #[test]
    fn fake_and_real_blocks_share_no_id_collision_guarantee() {
        // Same txs, same fields: the real block hashes internal merkle
        // nodes so the two roots (and therefore ids) differ for >1 tx.
        let (_dir, ledger) = create_ledger();
        let root = confirm_root(&ledger);
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let txs = vec![coinbase(100, 1), coinbase(100, 2)];
        let real = ledger
            .format_block(
                txs.clone(),
                kp.address().as_bytes(),
                &kp,
                5,
                1,
                1,
                root.block_id,
            )
            .unwrap();
        let fake = ledger
            .format_fake_block(txs, kp.address().as_bytes(), &kp, 5, 1, 1, root.block_id, 1)
            .unwrap();
        assert_ne!(real.block_id, fake.block_id);
    }

    // --- Root confirmation ---

    #[test]
    fn confirm_root_sets_meta() {
        let (_dir, ledger) = create_ledger();
        let root = confirm_root(&ledger);
        let meta = ledger.meta();
        assert_eq!(meta.root_block_id, root.block_id);
        assert_eq!(meta.tip_block_id, root.block_id);
        assert_eq!(meta.trunk_height, 0);
    }

    #[test]
    fn confirm_root_twice_rejected() {
        let (_dir, ledger) = create_ledger();
        confirm_root(&ledger);
        let cb = coinbase_with_desc(100, 0, genesis_json(100));
        let mut again = ledger.format_root_block(vec![cb]).unwrap();
        let status = ledger.confirm_block(&mut again, true);
        assert!(!status.succ);
        assert_eq!(status.error, Some(LedgerError::RootBlockAlreadyExist));
    }

    #[test]
    fn confirm_root_with_pre_hash_rejected() {
        let (_dir, ledger) = create_ledger();
        let cb = coinbase_with_desc(100, 0, genesis_json(100));
        let mut root = ledger.format_root_block(vec![cb]).unwrap();
        root.pre_hash = Hash256([1; 32]);
        root.block_id = make_block_id(&root);
        let status = ledger.confirm_block(&mut root, true);
        assert!(!status.succ);
    }

    #[test]
    fn reopen_recovers_meta_and_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let root_id;
        {
            let ledger =
                Ledger::create(dir.path(), &genesis_json(100), LedgerOptions::default()).unwrap();
            root_id = confirm_root(&ledger).block_id;
            ledger.close();
        }
        let reopened = Ledger::open(dir.path(), LedgerOptions::default()).unwrap();
        assert_eq!(reopened.meta().root_block_id, root_id);
        assert_eq!(reopened.calc_award(0), 100);
    }

    #[test]
    fn confirm_unknown_parent_rejected() {
        let (_dir, ledger) = create_ledger();
        confirm_root(&ledger);
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let mut block = ledger
            .format_block(
                vec![coinbase(100, 1)],
                kp.address().as_bytes(),
                &kp,
                1,
                1,
                1,
                Hash256([0xEE; 32]),
            )
            .unwrap();
        let status = ledger.confirm_block(&mut block, false);
        assert!(!status.succ);
        assert_eq!(status.error, Some(LedgerError::BlockNotExist));
    }
}
