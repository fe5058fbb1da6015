//! The consensus engine.
//!
//! `Blockchain` owns the main-chain index, the alternative-chain set, and
//! the invalid-block set, and drives every state transition: extending the
//! main chain, tracking side chains, and switching to a heavier fork. It
//! shares custody of transaction bodies with the memory pool, pulling them
//! when a block connects and pushing them back when one disconnects.
//!
//! Lock order is fixed: the pool mutex first, the chain mutex second. Every
//! public entry point that needs both takes them in that order.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use rand::seq::SliceRandom;

use crate::checkpoints::Checkpoints;
use crate::constants::{
    BLOCK_GRANTED_FULL_REWARD_ZONE, BLOCK_IDS_SYNCHRONIZING_DEFAULT_COUNT,
    BLOCK_TEMPLATE_MINER_TX_TRIES, COINBASE_BLOB_RESERVED_SIZE, COINBASE_UNLOCK_WINDOW,
    CURRENT_BLOCK_MAJOR_VERSION, CURRENT_BLOCK_MINOR_VERSION, DIFFICULTY_BLOCKS_COUNT,
    REWARD_BLOCKS_WINDOW, TIMESTAMP_CHECK_WINDOW,
};
use crate::difficulty::next_difficulty;
use crate::error::{hash_str, ConsensusError, Result};
use crate::hashing::{block_hash, block_hashing_blob, double_sha256, tx_blob_size, tx_hash, tx_prefix_blob};
use crate::ledger::LedgerIndex;
use crate::pool::TxMemoryPool;
use crate::pow::{check_hash, PowHasher};
use crate::transaction::{
    construct_miner_tx, get_tx_fee, relative_output_offsets_to_absolute,
};
use crate::types::{
    Block, BlockAddResult, BlockHeader, ChainSupplement, Difficulty, ExtendedBlock, Hash, KeyImage,
    PublicKey, RandomOutputEntry, Signature, Transaction, TxInput, TxOutTarget,
};
use crate::validate::{
    check_block_timestamp, check_timestamp_not_in_future, is_tx_spendtime_unlocked, median,
    prevalidate_miner_tx, validate_miner_tx,
};

/// Ring signature verification, provided by the cryptography layer.
pub trait RingSignatureVerifier {
    /// Does `signatures` prove that the owner of `key_image` controls one of
    /// the `ring` keys, committing to `prefix_hash`?
    fn check_ring_signature(
        &self,
        prefix_hash: &Hash,
        key_image: &KeyImage,
        ring: &[PublicKey],
        signatures: &[Signature],
    ) -> bool;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn adjusted_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything guarded by the chain lock.
struct ChainState {
    ledger: LedgerIndex,
    alternative_chains: HashMap<Hash, ExtendedBlock>,
    invalid_blocks: HashSet<Hash>,
    checkpoints: Checkpoints,
    current_cumulative_size_limit: u64,
    pow: Box<dyn PowHasher + Send>,
    ring_verifier: Box<dyn RingSignatureVerifier + Send>,
}

/// The blockchain with its transaction pool.
pub struct Blockchain<P: TxMemoryPool> {
    tx_pool: Mutex<P>,
    chain: Mutex<ChainState>,
}

impl<P: TxMemoryPool> Blockchain<P> {
    /// Start a chain from `genesis`, which is validated like any other
    /// block (at difficulty one).
    pub fn new(
        pool: P,
        checkpoints: Checkpoints,
        pow: Box<dyn PowHasher + Send>,
        ring_verifier: Box<dyn RingSignatureVerifier + Send>,
        genesis: Block,
    ) -> Result<Self> {
        let chain = Blockchain {
            tx_pool: Mutex::new(pool),
            chain: Mutex::new(ChainState {
                ledger: LedgerIndex::new(),
                alternative_chains: HashMap::new(),
                invalid_blocks: HashSet::new(),
                checkpoints,
                current_cumulative_size_limit: 2 * BLOCK_GRANTED_FULL_REWARD_ZONE,
                pow,
                ring_verifier,
            }),
        };
        {
            let mut pool = lock(&chain.tx_pool);
            let mut state = lock(&chain.chain);
            let id = block_hash(&genesis);
            state.handle_block_to_main_chain(&mut *pool, genesis, id)?;
        }
        Ok(chain)
    }

    /// Process a new block from any source: the miner, a peer, or a resync.
    pub fn add_block(&self, block: Block) -> Result<BlockAddResult> {
        let mut pool = lock(&self.tx_pool);
        let mut state = lock(&self.chain);
        state.add_block(&mut *pool, block)
    }

    /// Drop the whole chain and start over from a new genesis block.
    pub fn reset_and_set_genesis_block(&self, genesis: Block) -> Result<BlockAddResult> {
        let mut pool = lock(&self.tx_pool);
        let mut state = lock(&self.chain);
        state.ledger.clear();
        state.alternative_chains.clear();
        state.invalid_blocks.clear();
        state.current_cumulative_size_limit = 2 * BLOCK_GRANTED_FULL_REWARD_ZONE;
        let id = block_hash(&genesis);
        state.handle_block_to_main_chain(&mut *pool, genesis, id)
    }

    /// Submit a transaction to the memory pool, after checking its inputs
    /// against the current chain.
    pub fn add_tx(&self, tx: Transaction) -> Result<()> {
        let mut pool = lock(&self.tx_pool);
        let state = lock(&self.chain);
        let id = tx_hash(&tx);
        state.check_tx_inputs(&tx, &id, false)?;
        pool.add_tx(tx, false)
    }

    pub fn height(&self) -> u64 {
        lock(&self.chain).ledger.height()
    }

    pub fn top_hash(&self) -> Hash {
        lock(&self.chain).ledger.top_hash()
    }

    /// Known in any capacity: main chain, side chain, or invalid set.
    pub fn have_block(&self, id: &Hash) -> bool {
        let state = lock(&self.chain);
        state.ledger.have_block(id)
            || state.alternative_chains.contains_key(id)
            || state.invalid_blocks.contains(id)
    }

    pub fn block_by_hash(&self, id: &Hash) -> Option<ExtendedBlock> {
        lock(&self.chain).ledger.block_by_hash(id).cloned()
    }

    pub fn block_id_by_height(&self, height: u64) -> Option<Hash> {
        lock(&self.chain).ledger.block_id_by_height(height)
    }

    /// Main-chain blocks `[start, start + count)`, truncated at the tip.
    pub fn get_blocks(&self, start: u64, count: usize) -> Vec<ExtendedBlock> {
        let state = lock(&self.chain);
        (start..state.ledger.height())
            .take(count)
            .filter_map(|h| state.ledger.block_by_height(h).cloned())
            .collect()
    }

    pub fn get_alternative_blocks(&self) -> Vec<ExtendedBlock> {
        lock(&self.chain)
            .alternative_chains
            .values()
            .cloned()
            .collect()
    }

    pub fn alternative_blocks_count(&self) -> usize {
        lock(&self.chain).alternative_chains.len()
    }

    pub fn total_transactions(&self) -> usize {
        lock(&self.chain).ledger.total_transactions()
    }

    pub fn have_tx(&self, id: &Hash) -> bool {
        lock(&self.chain).ledger.have_tx(id)
    }

    pub fn get_tx(&self, id: &Hash) -> Option<Transaction> {
        lock(&self.chain).ledger.tx_by_hash(id).map(|e| e.tx.clone())
    }

    pub fn tx_output_global_indexes(&self, id: &Hash) -> Option<Vec<u64>> {
        lock(&self.chain)
            .ledger
            .tx_output_global_indexes(id)
            .map(|s| s.to_vec())
    }

    pub fn have_tx_keyimg_as_spent(&self, image: &KeyImage) -> bool {
        lock(&self.chain).ledger.have_tx_keyimg_as_spent(image)
    }

    pub fn block_difficulty(&self, height: u64) -> Option<Difficulty> {
        lock(&self.chain).ledger.block_difficulty(height)
    }

    pub fn next_difficulty(&self) -> Difficulty {
        lock(&self.chain).difficulty_for_next_block()
    }

    pub fn cumulative_difficulty(&self) -> Difficulty {
        lock(&self.chain).ledger.cumulative_difficulty()
    }

    pub fn cumulative_size_limit(&self) -> u64 {
        lock(&self.chain).current_cumulative_size_limit
    }

    /// Answer a peer's sync request given its block locator, returning at
    /// most `max_count` block ids from the last shared block upward.
    pub fn find_chain_supplement(
        &self,
        qblock_ids: &[Hash],
        max_count: usize,
    ) -> Result<ChainSupplement> {
        let state = lock(&self.chain);
        let start_height = state.ledger.find_split_point(qblock_ids)?;
        let block_ids = (start_height..state.ledger.height())
            .take(max_count.min(BLOCK_IDS_SYNCHRONIZING_DEFAULT_COUNT))
            .filter_map(|h| state.ledger.block_id_by_height(h))
            .collect();
        Ok(ChainSupplement {
            start_height,
            total_height: state.ledger.height(),
            block_ids,
        })
    }

    /// Our own block locator: the last ten block ids, then exponentially
    /// sparser ids back to genesis, genesis always included.
    pub fn get_short_chain_history(&self) -> Vec<Hash> {
        let state = lock(&self.chain);
        let height = state.ledger.height();
        let mut ids = Vec::new();
        if height == 0 {
            return ids;
        }
        let mut back_offset: u64 = 1;
        let mut multiplier: u64 = 1;
        let mut genesis_included = false;
        let mut step = 0usize;
        while back_offset < height {
            let h = height - back_offset;
            if let Some(id) = state.ledger.block_id_by_height(h) {
                ids.push(id);
            }
            if h == 0 {
                genesis_included = true;
            }
            if step < 10 {
                back_offset += 1;
            } else {
                multiplier *= 2;
                back_offset += multiplier;
            }
            step += 1;
        }
        if !genesis_included {
            if let Some(id) = state.ledger.block_id_by_height(0) {
                ids.push(id);
            }
        }
        ids
    }

    /// Sample decoy outputs for ring construction: for each requested amount,
    /// up to `outs_count` distinct unlocked outputs. An amount with too few
    /// eligible outputs yields however many exist, possibly none.
    pub fn get_random_outputs_for_amounts(
        &self,
        amounts: &[u64],
        outs_count: usize,
    ) -> Vec<(u64, Vec<RandomOutputEntry>)> {
        let state = lock(&self.chain);
        let next_height = state.ledger.height();
        let now = adjusted_time();
        let mut result = Vec::with_capacity(amounts.len());
        let mut rng = rand::thread_rng();
        for &amount in amounts {
            let total = state.ledger.outputs_count(amount);
            let mut eligible: Vec<u64> = (0..total)
                .filter(|&gindex| {
                    state
                        .decoy_output_key(amount, gindex, next_height, now)
                        .is_some()
                })
                .collect();
            eligible.shuffle(&mut rng);
            eligible.truncate(outs_count);
            eligible.sort_unstable();
            let entries = eligible
                .into_iter()
                .filter_map(|gindex| {
                    state
                        .decoy_output_key(amount, gindex, next_height, now)
                        .map(|key| RandomOutputEntry {
                            global_index: gindex,
                            key,
                        })
                })
                .collect();
            result.push((amount, entries));
        }
        result
    }

    /// Build a mining template on top of the current chain: pool
    /// transactions plus a coinbase sized by fixed-point iteration.
    pub fn create_block_template(
        &self,
        miner_key: PublicKey,
        extra: Vec<u8>,
    ) -> Result<(Block, Difficulty, u64)> {
        let pool = lock(&self.tx_pool);
        let state = lock(&self.chain);

        let height = state.ledger.height();
        let effective_median = median(state.ledger.backward_block_sizes(REWARD_BLOCKS_WINDOW))
            .max(BLOCK_GRANTED_FULL_REWARD_ZONE);
        let (tx_ids, txs_size, fee) = pool.fill_block_template(effective_median);
        let already_generated = state.ledger.already_generated_coins();
        let difficulty = state.difficulty_for_next_block();

        let miner_tx = construct_miner_tx(
            height,
            effective_median,
            already_generated,
            txs_size + COINBASE_BLOB_RESERVED_SIZE,
            fee,
            miner_key,
            extra.clone(),
        )?;
        let mut block = Block {
            header: BlockHeader {
                major_version: CURRENT_BLOCK_MAJOR_VERSION,
                minor_version: CURRENT_BLOCK_MINOR_VERSION,
                timestamp: adjusted_time(),
                prev_id: state.ledger.top_hash(),
                nonce: 0,
            },
            miner_tx,
            tx_hashes: tx_ids,
        };

        // The reward depends on the block size and the block size on the
        // coinbase; iterate until the pair is consistent.
        for _ in 0..BLOCK_TEMPLATE_MINER_TX_TRIES {
            let cumulative = tx_blob_size(&block.miner_tx) + txs_size;
            let next = construct_miner_tx(
                height,
                effective_median,
                already_generated,
                cumulative,
                fee,
                miner_key,
                extra.clone(),
            )?;
            if next == block.miner_tx {
                return Ok((block, difficulty, height));
            }
            block.miner_tx = next;
        }
        warn!("block template coinbase sizing did not converge, using last attempt");
        Ok((block, difficulty, height))
    }

    /// Validate a standalone transaction's inputs against the chain,
    /// returning the height of the newest block it references.
    pub fn check_tx_inputs(&self, tx: &Transaction) -> Result<u64> {
        let state = lock(&self.chain);
        let id = tx_hash(tx);
        state.check_tx_inputs(tx, &id, false)
    }

    pub fn add_checkpoint(&self, height: u64, hash: Hash) -> Result<()> {
        lock(&self.chain).checkpoints.add_checkpoint(height, hash)
    }

    pub fn load_checkpoints_from_json(&self, path: &Path) -> Result<usize> {
        lock(&self.chain).checkpoints.load_from_json(path)
    }

    pub fn load_checkpoints_from_dns(&self, sources: &[Vec<String>]) -> Result<usize> {
        lock(&self.chain).checkpoints.load_from_dns_records(sources)
    }

    /// Run `f` against the pool, under the standard lock order.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut pool = lock(&self.tx_pool);
        f(&mut *pool)
    }
}

impl ChainState {
    fn add_block<P: TxMemoryPool>(&mut self, pool: &mut P, block: Block) -> Result<BlockAddResult> {
        let id = block_hash(&block);
        if self.ledger.have_block(&id)
            || self.alternative_chains.contains_key(&id)
            || self.invalid_blocks.contains(&id)
        {
            return Ok(BlockAddResult::AlreadyExists);
        }
        if block.header.prev_id != self.ledger.top_hash() {
            return self.handle_alternative_block(pool, block, id);
        }
        self.handle_block_to_main_chain(pool, block, id)
    }

    fn difficulty_for_next_block(&self) -> Difficulty {
        let (timestamps, difficulties) =
            self.ledger.timestamps_and_difficulties(DIFFICULTY_BLOCKS_COUNT);
        next_difficulty(timestamps, difficulties)
    }

    fn update_next_cumulative_size_limit(&mut self) {
        let sizes = self.ledger.backward_block_sizes(REWARD_BLOCKS_WINDOW);
        let effective_median = median(sizes).max(BLOCK_GRANTED_FULL_REWARD_ZONE);
        self.current_cumulative_size_limit = effective_median * 2;
    }

    /// Connect a block whose parent is the current tip.
    fn handle_block_to_main_chain<P: TxMemoryPool>(
        &mut self,
        pool: &mut P,
        block: Block,
        id: Hash,
    ) -> Result<BlockAddResult> {
        let height = self.ledger.height();
        let now = adjusted_time();

        if block.header.prev_id != self.ledger.top_hash() {
            return Err(ConsensusError::OrphanBlock(hash_str(&block.header.prev_id)));
        }
        check_timestamp_not_in_future(block.header.timestamp, now)?;
        check_block_timestamp(
            self.ledger.last_timestamps(TIMESTAMP_CHECK_WINDOW),
            block.header.timestamp,
        )?;

        let difficulty = self.difficulty_for_next_block();
        self.check_against_checkpoint_or_pow(&block, height, &id, difficulty)?;

        // Proof of work (or a checkpoint) has vouched for this block; from
        // here on a consensus rejection is remembered as invalid.
        if let Err(e) = prevalidate_miner_tx(&block, height) {
            self.invalid_blocks.insert(id);
            return Err(e);
        }

        let in_checkpoint_zone = self.checkpoints.is_in_checkpoint_zone(height);
        let miner_tx_id = tx_hash(&block.miner_tx);
        // A storage-add failure is the node's state disagreeing with the
        // block, not proof the block is bad; reject without remembering it.
        if let Err(e) = self
            .ledger
            .add_transaction(miner_tx_id, &block.miner_tx, height)
        {
            return Err(e);
        }

        let mut cumulative_block_size = tx_blob_size(&block.miner_tx);
        let mut fee_summary = 0u64;
        let mut applied: Vec<Hash> = Vec::with_capacity(block.tx_hashes.len());

        for tx_id in &block.tx_hashes {
            let (tx, blob_size, fee) = match pool.take_tx(tx_id) {
                Some(entry) => entry,
                None => {
                    warn!(
                        "block {} references transaction {} which is not in the pool",
                        hash_str(&id),
                        hash_str(tx_id)
                    );
                    // Not the block's fault; the node may simply be missing
                    // the transaction. Do not remember it as invalid.
                    self.purge_applied(pool, &miner_tx_id, &applied);
                    return Err(ConsensusError::TransactionNotInPool(hash_str(tx_id)));
                }
            };

            if let Err(e) = self.check_tx_inputs(&tx, tx_id, in_checkpoint_zone) {
                warn!(
                    "block {} carries invalid transaction {}: {}",
                    hash_str(&id),
                    hash_str(tx_id),
                    e
                );
                if pool.add_tx(tx, true).is_err() {
                    warn!("could not return transaction {} to the pool", hash_str(tx_id));
                }
                self.invalid_blocks.insert(id);
                self.purge_applied(pool, &miner_tx_id, &applied);
                return Err(e);
            }
            if let Err(e) = self.ledger.add_transaction(*tx_id, &tx, height) {
                if pool.add_tx(tx, true).is_err() {
                    warn!("could not return transaction {} to the pool", hash_str(tx_id));
                }
                self.purge_applied(pool, &miner_tx_id, &applied);
                return Err(e);
            }
            fee_summary += fee;
            cumulative_block_size += blob_size;
            applied.push(*tx_id);
        }

        let median_size = median(self.ledger.backward_block_sizes(REWARD_BLOCKS_WINDOW));
        let already_generated = self.ledger.already_generated_coins();
        let base_reward = match validate_miner_tx(
            &block,
            cumulative_block_size,
            median_size,
            already_generated,
            fee_summary,
        ) {
            Ok(reward) => reward,
            Err(e) => {
                self.invalid_blocks.insert(id);
                self.purge_applied(pool, &miner_tx_id, &applied);
                return Err(e);
            }
        };

        let extended = ExtendedBlock {
            height,
            block_cumulative_size: cumulative_block_size,
            cumulative_difficulty: self.ledger.cumulative_difficulty() + difficulty,
            already_generated_coins: already_generated.saturating_add(base_reward),
            block,
        };
        self.ledger.push_block(id, extended);
        self.update_next_cumulative_size_limit();
        pool.on_blockchain_inc(self.ledger.height(), id);

        info!(
            "block {} added at height {}: difficulty {}, reward {}, fees {}, {} bytes",
            hash_str(&id),
            height,
            difficulty,
            base_reward,
            fee_summary,
            cumulative_block_size
        );
        Ok(BlockAddResult::AddedToMainChain)
    }

    /// Inside the checkpoint zone the pinned hashes are the whole authority:
    /// no proof of work is computed, checkpointed heights must match their
    /// pin, and the heights between pins pass on ancestry alone. Above the
    /// zone the proof of work must meet the required difficulty.
    ///
    /// A hash contradicting its checkpoint is not an ordinary rejection: it
    /// means the checkpoint feed and the network disagree about settled
    /// history, and no later block can be judged. That aborts the process.
    fn check_against_checkpoint_or_pow(
        &self,
        block: &Block,
        height: u64,
        id: &Hash,
        difficulty: Difficulty,
    ) -> Result<()> {
        if self.checkpoints.is_in_checkpoint_zone(height) {
            let (checkpoint_ok, _) = self.checkpoints.check_block(height, id);
            if !checkpoint_ok {
                error!(
                    "checkpoint validation failed at height {}: got block {}, pinned {}",
                    height,
                    hash_str(id),
                    self.checkpoints
                        .hash_at(height)
                        .map(|h| hash_str(&h))
                        .unwrap_or_default()
                );
                panic!("checkpoint validation failed");
            }
            return Ok(());
        }
        let pow_hash = self.pow.hash(&block_hashing_blob(block));
        if !check_hash(&pow_hash, difficulty) {
            return Err(ConsensusError::ProofOfWorkTooWeak { difficulty });
        }
        Ok(())
    }

    /// Undo a partially applied block: remove the applied member
    /// transactions (newest first, preserving the output-table LIFO
    /// invariant), return them to the pool, then remove the coinbase.
    ///
    /// Only the most recently applied entry gets the strict key-image check;
    /// see `LedgerIndex::remove_transaction`.
    fn purge_applied<P: TxMemoryPool>(&mut self, pool: &mut P, miner_tx_id: &Hash, applied: &[Hash]) {
        for (i, tx_id) in applied.iter().rev().enumerate() {
            let tx = self.ledger.remove_transaction(tx_id, i == 0);
            if pool.add_tx(tx, true).is_err() {
                warn!(
                    "transaction {} dropped while unwinding a rejected block",
                    hash_str(tx_id)
                );
            }
        }
        self.ledger.remove_transaction(miner_tx_id, applied.is_empty());
    }

    /// Disconnect the top block, returning member transactions to the pool.
    fn pop_block_from_blockchain<P: TxMemoryPool>(&mut self, pool: &mut P) -> Block {
        let top = match self.ledger.top_block() {
            Some(top) => top.block.clone(),
            None => {
                error!("attempted to disconnect a block from an empty chain");
                panic!("ledger index corrupted");
            }
        };
        for tx_id in top.tx_hashes.iter().rev() {
            let tx = self.ledger.remove_transaction(tx_id, true);
            if pool.add_tx(tx, true).is_err() {
                warn!(
                    "transaction {} dropped while disconnecting block",
                    hash_str(tx_id)
                );
            }
        }
        self.ledger.remove_transaction(&tx_hash(&top.miner_tx), true);
        if self.ledger.pop_block().is_none() {
            error!("chain emptied while a block was being disconnected");
            panic!("ledger index corrupted");
        }
        self.update_next_cumulative_size_limit();
        pool.on_blockchain_dec(self.ledger.height(), self.ledger.top_hash());
        top
    }

    /// Walk a side chain back to its main-chain connection point.
    ///
    /// Returns the alternative ancestors (oldest first, excluding the new
    /// block) and the split height: the first height NOT shared with the
    /// main chain.
    fn get_alternative_chain(&self, parent: &Hash) -> Result<(Vec<(Hash, ExtendedBlock)>, u64)> {
        let mut chain = Vec::new();
        let mut cursor = *parent;
        loop {
            if let Some(main_height) = self.ledger.block_height(&cursor) {
                chain.reverse();
                return Ok((chain, main_height + 1));
            }
            match self.alternative_chains.get(&cursor) {
                Some(block) => {
                    let prev = block.block.header.prev_id;
                    chain.push((cursor, block.clone()));
                    cursor = prev;
                }
                None => {
                    return Err(ConsensusError::AlternativeChainBroken(hash_str(&cursor)));
                }
            }
        }
    }

    /// Difficulty for the next block of a side chain: main-chain samples up
    /// to the split point topped up with the side chain's own.
    fn difficulty_for_alternative_chain(
        &self,
        alt_chain: &[(Hash, ExtendedBlock)],
        split_height: u64,
    ) -> Difficulty {
        let mut timestamps = Vec::new();
        let mut difficulties = Vec::new();
        if alt_chain.len() < DIFFICULTY_BLOCKS_COUNT {
            let main_count = (DIFFICULTY_BLOCKS_COUNT - alt_chain.len()) as u64;
            // The genesis block is not a retarget sample.
            let start = split_height.saturating_sub(main_count).max(1);
            for h in start..split_height {
                if let Some(b) = self.ledger.block_by_height(h) {
                    timestamps.push(b.block.header.timestamp);
                    difficulties.push(b.cumulative_difficulty);
                }
            }
            for (_, b) in alt_chain {
                timestamps.push(b.block.header.timestamp);
                difficulties.push(b.cumulative_difficulty);
            }
        } else {
            let start = alt_chain.len() - DIFFICULTY_BLOCKS_COUNT;
            for (_, b) in &alt_chain[start..] {
                timestamps.push(b.block.header.timestamp);
                difficulties.push(b.cumulative_difficulty);
            }
        }
        next_difficulty(timestamps, difficulties)
    }

    /// Top up a side chain's timestamp set with main-chain timestamps below
    /// the split until the median window is full (or the chain runs out).
    fn complete_timestamps_vector(&self, split_height: u64, timestamps: &mut Vec<u64>) {
        if timestamps.len() >= TIMESTAMP_CHECK_WINDOW {
            return;
        }
        let need = (TIMESTAMP_CHECK_WINDOW - timestamps.len()) as u64;
        let start = split_height.saturating_sub(need);
        for h in start..split_height {
            if let Some(b) = self.ledger.block_by_height(h) {
                timestamps.push(b.block.header.timestamp);
            }
        }
    }

    /// Store a block on a side chain, switching to that chain if it is now
    /// heavier than the main one.
    fn handle_alternative_block<P: TxMemoryPool>(
        &mut self,
        pool: &mut P,
        block: Block,
        id: Hash,
    ) -> Result<BlockAddResult> {
        let parent = block.header.prev_id;
        let parent_known = self.ledger.have_block(&parent)
            || self.alternative_chains.contains_key(&parent);
        if !parent_known {
            info!(
                "orphaned block {}: parent {} unknown",
                hash_str(&id),
                hash_str(&parent)
            );
            return Ok(BlockAddResult::Orphaned);
        }

        let (alt_chain, split_height) = self.get_alternative_chain(&parent)?;
        let block_height = split_height + alt_chain.len() as u64;

        if !self
            .checkpoints
            .is_alternative_block_allowed(self.ledger.height(), block_height)
        {
            return Err(ConsensusError::AlternativeBlockBelowCheckpoint {
                block_height,
                checkpoint_height: self
                    .checkpoints
                    .top_checkpoint_height()
                    .unwrap_or_default(),
            });
        }

        check_timestamp_not_in_future(block.header.timestamp, adjusted_time())?;
        let mut timestamps: Vec<u64> = alt_chain
            .iter()
            .map(|(_, b)| b.block.header.timestamp)
            .collect();
        self.complete_timestamps_vector(split_height, &mut timestamps);
        check_block_timestamp(timestamps, block.header.timestamp)?;

        let difficulty = self.difficulty_for_alternative_chain(&alt_chain, split_height);
        self.check_against_checkpoint_or_pow(&block, block_height, &id, difficulty)?;

        prevalidate_miner_tx(&block, block_height)?;

        let parent_cumulative_difficulty = match alt_chain.last() {
            Some((_, b)) => b.cumulative_difficulty,
            None => match self.ledger.block_by_height(split_height - 1) {
                Some(b) => b.cumulative_difficulty,
                None => return Err(ConsensusError::AlternativeChainBroken(hash_str(&parent))),
            },
        };

        let extended = ExtendedBlock {
            height: block_height,
            // Side-chain blocks carry no transaction bodies, so their true
            // cumulative size and emission are unknown until connected.
            block_cumulative_size: 0,
            cumulative_difficulty: parent_cumulative_difficulty + difficulty,
            already_generated_coins: 0,
            block,
        };
        let cumulative_difficulty = extended.cumulative_difficulty;
        self.alternative_chains.insert(id, extended);

        if cumulative_difficulty > self.ledger.cumulative_difficulty() {
            info!(
                "side chain through {} is heavier than the main chain ({} > {}), reorganizing",
                hash_str(&id),
                cumulative_difficulty,
                self.ledger.cumulative_difficulty()
            );
            let mut chain_ids: Vec<Hash> = alt_chain.iter().map(|(cid, _)| *cid).collect();
            chain_ids.push(id);
            self.switch_to_alternative_blockchain(pool, &chain_ids, split_height)?;
            Ok(BlockAddResult::AddedToMainChain)
        } else {
            info!(
                "block {} added as alternative at height {} (side-chain weight {}, main {})",
                hash_str(&id),
                block_height,
                cumulative_difficulty,
                self.ledger.cumulative_difficulty()
            );
            Ok(BlockAddResult::AddedAsAlternative)
        }
    }

    /// Replace the main chain above `split_height` with a side chain.
    ///
    /// On success the displaced blocks are re-filed as alternatives. If a
    /// promoted block fails full validation, the original chain is restored
    /// and the failing block plus its descendants are marked invalid.
    fn switch_to_alternative_blockchain<P: TxMemoryPool>(
        &mut self,
        pool: &mut P,
        chain_ids: &[Hash],
        split_height: u64,
    ) -> Result<()> {
        let mut disconnected = Vec::new();
        while self.ledger.height() > split_height {
            disconnected.push(self.pop_block_from_blockchain(pool));
        }
        disconnected.reverse();

        for (i, alt_id) in chain_ids.iter().enumerate() {
            let alt_block = match self.alternative_chains.get(alt_id) {
                Some(b) => b.block.clone(),
                None => {
                    self.rollback_blockchain_switching(pool, disconnected, split_height);
                    return Err(ConsensusError::AlternativeChainBroken(hash_str(alt_id)));
                }
            };
            if let Err(e) = self.handle_block_to_main_chain(pool, alt_block, *alt_id) {
                error!(
                    "promoted block {} failed full validation: {}",
                    hash_str(alt_id),
                    e
                );
                self.rollback_blockchain_switching(pool, disconnected, split_height);
                for bad_id in &chain_ids[i..] {
                    self.invalid_blocks.insert(*bad_id);
                    self.alternative_chains.remove(bad_id);
                }
                return Err(ConsensusError::ReorganizationFailed(hash_str(alt_id)));
            }
        }

        // The displaced blocks become alternatives; failure to re-file one
        // costs nothing but the chance to reorganize back cheaply.
        for old_block in disconnected {
            let old_id = block_hash(&old_block);
            if let Err(e) = self.handle_alternative_block(pool, old_block, old_id) {
                warn!(
                    "displaced block {} not kept as alternative: {}",
                    hash_str(&old_id),
                    e
                );
            }
        }
        for promoted in chain_ids {
            self.alternative_chains.remove(promoted);
        }

        info!(
            "reorganized to a new chain of height {}, top {}",
            self.ledger.height(),
            hash_str(&self.ledger.top_hash())
        );
        Ok(())
    }

    /// Restore the original chain after a failed switch. The blocks being
    /// re-applied were part of the main chain moments ago; if one of them no
    /// longer validates, the in-memory state is beyond saving.
    fn rollback_blockchain_switching<P: TxMemoryPool>(
        &mut self,
        pool: &mut P,
        original_chain: Vec<Block>,
        rollback_height: u64,
    ) {
        while self.ledger.height() > rollback_height {
            self.pop_block_from_blockchain(pool);
        }
        for block in original_chain {
            let id = block_hash(&block);
            if let Err(e) = self.handle_block_to_main_chain(pool, block, id) {
                error!(
                    "failed to restore block {} while rolling back a chain switch: {}",
                    hash_str(&id),
                    e
                );
                panic!("rollback of a failed chain switch did not succeed");
            }
        }
    }

    /// Key of an output slot fit to serve as a decoy. On top of being
    /// unlocked, the output's containing block must be old enough that the
    /// output could plausibly have been spent already; fresher outputs would
    /// make the real spend stand out.
    fn decoy_output_key(
        &self,
        amount: u64,
        global_index: u64,
        next_block_height: u64,
        now: u64,
    ) -> Option<PublicKey> {
        let (tx_id, _) = self.ledger.output_entry(amount, global_index)?;
        let entry = self.ledger.tx_by_hash(&tx_id)?;
        if entry.keeper_block_height + COINBASE_UNLOCK_WINDOW > next_block_height {
            return None;
        }
        self.output_key(amount, global_index, next_block_height, now)
    }

    /// One-time key of an output slot, if the slot exists and is unlocked.
    fn output_key(
        &self,
        amount: u64,
        global_index: u64,
        next_block_height: u64,
        now: u64,
    ) -> Option<PublicKey> {
        let (tx_id, local_index) = self.ledger.output_entry(amount, global_index)?;
        let entry = self.ledger.tx_by_hash(&tx_id)?;
        if !is_tx_spendtime_unlocked(entry.tx.unlock_time, next_block_height, now) {
            return None;
        }
        let output = entry.tx.outputs.get(local_index)?;
        let TxOutTarget::ToKey { key } = output.target;
        Some(key)
    }

    /// Full input validation for a non-coinbase transaction: key images
    /// unspent, ring members real and unlocked, signatures valid (skipped
    /// inside the checkpoint zone), amounts balanced.
    ///
    /// Returns the height of the newest block holding a referenced output,
    /// which relay and wallet code use to judge how settled the spend is.
    fn check_tx_inputs(
        &self,
        tx: &Transaction,
        tx_id: &Hash,
        in_checkpoint_zone: bool,
    ) -> Result<u64> {
        let key_input_count = tx
            .inputs
            .iter()
            .filter(|i| matches!(i, TxInput::ToKey { .. }))
            .count();
        if tx.signatures.len() != key_input_count {
            return Err(ConsensusError::InvalidTransactionInput(format!(
                "{} signature sets for {} key inputs",
                tx.signatures.len(),
                key_input_count
            )));
        }

        let prefix_hash = double_sha256(&tx_prefix_blob(tx));
        let next_height = self.ledger.height();
        let now = adjusted_time();

        let mut max_used_block_height = 0u64;
        let mut signature_sets = tx.signatures.iter();
        for input in &tx.inputs {
            let (amount, key_offsets, key_image) = match input {
                TxInput::ToKey {
                    amount,
                    key_offsets,
                    key_image,
                } => (*amount, key_offsets, key_image),
                TxInput::Gen { .. } => {
                    return Err(ConsensusError::InvalidTransactionInput(
                        "generation input outside a coinbase".into(),
                    ));
                }
            };
            if key_offsets.is_empty() {
                return Err(ConsensusError::InvalidTransactionInput(
                    "input references no outputs".into(),
                ));
            }
            if self.ledger.have_tx_keyimg_as_spent(key_image) {
                return Err(ConsensusError::KeyImageAlreadySpent);
            }

            let mut ring = Vec::with_capacity(key_offsets.len());
            for gindex in relative_output_offsets_to_absolute(key_offsets) {
                let (owner_tx_id, _) =
                    self.ledger
                        .output_entry(amount, gindex)
                        .ok_or(ConsensusError::OutputNotFound {
                            amount,
                            global_index: gindex,
                        })?;
                match self.output_key(amount, gindex, next_height, now) {
                    Some(key) => ring.push(key),
                    None => return Err(ConsensusError::OutputLocked),
                }
                if let Some(entry) = self.ledger.tx_by_hash(&owner_tx_id) {
                    max_used_block_height = max_used_block_height.max(entry.keeper_block_height);
                }
            }

            let signatures = match signature_sets.next() {
                Some(s) => s,
                None => {
                    return Err(ConsensusError::InvalidTransactionInput(
                        "missing signature set".into(),
                    ));
                }
            };
            if signatures.len() != ring.len() {
                return Err(ConsensusError::InvalidTransactionInput(format!(
                    "{} signatures for a ring of {}",
                    signatures.len(),
                    ring.len()
                )));
            }
            if !in_checkpoint_zone
                && !self
                    .ring_verifier
                    .check_ring_signature(&prefix_hash, key_image, &ring, signatures)
            {
                return Err(ConsensusError::RingSignatureInvalid(hash_str(tx_id)));
            }
        }

        // Inputs must cover outputs; the fee calculation enforces it.
        get_tx_fee(tx)?;
        Ok(max_used_block_height)
    }
}
