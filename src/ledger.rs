//! The main-chain index.
//!
//! `LedgerIndex` owns everything the confirmed chain asserts: the block
//! array, the hash-to-height map, the transaction map, the spent key-image
//! set, and the per-amount global output table. It enforces its own local
//! invariants (append-only output table, atomic key-image insertion) and
//! leaves cross-block consensus rules to the engine.

use std::collections::{HashMap, HashSet};

use log::{error, warn};

use crate::error::{hash_str, ConsensusError, Result};
use crate::types::{
    Difficulty, ExtendedBlock, Hash, KeyImage, Transaction, TransactionChainEntry, TxInput,
    NULL_HASH,
};

#[derive(Default)]
pub struct LedgerIndex {
    blocks: Vec<ExtendedBlock>,
    /// Block identity hashes, aligned with `blocks`.
    hashes: Vec<Hash>,
    block_index: HashMap<Hash, u64>,
    transactions: HashMap<Hash, TransactionChainEntry>,
    spent_key_images: HashSet<KeyImage>,
    /// Per-amount table of `(tx id, output index within that tx)`. Strictly
    /// append-only while the chain grows; entries leave only from the tail,
    /// and only during a block disconnect.
    outputs: HashMap<u64, Vec<(Hash, usize)>>,
}

impl LedgerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks; also the height the next block will get.
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn top_hash(&self) -> Hash {
        self.hashes.last().copied().unwrap_or(NULL_HASH)
    }

    pub fn top_block(&self) -> Option<&ExtendedBlock> {
        self.blocks.last()
    }

    pub fn have_block(&self, id: &Hash) -> bool {
        self.block_index.contains_key(id)
    }

    pub fn block_height(&self, id: &Hash) -> Option<u64> {
        self.block_index.get(id).copied()
    }

    pub fn block_by_height(&self, height: u64) -> Option<&ExtendedBlock> {
        self.blocks.get(height as usize)
    }

    pub fn block_id_by_height(&self, height: u64) -> Option<Hash> {
        self.hashes.get(height as usize).copied()
    }

    pub fn block_by_hash(&self, id: &Hash) -> Option<&ExtendedBlock> {
        let height = self.block_height(id)?;
        self.block_by_height(height)
    }

    pub fn have_tx(&self, id: &Hash) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn tx_by_hash(&self, id: &Hash) -> Option<&TransactionChainEntry> {
        self.transactions.get(id)
    }

    pub fn total_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn have_tx_keyimg_as_spent(&self, image: &KeyImage) -> bool {
        self.spent_key_images.contains(image)
    }

    /// Append an accepted block. The caller has already recorded its member
    /// transactions.
    pub fn push_block(&mut self, id: Hash, block: ExtendedBlock) {
        self.block_index.insert(id, self.height());
        self.hashes.push(id);
        self.blocks.push(block);
    }

    /// Remove the top block from the block array and hash index. Its member
    /// transactions must already have been removed. The genesis block is
    /// never removed; popping a one-block chain returns `None`.
    pub fn pop_block(&mut self) -> Option<(Hash, ExtendedBlock)> {
        if self.blocks.len() <= 1 {
            return None;
        }
        let block = self.blocks.pop()?;
        let id = match self.hashes.pop() {
            Some(id) => id,
            None => {
                error!("block array and hash index disagree on chain length");
                panic!("ledger index corrupted");
            }
        };
        self.block_index.remove(&id);
        Some((id, block))
    }

    /// Record a confirmed transaction: mark its key images spent, assign its
    /// outputs global indexes, and store the chain entry.
    ///
    /// Key-image insertion is atomic: if any image is already spent, the ones
    /// inserted so far are rolled back and nothing else changes.
    pub fn add_transaction(
        &mut self,
        tx_id: Hash,
        tx: &Transaction,
        keeper_block_height: u64,
    ) -> Result<()> {
        if self.transactions.contains_key(&tx_id) {
            return Err(ConsensusError::InvalidTransactionInput(format!(
                "transaction {} is already on the chain",
                hash_str(&tx_id)
            )));
        }

        let mut inserted: Vec<KeyImage> = Vec::new();
        for input in &tx.inputs {
            if let TxInput::ToKey { key_image, .. } = input {
                if !self.spent_key_images.insert(*key_image) {
                    for image in inserted {
                        self.spent_key_images.remove(&image);
                    }
                    return Err(ConsensusError::KeyImageAlreadySpent);
                }
                inserted.push(*key_image);
            }
        }

        let mut global_output_indexes = Vec::with_capacity(tx.outputs.len());
        for (local_index, output) in tx.outputs.iter().enumerate() {
            let table = self.outputs.entry(output.amount).or_default();
            table.push((tx_id, local_index));
            global_output_indexes.push(table.len() as u64 - 1);
        }

        self.transactions.insert(
            tx_id,
            TransactionChainEntry {
                tx: tx.clone(),
                keeper_block_height,
                global_output_indexes,
            },
        );
        Ok(())
    }

    /// Remove a confirmed transaction during a block disconnect, returning
    /// its body for re-pooling.
    ///
    /// The transaction must exist and its outputs must be the current tails
    /// of their amount tables; a mismatch there means the index no longer
    /// reflects a chain this code built, and the process aborts. A key image
    /// not marked spent is fatal only under `strict`: the unwind paths pass
    /// `false`, since an entry past the most recently applied one may share
    /// an already-unwound image.
    pub fn remove_transaction(&mut self, tx_id: &Hash, strict: bool) -> Transaction {
        let entry = match self.transactions.remove(tx_id) {
            Some(entry) => entry,
            None => {
                error!("purging unknown transaction {}", hash_str(tx_id));
                panic!("ledger index corrupted");
            }
        };

        for (local_index, output) in entry.tx.outputs.iter().enumerate().rev() {
            let popped = self
                .outputs
                .get_mut(&output.amount)
                .and_then(|table| table.pop());
            if popped != Some((*tx_id, local_index)) {
                error!(
                    "output table tail for amount {} does not match transaction {} output {}",
                    output.amount,
                    hash_str(tx_id),
                    local_index
                );
                panic!("ledger index corrupted");
            }
        }

        for input in &entry.tx.inputs {
            if let TxInput::ToKey { key_image, .. } = input {
                if !self.spent_key_images.remove(key_image) {
                    if strict {
                        error!(
                            "key image of transaction {} was not marked spent",
                            hash_str(tx_id)
                        );
                        panic!("ledger index corrupted");
                    }
                    warn!(
                        "key image of transaction {} was already unmarked",
                        hash_str(tx_id)
                    );
                }
            }
        }

        entry.tx
    }

    /// The recorded `(tx id, local output index)` for one slot of an amount
    /// table.
    pub fn output_entry(&self, amount: u64, global_index: u64) -> Option<(Hash, usize)> {
        self.outputs
            .get(&amount)?
            .get(global_index as usize)
            .copied()
    }

    pub fn outputs_count(&self, amount: u64) -> u64 {
        self.outputs.get(&amount).map_or(0, |t| t.len() as u64)
    }

    /// Global output indexes assigned to a confirmed transaction.
    pub fn tx_output_global_indexes(&self, tx_id: &Hash) -> Option<&[u64]> {
        self.transactions
            .get(tx_id)
            .map(|e| e.global_output_indexes.as_slice())
    }

    /// Height of the last block shared with the peer's history.
    ///
    /// `qblock_ids` runs from the peer's tip back to its genesis, and the
    /// genesis entry must match ours.
    pub fn find_split_point(&self, qblock_ids: &[Hash]) -> Result<u64> {
        let genesis = qblock_ids
            .last()
            .ok_or_else(|| ConsensusError::HistoryMismatch("empty block id list".into()))?;
        if self.block_height(genesis) != Some(0) {
            return Err(ConsensusError::HistoryMismatch(
                "history does not end at our genesis block".into(),
            ));
        }
        for id in qblock_ids {
            if let Some(height) = self.block_height(id) {
                return Ok(height);
            }
        }
        // Unreachable: the genesis entry matched above.
        Err(ConsensusError::HistoryMismatch(
            "no common block found".into(),
        ))
    }

    /// Timestamps of the last `count` blocks, oldest first.
    pub fn last_timestamps(&self, count: usize) -> Vec<u64> {
        let start = self.blocks.len().saturating_sub(count);
        self.blocks[start..]
            .iter()
            .map(|b| b.block.header.timestamp)
            .collect()
    }

    /// Timestamps and cumulative difficulties of the last `count` blocks,
    /// oldest first, for difficulty retargeting. The genesis block is never
    /// a sample; its fabricated timestamp would poison the window.
    pub fn timestamps_and_difficulties(&self, count: usize) -> (Vec<u64>, Vec<Difficulty>) {
        let start = self.blocks.len().saturating_sub(count).max(1);
        let window = self.blocks.get(start..).unwrap_or_default();
        let mut timestamps = Vec::with_capacity(window.len());
        let mut difficulties = Vec::with_capacity(window.len());
        for block in window {
            timestamps.push(block.block.header.timestamp);
            difficulties.push(block.cumulative_difficulty);
        }
        (timestamps, difficulties)
    }

    /// Cumulative sizes of the last `count` blocks, oldest first.
    pub fn backward_block_sizes(&self, count: usize) -> Vec<u64> {
        let start = self.blocks.len().saturating_sub(count);
        self.blocks[start..]
            .iter()
            .map(|b| b.block_cumulative_size)
            .collect()
    }

    /// Difficulty of the block at `height` alone.
    pub fn block_difficulty(&self, height: u64) -> Option<Difficulty> {
        let block = self.block_by_height(height)?;
        let previous = if height == 0 {
            0
        } else {
            self.block_by_height(height - 1)?.cumulative_difficulty
        };
        Some(block.cumulative_difficulty - previous)
    }

    pub fn already_generated_coins(&self) -> u64 {
        self.top_block().map_or(0, |b| b.already_generated_coins)
    }

    pub fn cumulative_difficulty(&self) -> Difficulty {
        self.top_block().map_or(0, |b| b.cumulative_difficulty)
    }

    /// Wipe everything. Used when re-seeding the chain with a new genesis.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.hashes.clear();
        self.block_index.clear();
        self.transactions.clear();
        self.spent_key_images.clear();
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, BlockHeader, Transaction, TxOutTarget, TxOutput};

    fn extended(height: u64, timestamp: u64, cumulative_difficulty: Difficulty) -> ExtendedBlock {
        ExtendedBlock {
            block: Block {
                header: BlockHeader {
                    major_version: 1,
                    minor_version: 0,
                    timestamp,
                    prev_id: NULL_HASH,
                    nonce: 0,
                },
                miner_tx: crate::transaction::generate_genesis_block().miner_tx,
                tx_hashes: vec![],
            },
            height,
            block_cumulative_size: 100 + height,
            cumulative_difficulty,
            already_generated_coins: 0,
        }
    }

    fn spend_tx(image: KeyImage, amounts_out: &[u64]) -> Transaction {
        Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![TxInput::ToKey {
                amount: amounts_out.iter().sum(),
                key_offsets: vec![0],
                key_image: image,
            }],
            outputs: amounts_out
                .iter()
                .map(|&amount| TxOutput {
                    amount,
                    target: TxOutTarget::ToKey { key: [3u8; 32] },
                })
                .collect(),
            extra: vec![],
            signatures: vec![],
        }
    }

    #[test]
    fn push_and_pop_keep_the_hash_index_consistent() {
        let mut ledger = LedgerIndex::new();
        ledger.push_block([1u8; 32], extended(0, 10, 1));
        ledger.push_block([2u8; 32], extended(1, 20, 2));

        assert_eq!(ledger.height(), 2);
        assert_eq!(ledger.top_hash(), [2u8; 32]);
        assert_eq!(ledger.block_height(&[1u8; 32]), Some(0));

        let (id, block) = ledger.pop_block().unwrap();
        assert_eq!(id, [2u8; 32]);
        assert_eq!(block.height, 1);
        assert!(!ledger.have_block(&[2u8; 32]));
        assert_eq!(ledger.top_hash(), [1u8; 32]);

        // The genesis block stays put.
        assert!(ledger.pop_block().is_none());
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn add_transaction_assigns_sequential_global_indexes() {
        let mut ledger = LedgerIndex::new();
        let tx_a = spend_tx([1u8; 32], &[50, 50]);
        let tx_b = spend_tx([2u8; 32], &[50]);
        ledger.add_transaction([10u8; 32], &tx_a, 0).unwrap();
        ledger.add_transaction([11u8; 32], &tx_b, 0).unwrap();

        assert_eq!(
            ledger.tx_output_global_indexes(&[10u8; 32]),
            Some(&[0u64, 1][..])
        );
        assert_eq!(
            ledger.tx_output_global_indexes(&[11u8; 32]),
            Some(&[2u64][..])
        );
        assert_eq!(ledger.outputs_count(50), 3);
        assert_eq!(ledger.output_entry(50, 2), Some(([11u8; 32], 0)));
    }

    #[test]
    fn double_spend_rolls_back_partial_key_image_insertion() {
        let mut ledger = LedgerIndex::new();
        ledger
            .add_transaction([10u8; 32], &spend_tx([5u8; 32], &[50]), 0)
            .unwrap();

        // Second input collides; the first input's fresh image must not leak.
        let mut tx = spend_tx([6u8; 32], &[50]);
        tx.inputs.push(TxInput::ToKey {
            amount: 50,
            key_offsets: vec![0],
            key_image: [5u8; 32],
        });
        assert!(matches!(
            ledger.add_transaction([11u8; 32], &tx, 0),
            Err(ConsensusError::KeyImageAlreadySpent)
        ));
        assert!(!ledger.have_tx_keyimg_as_spent(&[6u8; 32]));
        assert!(!ledger.have_tx(&[11u8; 32]));
        assert_eq!(ledger.outputs_count(50), 1);
    }

    #[test]
    fn remove_transaction_pops_output_tails_and_frees_images() {
        let mut ledger = LedgerIndex::new();
        let tx = spend_tx([5u8; 32], &[50, 60]);
        ledger.add_transaction([10u8; 32], &tx, 0).unwrap();

        let returned = ledger.remove_transaction(&[10u8; 32], true);
        assert_eq!(returned, tx);
        assert_eq!(ledger.outputs_count(50), 0);
        assert_eq!(ledger.outputs_count(60), 0);
        assert!(!ledger.have_tx_keyimg_as_spent(&[5u8; 32]));
        assert_eq!(ledger.total_transactions(), 0);
    }

    #[test]
    #[should_panic(expected = "ledger index corrupted")]
    fn removing_a_non_tail_transaction_aborts() {
        let mut ledger = LedgerIndex::new();
        ledger
            .add_transaction([10u8; 32], &spend_tx([1u8; 32], &[50]), 0)
            .unwrap();
        ledger
            .add_transaction([11u8; 32], &spend_tx([2u8; 32], &[50]), 0)
            .unwrap();
        // [10] is no longer the tail of the amount-50 table.
        ledger.remove_transaction(&[10u8; 32], true);
    }

    #[test]
    fn find_split_point_returns_last_shared_height() {
        let mut ledger = LedgerIndex::new();
        ledger.push_block([1u8; 32], extended(0, 10, 1));
        ledger.push_block([2u8; 32], extended(1, 20, 2));
        ledger.push_block([3u8; 32], extended(2, 30, 3));

        // Peer shares blocks 0 and 1 but has its own block 2.
        let split = ledger
            .find_split_point(&[[9u8; 32], [2u8; 32], [1u8; 32]])
            .unwrap();
        assert_eq!(split, 1);

        // Identical chains share the tip itself.
        let split = ledger
            .find_split_point(&[[3u8; 32], [2u8; 32], [1u8; 32]])
            .unwrap();
        assert_eq!(split, 2);
    }

    #[test]
    fn find_split_point_rejects_foreign_genesis() {
        let mut ledger = LedgerIndex::new();
        ledger.push_block([1u8; 32], extended(0, 10, 1));
        assert!(ledger.find_split_point(&[[9u8; 32]]).is_err());
        assert!(ledger.find_split_point(&[]).is_err());
    }

    #[test]
    fn window_queries_return_oldest_first() {
        let mut ledger = LedgerIndex::new();
        for i in 0..5u64 {
            ledger.push_block([i as u8 + 1; 32], extended(i, 10 * (i + 1), (i + 1) as u128));
        }
        assert_eq!(ledger.last_timestamps(3), vec![30, 40, 50]);
        let (ts, diffs) = ledger.timestamps_and_difficulties(2);
        assert_eq!(ts, vec![40, 50]);
        assert_eq!(diffs, vec![4, 5]);
        // A window wider than the chain stops short of genesis.
        let (ts, diffs) = ledger.timestamps_and_difficulties(10);
        assert_eq!(ts, vec![20, 30, 40, 50]);
        assert_eq!(diffs, vec![2, 3, 4, 5]);
        assert_eq!(ledger.backward_block_sizes(2), vec![103, 104]);
        assert_eq!(ledger.block_difficulty(3), Some(1));
        assert_eq!(ledger.block_difficulty(0), Some(1));
    }
}
