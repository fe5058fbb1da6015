//! Memory pool interface and a reference in-memory implementation.
//!
//! The consensus engine never owns transaction bodies for blocks in flight;
//! it pulls them from the pool when a block is connected and pushes them back
//! when a block is disconnected. The trait is the narrow waist between the
//! two components.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::constants::COINBASE_BLOB_RESERVED_SIZE;
use crate::error::{hash_str, ConsensusError, Result};
use crate::hashing::{tx_blob_size, tx_hash};
use crate::transaction::{get_tx_fee, is_coinbase};
use crate::types::{Hash, KeyImage, Transaction, TxInput};

/// What the consensus engine needs from a transaction memory pool.
pub trait TxMemoryPool {
    /// Is this transaction currently pooled?
    fn have_tx(&self, id: &Hash) -> bool;

    /// Add a transaction. `kept_by_block` marks transactions returned to the
    /// pool by a chain disconnect; those bypass the pool's own double-spend
    /// policy, since the chain itself re-validates them on reconnect.
    fn add_tx(&mut self, tx: Transaction, kept_by_block: bool) -> Result<()>;

    /// Remove and return a transaction with its blob size and fee.
    fn take_tx(&mut self, id: &Hash) -> Option<(Transaction, u64, u64)>;

    /// The chain grew to `new_height` blocks with `top_id` on top.
    fn on_blockchain_inc(&mut self, new_height: u64, top_id: Hash);

    /// The chain shrank to `new_height` blocks with `top_id` on top.
    fn on_blockchain_dec(&mut self, new_height: u64, top_id: Hash);

    /// Pick transactions for a new block, leaving room for the coinbase.
    /// Returns the chosen ids with their total blob size and total fee.
    fn fill_block_template(&self, effective_median_size: u64) -> (Vec<Hash>, u64, u64);
}

struct PoolEntry {
    tx: Transaction,
    blob_size: u64,
    fee: u64,
}

/// Straightforward in-memory pool: a transaction map plus a key-image index
/// for its own double-spend policy. Relay rules and expiry are a node
/// concern, not a consensus one, and are not modeled here.
#[derive(Default)]
pub struct InMemoryPool {
    transactions: HashMap<Hash, PoolEntry>,
    spent_key_images: HashMap<KeyImage, HashSet<Hash>>,
}

impl InMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn key_images(tx: &Transaction) -> impl Iterator<Item = &KeyImage> {
        tx.inputs.iter().filter_map(|input| match input {
            TxInput::ToKey { key_image, .. } => Some(key_image),
            TxInput::Gen { .. } => None,
        })
    }
}

impl TxMemoryPool for InMemoryPool {
    fn have_tx(&self, id: &Hash) -> bool {
        self.transactions.contains_key(id)
    }

    fn add_tx(&mut self, tx: Transaction, kept_by_block: bool) -> Result<()> {
        let id = tx_hash(&tx);
        if self.transactions.contains_key(&id) {
            return Ok(());
        }
        if is_coinbase(&tx) {
            return Err(ConsensusError::InvalidTransactionInput(
                "coinbase transactions do not enter the pool".into(),
            ));
        }
        if !kept_by_block {
            for image in Self::key_images(&tx) {
                if self.spent_key_images.contains_key(image) {
                    return Err(ConsensusError::KeyImageAlreadySpent);
                }
            }
        }
        let blob_size = tx_blob_size(&tx);
        let fee = get_tx_fee(&tx)?;
        for image in Self::key_images(&tx) {
            self.spent_key_images
                .entry(*image)
                .or_default()
                .insert(id);
        }
        debug!("pooled tx {} ({} bytes, fee {})", hash_str(&id), blob_size, fee);
        self.transactions.insert(id, PoolEntry { tx, blob_size, fee });
        Ok(())
    }

    fn take_tx(&mut self, id: &Hash) -> Option<(Transaction, u64, u64)> {
        let entry = self.transactions.remove(id)?;
        for image in Self::key_images(&entry.tx) {
            if let Some(owners) = self.spent_key_images.get_mut(image) {
                owners.remove(id);
                if owners.is_empty() {
                    self.spent_key_images.remove(image);
                }
            }
        }
        Some((entry.tx, entry.blob_size, entry.fee))
    }

    fn on_blockchain_inc(&mut self, _new_height: u64, _top_id: Hash) {}

    fn on_blockchain_dec(&mut self, _new_height: u64, _top_id: Hash) {}

    fn fill_block_template(&self, effective_median_size: u64) -> (Vec<Hash>, u64, u64) {
        let max_total_size = (2 * effective_median_size).saturating_sub(COINBASE_BLOB_RESERVED_SIZE);

        // Best fee-per-byte first; disconnected-block returns are not
        // privileged here, they compete on fee like everything else.
        let mut candidates: Vec<(&Hash, &PoolEntry)> = self.transactions.iter().collect();
        candidates.sort_by(|(a_id, a), (b_id, b)| {
            let a_rate = a.fee as u128 * b.blob_size as u128;
            let b_rate = b.fee as u128 * a.blob_size as u128;
            b_rate.cmp(&a_rate).then(a_id.cmp(b_id))
        });

        let mut ids = Vec::new();
        let mut total_size = 0u64;
        let mut total_fee = 0u64;
        for (id, entry) in candidates {
            if total_size + entry.blob_size > max_total_size {
                continue;
            }
            total_size += entry.blob_size;
            total_fee += entry.fee;
            ids.push(*id);
        }
        (ids, total_size, total_fee)
    }
}
