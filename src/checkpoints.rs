//! Trusted height-to-hash checkpoints.
//!
//! Checkpoints pin the identity of specific main-chain heights. Inside the
//! checkpointed zone proof-of-work is not re-verified and reorganizations
//! below the highest applicable checkpoint are refused. Entries come from a
//! compiled-in table, an operator-supplied JSON file, and majority-agreed
//! DNS records.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::error::{hash_str, ConsensusError, Result};
use crate::types::Hash;

/// Which compiled-in checkpoint table to start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Debug, Default, Clone)]
pub struct Checkpoints {
    points: BTreeMap<u64, Hash>,
}

#[derive(Deserialize)]
struct CheckpointsFile {
    hashlines: Vec<CheckpointLine>,
}

#[derive(Deserialize)]
struct CheckpointLine {
    height: u64,
    hash: String,
}

fn parse_hash(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s)
        .map_err(|e| ConsensusError::CheckpointParse(format!("bad hash hex {:?}: {}", s, e)))?;
    let mut hash = [0u8; 32];
    if bytes.len() != hash.len() {
        return Err(ConsensusError::CheckpointParse(format!(
            "hash {:?} is {} bytes, expected 32",
            s,
            bytes.len()
        )));
    }
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Parse one `height:hash` record as delivered over DNS.
pub fn parse_checkpoint_record(record: &str) -> Result<(u64, Hash)> {
    let (height_str, hash_str) = record
        .split_once(':')
        .ok_or_else(|| ConsensusError::CheckpointParse(format!("no separator in {:?}", record)))?;
    let height = height_str
        .parse::<u64>()
        .map_err(|e| ConsensusError::CheckpointParse(format!("bad height in {:?}: {}", record, e)))?;
    Ok((height, parse_hash(hash_str)?))
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// The compiled-in table for a network.
    pub fn for_network(network: Network) -> Self {
        let mut cp = Self::new();
        let table: &[(u64, &str)] = match network {
            Network::Mainnet => &[
                (
                    79_693,
                    "5a2c9f17cf284cd7a7b17c8a593b1e4dd687083e39f1b3e543fd6c0cf38d0347",
                ),
                (
                    140_933,
                    "993059fb6ab92db7d80d406c67a52d9c02d873ca34b6290a12b744c970208772",
                ),
                (
                    202_612,
                    "bbd604d2ba11ba27935e006ed39c9bfdd99b76bf4a50654bc1e1e61217962698",
                ),
            ],
            Network::Testnet => &[],
        };
        for (height, hash) in table {
            // Compiled-in entries are constants; a conflict here is a build
            // mistake, not a runtime condition.
            if let Err(e) = cp.add_checkpoint_hex(*height, hash) {
                panic!("invalid compiled-in checkpoint at height {}: {}", height, e);
            }
        }
        cp
    }

    /// Register a checkpoint. Re-adding the same pair is a no-op; a different
    /// hash for an existing height is a conflict.
    pub fn add_checkpoint(&mut self, height: u64, hash: Hash) -> Result<()> {
        if let Some(existing) = self.points.get(&height) {
            if *existing != hash {
                return Err(ConsensusError::CheckpointConflict { height });
            }
            return Ok(());
        }
        self.points.insert(height, hash);
        Ok(())
    }

    pub fn add_checkpoint_hex(&mut self, height: u64, hash: &str) -> Result<()> {
        self.add_checkpoint(height, parse_hash(hash)?)
    }

    /// True when `height` is at or below the highest known checkpoint.
    pub fn is_in_checkpoint_zone(&self, height: u64) -> bool {
        match self.points.keys().next_back() {
            Some(&top) => height <= top,
            None => false,
        }
    }

    /// Check a block hash against the checkpoint table.
    ///
    /// Returns `(is_ok, is_a_checkpoint)`: heights without a checkpoint are
    /// trivially ok.
    pub fn check_block(&self, height: u64, hash: &Hash) -> (bool, bool) {
        match self.points.get(&height) {
            Some(expected) => (expected == hash, true),
            None => (true, false),
        }
    }

    /// May an alternative block at `block_height` exist while the main chain
    /// has `blockchain_height` blocks?
    ///
    /// The genesis block can never be replaced; otherwise the block must sit
    /// strictly above the highest checkpoint the current chain has reached.
    pub fn is_alternative_block_allowed(&self, blockchain_height: u64, block_height: u64) -> bool {
        if block_height == 0 {
            return false;
        }
        match self.points.range(..=blockchain_height).next_back() {
            Some((&checkpoint_height, _)) => checkpoint_height < block_height,
            None => true,
        }
    }

    pub fn top_checkpoint_height(&self) -> Option<u64> {
        self.points.keys().next_back().copied()
    }

    /// The pinned hash for a height, if one exists.
    pub fn hash_at(&self, height: u64) -> Option<Hash> {
        self.points.get(&height).copied()
    }

    /// Load additional checkpoints from a JSON file of
    /// `{"hashlines": [{"height": .., "hash": ".."}]}` lines.
    ///
    /// Entries at or below the current top checkpoint are ignored, so a stale
    /// file cannot contradict the compiled-in table.
    pub fn load_from_json(&mut self, path: &Path) -> Result<usize> {
        let data = fs::read_to_string(path)?;
        let file: CheckpointsFile = serde_json::from_str(&data)?;
        let floor = self.top_checkpoint_height().unwrap_or(0);
        let mut added = 0;
        for line in file.hashlines {
            if line.height <= floor {
                continue;
            }
            self.add_checkpoint_hex(line.height, &line.hash)?;
            added += 1;
        }
        info!("loaded {} checkpoints from {}", added, path.display());
        Ok(added)
    }

    /// Merge checkpoint records fetched from several independent DNS sources.
    ///
    /// A source containing any malformed record is discarded whole. A record
    /// is adopted only when a strict majority of the remaining sources carry
    /// it. A record conflicting with an existing checkpoint fails the merge.
    pub fn load_from_dns_records(&mut self, sources: &[Vec<String>]) -> Result<usize> {
        let mut parsed: Vec<Vec<(u64, Hash)>> = Vec::new();
        for (i, source) in sources.iter().enumerate() {
            let records: Result<Vec<_>> = source
                .iter()
                .map(|r| parse_checkpoint_record(r))
                .collect();
            match records {
                Ok(records) => parsed.push(records),
                Err(e) => warn!("discarding checkpoint source {}: {}", i, e),
            }
        }
        if parsed.is_empty() {
            return Ok(0);
        }

        let mut votes: BTreeMap<(u64, Hash), usize> = BTreeMap::new();
        for records in &parsed {
            for record in records {
                *votes.entry(*record).or_insert(0) += 1;
            }
        }

        let quorum = parsed.len() / 2 + 1;
        let mut added = 0;
        for ((height, hash), count) in votes {
            if count < quorum {
                warn!(
                    "checkpoint {}:{} seen in {} of {} sources, below quorum",
                    height,
                    hash_str(&hash),
                    count,
                    parsed.len()
                );
                continue;
            }
            self.add_checkpoint(height, hash)?;
            added += 1;
        }
        Ok(added)
    }
}
