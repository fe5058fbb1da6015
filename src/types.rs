//! Core ledger types: blocks, transactions, and consensus metadata.

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// One-time output public key
pub type PublicKey = [u8; 32];

/// Key image: per-spend unique value used for double-spend detection
pub type KeyImage = [u8; 32];

/// Ring signature element, one per ring member
pub type Signature = [u8; 64];

/// Per-block difficulty and cumulative chain work
pub type Difficulty = u128;

/// Hash of all zero bytes, used where "no block" must be expressed as a hash
/// (the genesis block's `prev_id`, the tail of an empty chain).
pub const NULL_HASH: Hash = [0u8; 32];

/// Transaction input, a closed tagged union.
///
/// `Gen` is the coinbase height marker: it creates money and may only appear
/// as the single input of a miner transaction. `ToKey` spends a prior output
/// by key image, referencing ring members through relative offsets into the
/// per-amount global output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    Gen {
        height: u64,
    },
    ToKey {
        amount: u64,
        key_offsets: Vec<u64>,
        key_image: KeyImage,
    },
}

/// Transaction output target.
///
/// Only one-time keys are spendable; the enum stays closed so every
/// consumption site pattern-matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutTarget {
    ToKey { key: PublicKey },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    pub target: TxOutTarget,
}

/// Transaction: inputs, outputs, and one ring signature vector per input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u64,
    pub unlock_time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub extra: Vec<u8>,
    /// One signature set per key input. Serde stops at 32-element arrays, so
    /// the 64-byte signatures travel as hex strings.
    #[serde(with = "signature_hex")]
    pub signatures: Vec<Vec<Signature>>,
}

mod signature_hex {
    use super::Signature;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        sets: &[Vec<Signature>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: Vec<Vec<String>> = sets
            .iter()
            .map(|set| set.iter().map(hex::encode).collect())
            .collect();
        serde::Serialize::serialize(&encoded, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<Signature>>, D::Error> {
        let encoded: Vec<Vec<String>> = Vec::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|set| {
                set.into_iter()
                    .map(|sig| {
                        let bytes = hex::decode(&sig).map_err(D::Error::custom)?;
                        Signature::try_from(bytes.as_slice())
                            .map_err(|_| D::Error::custom("signature must be 64 bytes"))
                    })
                    .collect()
            })
            .collect()
    }
}

/// Block header: version pair, timestamp, previous block hash, nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub prev_id: Hash,
    pub nonce: u32,
}

/// Block: header, the miner (coinbase) transaction, and the ordered hashes of
/// its member transactions. Member transaction bodies travel separately
/// (through the memory pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<Hash>,
}

/// Block plus derived consensus metadata, created only when the block is
/// accepted into the main chain or the alternative set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedBlock {
    pub block: Block,
    pub height: u64,
    /// Serialized size of the block's transactions, coinbase included.
    pub block_cumulative_size: u64,
    /// Running sum of per-block difficulty from genesis; the fork-choice weight.
    pub cumulative_difficulty: Difficulty,
    /// Running emission total after this block's base reward.
    pub already_generated_coins: u64,
}

/// A transaction as recorded on the main chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionChainEntry {
    pub tx: Transaction,
    /// Height of the block that included this transaction.
    pub keeper_block_height: u64,
    /// Position assigned to each output inside the per-amount global table.
    pub global_output_indexes: Vec<u64>,
}

/// Discriminated outcome of `add_block`. Validation failures are reported
/// separately as errors; these are the non-error terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAddResult {
    /// The block extended the main chain (directly or via reorganization).
    AddedToMainChain,
    /// The block was stored on a side chain that is not (yet) heavier.
    AddedAsAlternative,
    /// The block is already known (main, alternative, or invalid set).
    AlreadyExists,
    /// The block's parent is unknown; nothing was stored.
    Orphaned,
}

/// Answer to a peer chain-sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSupplement {
    pub start_height: u64,
    pub total_height: u64,
    pub block_ids: Vec<Hash>,
}

/// One eligible decoy output: global index within its amount table plus the
/// one-time key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomOutputEntry {
    pub global_index: u64,
    pub key: PublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_signatures_survive_a_json_round_trip() {
        let tx = Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![TxInput::ToKey {
                amount: 50,
                key_offsets: vec![0, 2],
                key_image: [7u8; 32],
            }],
            outputs: vec![TxOutput {
                amount: 50,
                target: TxOutTarget::ToKey { key: [9u8; 32] },
            }],
            extra: vec![1, 2, 3],
            signatures: vec![vec![[0xabu8; 64], [0x01u8; 64]]],
        };

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn truncated_signatures_are_refused() {
        let mut value = serde_json::to_value(Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![],
            outputs: vec![],
            extra: vec![],
            signatures: vec![vec![[0u8; 64]]],
        })
        .unwrap();
        value["signatures"][0][0] = serde_json::Value::String("abcd".into());
        assert!(serde_json::from_value::<Transaction>(value).is_err());
    }
}
