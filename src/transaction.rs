//! Transaction arithmetic and construction helpers.

use crate::constants::{
    COINBASE_UNLOCK_WINDOW, CURRENT_BLOCK_MAJOR_VERSION, CURRENT_BLOCK_MINOR_VERSION,
    CURRENT_TRANSACTION_VERSION,
};
use crate::economic::get_block_reward;
use crate::error::{ConsensusError, Result};
use crate::types::{
    Block, BlockHeader, PublicKey, Transaction, TxInput, TxOutTarget, TxOutput, NULL_HASH,
};

/// Nonce baked into the genesis block.
pub const GENESIS_NONCE: u32 = 70;

/// Sum of output amounts, rejecting overflow.
pub fn get_outs_money_amount(tx: &Transaction) -> Result<u64> {
    let mut total: u64 = 0;
    for out in &tx.outputs {
        total = total
            .checked_add(out.amount)
            .ok_or(ConsensusError::OutputOverflow)?;
    }
    Ok(total)
}

/// Sum of the amounts claimed by key inputs. Generation inputs carry no
/// amount of their own.
pub fn get_inputs_money_amount(tx: &Transaction) -> u64 {
    tx.inputs
        .iter()
        .map(|input| match input {
            TxInput::Gen { .. } => 0,
            TxInput::ToKey { amount, .. } => *amount,
        })
        .sum()
}

/// True for a coinbase: a single generation input.
pub fn is_coinbase(tx: &Transaction) -> bool {
    matches!(tx.inputs.as_slice(), [TxInput::Gen { .. }])
}

/// Fee of a transaction: inputs minus outputs. A coinbase pays no fee;
/// any other transaction whose outputs exceed its inputs is invalid.
pub fn get_tx_fee(tx: &Transaction) -> Result<u64> {
    if is_coinbase(tx) {
        return Ok(0);
    }
    let inputs = get_inputs_money_amount(tx);
    let outputs = get_outs_money_amount(tx)?;
    if outputs > inputs {
        return Err(ConsensusError::InputsBelowOutputs { inputs, outputs });
    }
    Ok(inputs - outputs)
}

/// Ring members are referenced through deltas; the first offset is absolute
/// and each following one is relative to its predecessor.
pub fn relative_output_offsets_to_absolute(offsets: &[u64]) -> Vec<u64> {
    let mut absolute = Vec::with_capacity(offsets.len());
    let mut running = 0u64;
    for (i, offset) in offsets.iter().enumerate() {
        running = if i == 0 { *offset } else { running + offset };
        absolute.push(running);
    }
    absolute
}

/// Inverse of [`relative_output_offsets_to_absolute`]; input must be sorted
/// ascending.
pub fn absolute_output_offsets_to_relative(offsets: &[u64]) -> Vec<u64> {
    let mut relative = Vec::with_capacity(offsets.len());
    let mut previous = 0u64;
    for (i, offset) in offsets.iter().enumerate() {
        relative.push(if i == 0 { *offset } else { offset - previous });
        previous = *offset;
    }
    relative
}

/// Build the coinbase for a block at `height` paying `miner_key`.
///
/// The claimed amount is the full base reward for the given size and median
/// plus the collected fees, in a single output.
pub fn construct_miner_tx(
    height: u64,
    median_size: u64,
    already_generated_coins: u64,
    current_block_size: u64,
    fee: u64,
    miner_key: PublicKey,
    extra: Vec<u8>,
) -> Result<Transaction> {
    let base_reward = get_block_reward(median_size, current_block_size, already_generated_coins)?;
    let reward = base_reward
        .checked_add(fee)
        .ok_or(ConsensusError::OutputOverflow)?;
    Ok(Transaction {
        version: CURRENT_TRANSACTION_VERSION,
        unlock_time: height + COINBASE_UNLOCK_WINDOW,
        inputs: vec![TxInput::Gen { height }],
        outputs: vec![TxOutput {
            amount: reward,
            target: TxOutTarget::ToKey { key: miner_key },
        }],
        extra,
        signatures: vec![],
    })
}

/// The fixed genesis block every chain instance starts from.
pub fn generate_genesis_block() -> Block {
    // The genesis coinbase pays a burn key; parameters are all zero, so the
    // reward call cannot fail.
    let miner_tx = construct_miner_tx(0, 0, 0, 0, 0, [0u8; 32], Vec::new())
        .unwrap_or_else(|_| unreachable!("genesis coinbase parameters are constant"));
    Block {
        header: BlockHeader {
            major_version: CURRENT_BLOCK_MAJOR_VERSION,
            minor_version: CURRENT_BLOCK_MINOR_VERSION,
            timestamp: 0,
            prev_id: NULL_HASH,
            nonce: GENESIS_NONCE,
        },
        miner_tx,
        tx_hashes: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_input(amount: u64) -> TxInput {
        TxInput::ToKey {
            amount,
            key_offsets: vec![0],
            key_image: [1u8; 32],
        }
    }

    fn key_output(amount: u64) -> TxOutput {
        TxOutput {
            amount,
            target: TxOutTarget::ToKey { key: [2u8; 32] },
        }
    }

    #[test]
    fn fee_is_inputs_minus_outputs() {
        let tx = Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![key_input(100), key_input(30)],
            outputs: vec![key_output(120)],
            extra: vec![],
            signatures: vec![],
        };
        assert_eq!(get_tx_fee(&tx).unwrap(), 10);
    }

    #[test]
    fn outputs_above_inputs_are_rejected() {
        let tx = Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![key_input(100)],
            outputs: vec![key_output(101)],
            extra: vec![],
            signatures: vec![],
        };
        assert!(matches!(
            get_tx_fee(&tx),
            Err(ConsensusError::InputsBelowOutputs { .. })
        ));
    }

    #[test]
    fn coinbase_pays_no_fee() {
        let genesis = generate_genesis_block();
        assert!(is_coinbase(&genesis.miner_tx));
        assert_eq!(get_tx_fee(&genesis.miner_tx).unwrap(), 0);
    }

    #[test]
    fn offset_conversion_round_trips() {
        let absolute = vec![3, 7, 20, 21];
        let relative = absolute_output_offsets_to_relative(&absolute);
        assert_eq!(relative, vec![3, 4, 13, 1]);
        assert_eq!(relative_output_offsets_to_absolute(&relative), absolute);
    }

    #[test]
    fn miner_tx_claims_reward_plus_fee() {
        let tx = construct_miner_tx(5, 0, 0, 0, 25, [9u8; 32], vec![]).unwrap();
        let base = get_block_reward(0, 0, 0).unwrap();
        assert_eq!(get_outs_money_amount(&tx).unwrap(), base + 25);
        assert_eq!(tx.unlock_time, 5 + COINBASE_UNLOCK_WINDOW);
        assert!(matches!(tx.inputs[0], TxInput::Gen { height: 5 }));
    }

    #[test]
    fn genesis_block_is_deterministic() {
        assert_eq!(generate_genesis_block(), generate_genesis_block());
        assert_eq!(generate_genesis_block().header.prev_id, NULL_HASH);
    }
}
