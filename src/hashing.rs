//! Deterministic serialization and identity hashing.
//!
//! Every consensus object has exactly one binary rendering, and its identity
//! hash is the double-SHA256 of that rendering. The encoding is written by
//! hand so that nothing about field order or integer width is left to a
//! framework.

use sha2::{Digest, Sha256};

use crate::types::{Block, BlockHeader, Hash, Transaction, TxInput, TxOutTarget, TxOutput};

/// Double-SHA256 of arbitrary bytes.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn encode_input(out: &mut Vec<u8>, input: &TxInput) {
    match input {
        TxInput::Gen { height } => {
            out.push(0xff);
            put_u64(out, *height);
        }
        TxInput::ToKey {
            amount,
            key_offsets,
            key_image,
        } => {
            out.push(0x02);
            put_u64(out, *amount);
            put_u64(out, key_offsets.len() as u64);
            for offset in key_offsets {
                put_u64(out, *offset);
            }
            out.extend_from_slice(key_image);
        }
    }
}

fn encode_output(out: &mut Vec<u8>, output: &TxOutput) {
    put_u64(out, output.amount);
    match &output.target {
        TxOutTarget::ToKey { key } => {
            out.push(0x02);
            out.extend_from_slice(key);
        }
    }
}

/// Binary rendering of the transaction prefix: everything except signatures.
pub fn tx_prefix_blob(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    put_u64(&mut out, tx.version);
    put_u64(&mut out, tx.unlock_time);
    put_u64(&mut out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        encode_input(&mut out, input);
    }
    put_u64(&mut out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        encode_output(&mut out, output);
    }
    put_bytes(&mut out, &tx.extra);
    out
}

/// Binary rendering of the full transaction, signatures included.
pub fn tx_blob(tx: &Transaction) -> Vec<u8> {
    let mut out = tx_prefix_blob(tx);
    put_u64(&mut out, tx.signatures.len() as u64);
    for ring in &tx.signatures {
        put_u64(&mut out, ring.len() as u64);
        for sig in ring {
            out.extend_from_slice(sig);
        }
    }
    out
}

/// Identity hash of a transaction.
pub fn tx_hash(tx: &Transaction) -> Hash {
    double_sha256(&tx_blob(tx))
}

/// Serialized size of a transaction in bytes.
pub fn tx_blob_size(tx: &Transaction) -> u64 {
    tx_blob(tx).len() as u64
}

fn header_blob(header: &BlockHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.push(header.major_version);
    out.push(header.minor_version);
    put_u64(&mut out, header.timestamp);
    out.extend_from_slice(&header.prev_id);
    put_u32(&mut out, header.nonce);
    out
}

/// Merkle root over the miner transaction hash followed by the member
/// transaction hashes, in block order. A lone hash is its own root; odd
/// levels duplicate their last element.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    assert!(!hashes.is_empty(), "tree hash over empty set");
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(&pair[1]);
            next.push(double_sha256(&buf));
        }
        level = next;
    }
    level[0]
}

/// The blob whose hash is both the block identity and the proof-of-work
/// input: header, transaction merkle root, and transaction count.
pub fn block_hashing_blob(block: &Block) -> Vec<u8> {
    let mut hashes = Vec::with_capacity(1 + block.tx_hashes.len());
    hashes.push(tx_hash(&block.miner_tx));
    hashes.extend_from_slice(&block.tx_hashes);
    let root = tree_hash(&hashes);

    let mut out = header_blob(&block.header);
    out.extend_from_slice(&root);
    put_u64(&mut out, 1 + block.tx_hashes.len() as u64);
    out
}

/// Identity hash of a block.
pub fn block_hash(block: &Block) -> Hash {
    double_sha256(&block_hashing_blob(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NULL_HASH;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![TxInput::Gen { height: 7 }],
            outputs: vec![TxOutput {
                amount: 50,
                target: TxOutTarget::ToKey { key: [3u8; 32] },
            }],
            extra: vec![1, 2, 3],
            signatures: vec![],
        }
    }

    #[test]
    fn tx_hash_is_stable_and_field_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx_hash(&tx), tx_hash(&tx.clone()));

        let mut other = tx.clone();
        other.unlock_time = 1;
        assert_ne!(tx_hash(&tx), tx_hash(&other));
    }

    #[test]
    fn signatures_change_tx_hash_but_not_prefix() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.signatures = vec![vec![[9u8; 64]]];
        assert_eq!(tx_prefix_blob(&tx), tx_prefix_blob(&signed));
        assert_ne!(tx_hash(&tx), tx_hash(&signed));
    }

    #[test]
    fn tree_hash_single_element_is_identity() {
        let h = double_sha256(b"leaf");
        assert_eq!(tree_hash(&[h]), h);
    }

    #[test]
    fn tree_hash_depends_on_order() {
        let a = double_sha256(b"a");
        let b = double_sha256(b"b");
        assert_ne!(tree_hash(&[a, b]), tree_hash(&[b, a]));
    }

    #[test]
    fn block_hash_commits_to_member_transactions() {
        let header = BlockHeader {
            major_version: 1,
            minor_version: 0,
            timestamp: 1000,
            prev_id: NULL_HASH,
            nonce: 0,
        };
        let block = Block {
            header,
            miner_tx: sample_tx(),
            tx_hashes: vec![],
        };
        let mut with_member = block.clone();
        with_member.tx_hashes.push([5u8; 32]);
        assert_ne!(block_hash(&block), block_hash(&with_member));
    }
}
