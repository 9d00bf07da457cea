use crate::encoding::{write_compact_size, Encodable};
use crate::hash::{hash_pair, sha256d, to_hex, Sha256Hash, ZERO_HASH};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// The 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Sha256Hash,
    pub merkle_root: Sha256Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn hash(&self) -> Sha256Hash {
        sha256d(&self.encode())
    }
}

impl Encodable for BlockHeader {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn hash_str(&self) -> String {
        to_hex(&self.hash())
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.encoded_size()
    }

    /// Merkle root over the transaction ids, and whether the tree is mutated
    /// (a level contains an identical adjacent pair, which lets two different
    /// transaction lists share a root).
    pub fn compute_merkle_root(&self) -> (Sha256Hash, bool) {
        let leaves: Vec<Sha256Hash> = self.transactions.iter().map(Transaction::txid).collect();
        merkle_root(leaves)
    }
}

impl Encodable for Block {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.header.encode_to(out);
        write_compact_size(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_to(out);
        }
    }
}

pub fn merkle_root(mut hashes: Vec<Sha256Hash>) -> (Sha256Hash, bool) {
    if hashes.is_empty() {
        return (ZERO_HASH, false);
    }
    let mut mutated = false;
    while hashes.len() > 1 {
        for pair in hashes.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if hashes.len() % 2 == 1 {
            if let Some(last) = hashes.last().copied() {
                hashes.push(last);
            }
        }
        hashes = hashes
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    (hashes[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ChainParams;

    #[test]
    fn genesis_header_hashes() {
        let main = ChainParams::mainnet().unwrap().genesis_block();
        assert_eq!(
            main.hash_str(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        let (root, mutated) = main.compute_merkle_root();
        assert_eq!(root, main.header.merkle_root);
        assert!(!mutated);
        assert_eq!(main.size(), 285);
    }

    #[test]
    fn duplicated_pair_marks_mutation() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (root_odd, mutated) = merkle_root(vec![a, b, c]);
        assert!(!mutated);
        let (root_dup, mutated) = merkle_root(vec![a, b, c, c]);
        assert!(mutated);
        assert_eq!(root_odd, root_dup);
    }
}
