//! Hashing primitives shared by blocks, transactions and the index.
//!
//! Hashes are stored in internal (little-endian) byte order and displayed
//! byte-reversed, matching the convention block explorers use.

use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

pub const ZERO_HASH: Sha256Hash = [0u8; 32];

pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// Double SHA-256, the identifier hash for headers and transactions.
pub fn sha256d(data: &[u8]) -> Sha256Hash {
    sha256(&sha256(data))
}

/// Hash of two concatenated child hashes, as used by the merkle tree.
pub fn hash_pair(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let first: Sha256Hash = hasher.finalize().into();
    sha256(&first)
}

pub fn to_hex(hash: &Sha256Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

pub fn from_hex(s: &str) -> Result<Sha256Hash> {
    let bytes = hex::decode(s)?;
    let mut hash: Sha256Hash = bytes.as_slice().try_into().map_err(|_| {
        ChainError::Serialization(format!("expected 32-byte hash, got {} bytes", bytes.len()))
    })?;
    hash.reverse();
    Ok(hash)
}
