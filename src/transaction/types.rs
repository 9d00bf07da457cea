/// Transaction types and their consensus encoding
use crate::encoding::{write_compact_size, write_var_bytes, Encodable};
use crate::hash::{sha256d, to_hex, Sha256Hash, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a transaction output: the creating transaction id and the
/// output position within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Sha256Hash,
    pub index: u32,
}

impl OutPoint {
    /// The previous output referenced by a coinbase input.
    pub const NULL: OutPoint = OutPoint {
        txid: ZERO_HASH,
        index: u32::MAX,
    };

    pub fn new(txid: Sha256Hash, index: u32) -> Self {
        OutPoint { txid, index }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Storage key: txid followed by the little-endian index.
    pub fn key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", to_hex(&self.txid), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Sha256Hash {
        sha256d(&self.encode())
    }

    pub fn txid_str(&self) -> String {
        to_hex(&self.txid())
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.encoded_size()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of output values, `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, out| acc.checked_add(out.value))
    }
}

impl Encodable for OutPoint {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.txid);
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Encodable for TxIn {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.prevout.encode_to(out);
        write_var_bytes(out, &self.script_sig);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Encodable for TxOut {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, &self.script_pubkey);
    }
}

impl Encodable for Transaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_to(out);
        }
        write_compact_size(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_to(out);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}
