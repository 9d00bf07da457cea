//! In-memory index of every known header.
//!
//! Entries form a tree rooted at genesis. Each node keeps a skip pointer to a
//! deterministic ancestor so [`EntryIndex::get_ancestor`] runs in logarithmic
//! time, and the index tracks the set of branch heads (tips).

use crate::blockchain::BlockHeader;
use crate::consensus::MEDIAN_TIME_SPAN;
use crate::error::{ChainError, Rejection, Result};
use crate::hash::{to_hex, Sha256Hash, ZERO_HASH};
use crate::pow::block_proof;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Immutable header record with its position and cumulative work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub hash: Sha256Hash,
    pub prev_hash: Sha256Hash,
    pub height: u32,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub merkle_root: Sha256Hash,
    #[serde(with = "work_bytes")]
    pub chainwork: U256,
}

impl Entry {
    pub fn genesis(header: &BlockHeader) -> Self {
        Entry {
            hash: header.hash(),
            prev_hash: ZERO_HASH,
            height: 0,
            version: header.version,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            merkle_root: header.merkle_root,
            chainwork: block_proof(header.bits),
        }
    }

    pub fn from_header(header: &BlockHeader, parent: &Entry) -> Self {
        Entry {
            hash: header.hash(),
            prev_hash: header.prev_hash,
            height: parent.height + 1,
            version: header.version,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            merkle_root: header.merkle_root,
            chainwork: parent.chainwork.saturating_add(block_proof(header.bits)),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn hash_str(&self) -> String {
        to_hex(&self.hash)
    }
}

/// Chainwork is stored as 32 little-endian bytes.
mod work_bytes {
    use primitive_types::U256;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(work: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = [0u8; 32];
        work.to_little_endian(&mut bytes);
        bytes.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(U256::from_little_endian(&bytes))
    }
}

fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

/// Height the skip pointer of an entry at `height` refers to.
fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Debug, Clone)]
struct IndexNode {
    entry: Entry,
    skip: Option<Sha256Hash>,
    children: Vec<Sha256Hash>,
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct EntryIndex {
    nodes: HashMap<Sha256Hash, IndexNode>,
    tips: HashSet<Sha256Hash>,
    next_sequence: u64,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<&Entry> {
        self.nodes.get(hash).map(|node| &node.entry)
    }

    /// Like [`EntryIndex::get`], but a missing hash is an error.
    pub fn entry(&self, hash: &Sha256Hash) -> Result<&Entry> {
        self.get(hash)
            .ok_or_else(|| ChainError::NotFound(format!("entry {}", to_hex(hash))))
    }

    pub fn tips(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.tips.iter().filter_map(|hash| self.get(hash))
    }

    pub fn is_tip(&self, hash: &Sha256Hash) -> bool {
        self.tips.contains(hash)
    }

    pub fn children(&self, hash: &Sha256Hash) -> &[Sha256Hash] {
        self.nodes
            .get(hash)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Adds a header. Genesis is the only entry allowed without a known
    /// parent, and only into an empty index.
    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        if self.nodes.contains_key(&entry.hash) {
            return Err(Rejection::duplicate("duplicate").into());
        }

        let skip = if entry.is_genesis() {
            if !self.nodes.is_empty() {
                return Err(ChainError::Corrupt(format!(
                    "second genesis entry {}",
                    entry.hash_str()
                )));
            }
            None
        } else {
            let parent = self.get(&entry.prev_hash).ok_or(ChainError::Orphan {
                hash: entry.hash,
                parent: entry.prev_hash,
            })?;
            if parent.height + 1 != entry.height {
                return Err(ChainError::Corrupt(format!(
                    "entry {} at height {} does not follow parent height {}",
                    entry.hash_str(),
                    entry.height,
                    parent.height
                )));
            }
            self.get_ancestor(parent, skip_height(entry.height))
                .map(|skip| skip.hash)
        };

        if let Some(parent) = self.nodes.get_mut(&entry.prev_hash) {
            parent.children.push(entry.hash);
            self.tips.remove(&entry.prev_hash);
        }

        self.tips.insert(entry.hash);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.nodes.insert(
            entry.hash,
            IndexNode {
                entry,
                skip,
                children: Vec::new(),
                sequence,
            },
        );
        Ok(())
    }

    /// Ancestor of `entry` at `height`, following skip pointers.
    pub fn get_ancestor<'a>(&'a self, entry: &'a Entry, height: u32) -> Option<&'a Entry> {
        if height > entry.height {
            return None;
        }

        let mut walk = entry;
        while walk.height > height {
            let node = self.nodes.get(&walk.hash)?;
            let height_skip = skip_height(walk.height);
            let height_skip_prev = skip_height(walk.height - 1);
            let use_skip = node.skip.is_some()
                && (height_skip == height
                    || (height_skip > height
                        && !(height_skip_prev + 2 < height_skip && height_skip_prev >= height)));

            walk = match (use_skip, node.skip) {
                (true, Some(skip)) => self.get(&skip)?,
                _ => self.get(&walk.prev_hash)?,
            };
        }
        Some(walk)
    }

    /// The last entry shared by the branches ending at `a` and `b`.
    pub fn common_ancestor(&self, a: &Sha256Hash, b: &Sha256Hash) -> Result<&Entry> {
        let mut a = self.entry(a)?;
        let mut b = self.entry(b)?;

        if a.height > b.height {
            a = self.get_ancestor(a, b.height).ok_or_else(|| broken_link(a))?;
        } else if b.height > a.height {
            b = self.get_ancestor(b, a.height).ok_or_else(|| broken_link(b))?;
        }

        while a.hash != b.hash {
            a = self.get(&a.prev_hash).ok_or_else(|| broken_link(a))?;
            b = self.get(&b.prev_hash).ok_or_else(|| broken_link(b))?;
        }
        Ok(a)
    }

    /// Median timestamp of `entry` and up to ten of its predecessors.
    pub fn median_time_past(&self, entry: &Entry) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(entry);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(i64::from(current.time));
            walk = if current.is_genesis() {
                None
            } else {
                self.get(&current.prev_hash)
            };
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// The tip with the most work; on equal work the one seen first.
    pub fn best_tip(&self) -> Option<&Entry> {
        self.tips
            .iter()
            .filter_map(|hash| self.nodes.get(hash))
            .max_by(|a, b| {
                a.entry
                    .chainwork
                    .cmp(&b.entry.chainwork)
                    .then(b.sequence.cmp(&a.sequence))
            })
            .map(|node| &node.entry)
    }

    /// Removes `hash` and every descendant, returning the removed entries.
    /// The parent becomes a tip again if it is left without children.
    pub fn remove_branch(&mut self, hash: &Sha256Hash) -> Vec<Entry> {
        let mut removed = Vec::new();
        let Some(root) = self.nodes.get(hash) else {
            return removed;
        };
        let parent_hash = root.entry.prev_hash;

        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                self.tips.remove(&current);
                stack.extend(node.children.iter().copied());
                removed.push(node.entry);
            }
        }

        if let Some(parent) = self.nodes.get_mut(&parent_hash) {
            parent.children.retain(|child| child != hash);
            if parent.children.is_empty() {
                self.tips.insert(parent_hash);
            }
        }
        removed
    }
}

fn broken_link(entry: &Entry) -> ChainError {
    ChainError::Corrupt(format!(
        "entry {} at height {} has no indexed ancestor",
        entry.hash_str(),
        entry.height
    ))
}
