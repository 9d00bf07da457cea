//! Pinned (height, hash) pairs that history may not be rewritten past.

use crate::error::{Rejection, Result};
use crate::hash::{to_hex, Sha256Hash};
use crate::index::{Entry, EntryIndex};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct CheckpointGuard {
    points: BTreeMap<u32, Sha256Hash>,
    watermark: Option<(u32, Sha256Hash)>,
}

impl CheckpointGuard {
    pub fn new(points: BTreeMap<u32, Sha256Hash>) -> Self {
        CheckpointGuard {
            points,
            watermark: None,
        }
    }

    pub fn get(&self, height: u32) -> Option<&Sha256Hash> {
        self.points.get(&height)
    }

    /// Highest checkpoint at or below the active tip.
    pub fn watermark(&self) -> Option<(u32, Sha256Hash)> {
        self.watermark
    }

    pub fn update_watermark(&mut self, tip_height: u32) {
        self.watermark = self
            .points
            .range(..=tip_height)
            .next_back()
            .map(|(height, hash)| (*height, *hash));
    }

    /// Checks a new entry whose parent is `parent` against the pinned hashes
    /// and the watermark.
    pub fn verify(&self, index: &EntryIndex, entry: &Entry, parent: &Entry) -> Result<()> {
        if let Some(expected) = self.points.get(&entry.height) {
            if *expected != entry.hash {
                warn!(
                    height = entry.height,
                    hash = %entry.hash_str(),
                    expected = %to_hex(expected),
                    "checkpoint mismatch"
                );
                return Err(Rejection::checkpoint("checkpoint-mismatch").into());
            }
        }

        let Some((mark_height, mark_hash)) = self.watermark else {
            return Ok(());
        };
        if entry.height < mark_height {
            return Err(Rejection::checkpoint("bad-fork-prior-to-checkpoint").into());
        }
        if entry.height > mark_height {
            let ancestor = index.get_ancestor(parent, mark_height).map(|e| e.hash);
            if ancestor != Some(mark_hash) {
                return Err(Rejection::checkpoint("bad-fork-prior-to-checkpoint").into());
            }
        }
        Ok(())
    }

    /// Pre-flight check for a reorganization forking at `fork_point`: the
    /// fork must not disconnect the watermark block.
    pub fn verify_fork(&self, fork_point: &Entry) -> Result<()> {
        match self.watermark {
            Some((mark_height, _)) if fork_point.height < mark_height => {
                warn!(
                    fork_height = fork_point.height,
                    checkpoint = mark_height,
                    "refusing reorganization below checkpoint"
                );
                Err(Rejection::checkpoint("bad-fork-prior-to-checkpoint").into())
            }
            _ => Ok(()),
        }
    }
}
