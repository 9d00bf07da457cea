//! Read-only walks over a snapshot of the active chain.

use crate::blockchain::Block;
use crate::chaindb::ChainDb;
use crate::error::{ChainError, Result};
use crate::hash::{to_hex, Sha256Hash};
use crate::index::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag for a running scan.
#[derive(Debug, Clone, Default)]
pub struct ScanHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScanHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Yields `(entry, block)` pairs in ascending height. Once cancelled it
/// yields a single [`ChainError::Cancelled`] and then ends.
pub struct ChainScan {
    db: ChainDb,
    hashes: Vec<Sha256Hash>,
    pos: usize,
    handle: ScanHandle,
    done: bool,
}

impl ChainScan {
    pub(crate) fn new(db: ChainDb, hashes: Vec<Sha256Hash>, handle: ScanHandle) -> Self {
        ChainScan {
            db,
            hashes,
            pos: 0,
            handle,
            done: false,
        }
    }

    pub fn handle(&self) -> &ScanHandle {
        &self.handle
    }

    fn load(&self, hash: &Sha256Hash) -> Result<(Entry, Arc<Block>)> {
        let entry = self
            .db
            .get_entry(hash)?
            .ok_or_else(|| ChainError::NotFound(format!("entry {}", to_hex(hash))))?;
        let block = self.db.require_block(hash)?;
        Ok((entry, block))
    }
}

impl Iterator for ChainScan {
    type Item = Result<(Entry, Arc<Block>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.handle.is_cancelled() {
            self.done = true;
            return Some(Err(ChainError::Cancelled));
        }
        let hash = *self.hashes.get(self.pos)?;
        self.pos += 1;
        let item = self.load(&hash);
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}
