//! Versionbits soft-fork activation.
//!
//! The state of a deployment is constant within a window, so it is computed
//! for the last entry of the previous window (the boundary) and memoized by
//! that entry's hash. Terminal states are also queued for persistence.

use crate::consensus::{VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK};
use crate::error::Result;
use crate::hash::{Sha256Hash, ZERO_HASH};
use crate::index::{Entry, EntryIndex};
use crate::params::Deployment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThresholdState::Active | ThresholdState::Failed)
    }
}

/// Persisted state of one deployment at one window boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    pub boundary: Sha256Hash,
    pub state: ThresholdState,
}

/// Whether a header version signals readiness for `deployment`.
pub fn signals(version: i32, deployment: &Deployment) -> bool {
    let version = version as u32;
    version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & deployment.mask() != 0
}

#[derive(Debug, Default)]
pub struct DeploymentCache {
    memo: HashMap<String, HashMap<Sha256Hash, ThresholdState>>,
    pending: Vec<DeploymentRecord>,
}

impl DeploymentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the memo with records loaded from storage.
    pub fn load(records: impl IntoIterator<Item = DeploymentRecord>) -> Self {
        let mut cache = Self::new();
        for record in records {
            cache
                .memo
                .entry(record.name)
                .or_default()
                .insert(record.boundary, record.state);
        }
        cache
    }

    /// Terminal states computed since the last [`DeploymentCache::clear_pending`].
    pub fn pending(&self) -> &[DeploymentRecord] {
        &self.pending
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    fn remember(&mut self, name: &str, boundary: Sha256Hash, state: ThresholdState) {
        let inserted = self
            .memo
            .entry(name.to_string())
            .or_default()
            .insert(boundary, state)
            .is_none();
        if inserted && state.is_terminal() && boundary != ZERO_HASH {
            self.pending.push(DeploymentRecord {
                name: name.to_string(),
                boundary,
                state,
            });
        }
    }

    fn cached(&self, name: &str, boundary: &Sha256Hash) -> Option<ThresholdState> {
        self.memo.get(name).and_then(|m| m.get(boundary)).copied()
    }

    /// State that applies to the child of `prev` (`None` for genesis).
    pub fn state(
        &mut self,
        index: &EntryIndex,
        prev: Option<&Entry>,
        deployment: &Deployment,
    ) -> Result<ThresholdState> {
        if deployment.start_time == Deployment::ALWAYS_ACTIVE {
            return Ok(ThresholdState::Active);
        }
        let window = deployment.window.max(1);

        // Move back to the last entry of the previous window.
        let mut cursor = match prev {
            Some(prev) => {
                let offset = (prev.height + 1) % window;
                if offset > prev.height {
                    None
                } else {
                    index.get_ancestor(prev, prev.height - offset)
                }
            }
            None => None,
        };

        let mut to_compute: Vec<&Entry> = Vec::new();
        let mut state = loop {
            let key = cursor.map(|e| e.hash).unwrap_or(ZERO_HASH);
            if let Some(state) = self.cached(&deployment.name, &key) {
                break state;
            }
            let Some(entry) = cursor else {
                self.remember(&deployment.name, ZERO_HASH, ThresholdState::Defined);
                break ThresholdState::Defined;
            };
            if index.median_time_past(entry) < deployment.start_time {
                self.remember(&deployment.name, entry.hash, ThresholdState::Defined);
                break ThresholdState::Defined;
            }
            to_compute.push(entry);
            cursor = entry
                .height
                .checked_sub(window)
                .and_then(|height| index.get_ancestor(entry, height));
        };

        while let Some(boundary) = to_compute.pop() {
            let mtp = index.median_time_past(boundary);
            let next = match state {
                ThresholdState::Defined if mtp >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Defined if mtp >= deployment.start_time => ThresholdState::Started,
                ThresholdState::Started if mtp >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Started => {
                    if count_signals(index, boundary, deployment) >= deployment.threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                other => other,
            };
            if next != state {
                debug!(
                    deployment = %deployment.name,
                    height = boundary.height + 1,
                    from = ?state,
                    to = ?next,
                    "deployment state transition"
                );
            }
            state = next;
            self.remember(&deployment.name, boundary.hash, state);
        }

        Ok(state)
    }

    pub fn is_active(
        &mut self,
        index: &EntryIndex,
        prev: Option<&Entry>,
        deployment: &Deployment,
    ) -> Result<bool> {
        Ok(self.state(index, prev, deployment)? == ThresholdState::Active)
    }
}

/// Signaling entries in the window ending at `last`.
pub fn count_signals(index: &EntryIndex, last: &Entry, deployment: &Deployment) -> u32 {
    let mut count = 0;
    let mut walk = Some(last);
    for _ in 0..deployment.window {
        let Some(entry) = walk else { break };
        if signals(entry.version, deployment) {
            count += 1;
        }
        walk = if entry.is_genesis() {
            None
        } else {
            index.get(&entry.prev_hash)
        };
    }
    count
}
