//! The chain controller: block acceptance, best-chain selection and
//! reorganization.

use crate::blockchain::core::block::Block;
use crate::blockchain::core::state::ChainState;
use crate::blockchain::core::validation::{check_block, check_block_context, check_header_context};
use crate::chaindb::{ChainBatch, ChainDb};
use crate::checkpoints::CheckpointGuard;
use crate::clock::{Clock, SystemClock};
use crate::coins::{Coin, CoinSource};
use crate::deployments::{signals, DeploymentCache, ThresholdState};
use crate::error::{ChainError, Rejection, Result};
use crate::events::{ChainEvent, EventSink};
use crate::hash::{to_hex, Sha256Hash};
use crate::index::{Entry, EntryIndex};
use crate::params::{ChainParams, CSV_DEPLOYMENT};
use crate::pow::{DefaultRetarget, Retarget};
use crate::scan::{ChainScan, ScanHandle};
use crate::transaction::OutPoint;
use crate::verify::{AcceptAllVerifier, ScriptPool, ScriptVerifier};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators and tuning for [`Chain::open`].
#[derive(Clone)]
pub struct ChainOptions {
    pub script_threads: usize,
    pub clock: Arc<dyn Clock>,
    pub verifier: Arc<dyn ScriptVerifier>,
    pub retarget: Arc<dyn Retarget>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        ChainOptions {
            script_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            clock: Arc::new(SystemClock::default()),
            verifier: Arc::new(AcceptAllVerifier),
            retarget: Arc::new(DefaultRetarget),
        }
    }
}

impl ChainOptions {
    pub fn with_script_threads(mut self, threads: usize) -> Self {
        self.script_threads = threads;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ScriptVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_retarget(mut self, retarget: Arc<dyn Retarget>) -> Self {
        self.retarget = retarget;
        self
    }
}

/// How an accepted block changed the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Connected on top of the active tip.
    Extended,
    /// Stored on a branch with no more work than the active chain.
    AlternateTip,
    /// Made its branch the active chain.
    Reorganized { fork_height: u32 },
}

pub struct Chain {
    pub(crate) params: Arc<ChainParams>,
    pub(crate) db: ChainDb,
    pub(crate) index: EntryIndex,
    /// Hashes of the active chain, indexed by height.
    pub(crate) active: Vec<Sha256Hash>,
    pub(crate) tip: Entry,
    pub(crate) state: ChainState,
    pub(crate) deployments: DeploymentCache,
    pub(crate) checkpoints: CheckpointGuard,
    pub(crate) scripts: ScriptPool,
    pub(crate) verifier: Arc<dyn ScriptVerifier>,
    retarget: Arc<dyn Retarget>,
    clock: Arc<dyn Clock>,
    sinks: Vec<Box<dyn EventSink>>,
}

impl Chain {
    /// Opens the chain stored in `db`, writing the genesis block first if the
    /// database is empty.
    pub fn open(params: ChainParams, db: ChainDb, options: ChainOptions) -> Result<Self> {
        let params = Arc::new(params);
        let scripts = ScriptPool::new(options.script_threads)?;
        let genesis = params.genesis_block();
        let genesis_hash = genesis.hash();

        let mut index = EntryIndex::new();
        let mut state = ChainState::default();
        let mut deployments = DeploymentCache::new();

        let best = match db.best_hash()? {
            None => {
                info!(
                    "Initializing new {} chain at genesis {}",
                    params.network,
                    to_hex(&genesis_hash)
                );
                let entry = Entry::genesis(&genesis.header);
                let mut batch = ChainBatch::new();
                batch.put_entry(&entry)?;
                batch.put_block(genesis_hash, Arc::new(genesis))?;
                batch.add_tip(&genesis_hash);
                batch.set_best(&genesis_hash);
                batch.set_state(&state)?;
                db.commit(batch)?;
                index.insert(entry)?;
                genesis_hash
            }
            Some(best) => {
                let mut entries = db.load_entries()?;
                entries.sort_by_key(|entry| entry.height);
                if entries.first().map(|entry| entry.hash) != Some(genesis_hash) {
                    return Err(ChainError::Config(format!(
                        "database does not hold a {} chain",
                        params.network
                    )));
                }
                for entry in entries {
                    index.insert(entry)?;
                }
                state = db.chain_state()?;
                deployments = DeploymentCache::load(db.deployment_records()?);
                debug!("Loaded {} entries, {} stored tips", index.len(), db.tips()?.len());
                best
            }
        };

        let tip = index.entry(&best)?.clone();
        let mut active = Vec::with_capacity(tip.height as usize + 1);
        let mut walk = tip.clone();
        loop {
            active.push(walk.hash);
            if walk.is_genesis() {
                break;
            }
            walk = index.entry(&walk.prev_hash)?.clone();
        }
        active.reverse();

        let mut checkpoints = CheckpointGuard::new(params.checkpoints.clone());
        checkpoints.update_watermark(tip.height);

        info!("Opened chain at height {} ({})", tip.height, tip.hash_str());

        Ok(Chain {
            params,
            db,
            index,
            active,
            tip,
            state,
            deployments,
            checkpoints,
            scripts,
            verifier: options.verifier,
            retarget: options.retarget,
            clock: options.clock,
            sinks: Vec::new(),
        })
    }

    /// Flushes storage and releases the chain.
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        info!("Closed chain at height {}", self.tip.height);
        Ok(())
    }

    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn db(&self) -> &ChainDb {
        &self.db
    }

    pub fn tip(&self) -> &Entry {
        &self.tip
    }

    pub fn height(&self) -> u32 {
        self.tip.height
    }

    pub fn chain_state(&self) -> ChainState {
        self.state
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.index.contains(hash)
    }

    pub fn get_entry(&self, hash: &Sha256Hash) -> Option<&Entry> {
        self.index.get(hash)
    }

    /// Entry of the active chain at `height`.
    pub fn entry_at(&self, height: u32) -> Option<&Entry> {
        self.active
            .get(height as usize)
            .and_then(|hash| self.index.get(hash))
    }

    /// Whether `hash` is part of the active chain.
    pub fn is_active(&self, hash: &Sha256Hash) -> bool {
        self.index
            .get(hash)
            .is_some_and(|entry| self.active.get(entry.height as usize) == Some(hash))
    }

    /// Heads of every known branch.
    pub fn tips(&self) -> Vec<&Entry> {
        self.index.tips().collect()
    }

    pub fn median_time_past(&self) -> i64 {
        self.index.median_time_past(&self.tip)
    }

    pub fn block(&self, hash: &Sha256Hash) -> Result<Option<Arc<Block>>> {
        self.db.get_block(hash)
    }

    /// An unspent coin of the active chain.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.db.fetch_coin(outpoint)
    }

    /// State of deployment `name` for the block after the active tip.
    pub fn deployment_state(&mut self, name: &str) -> Result<ThresholdState> {
        let deployment = self
            .params
            .deployment(name)
            .ok_or_else(|| ChainError::NotFound(format!("deployment {}", name)))?;
        self.deployments
            .state(&self.index, Some(&self.tip), deployment)
    }

    /// Lazily walks the active chain from `from_height` as it is now.
    pub fn scan(&self, from_height: u32, handle: ScanHandle) -> ChainScan {
        let hashes = self
            .active
            .get(from_height as usize..)
            .map(<[Sha256Hash]>::to_vec)
            .unwrap_or_default();
        ChainScan::new(self.db.clone(), hashes, handle)
    }

    /// Validates `block` and adds it to the chain.
    pub fn add_block(&mut self, block: Block) -> Result<AcceptOutcome> {
        let hash = block.hash();
        let result = self.accept(block);
        match &result {
            Err(ChainError::Rejected(rejection)) => {
                warn!("Rejected block {}: {}", to_hex(&hash), rejection);
            }
            Err(ChainError::Orphan { parent, .. }) => {
                debug!("Orphan block {} (parent {})", to_hex(&hash), to_hex(parent));
            }
            Err(err) => warn!("Failed to add block {}: {}", to_hex(&hash), err),
            Ok(_) => {}
        }
        result
    }

    fn accept(&mut self, block: Block) -> Result<AcceptOutcome> {
        let hash = block.hash();
        check_block(&block, &self.params, self.clock.now())?;

        if self.index.contains(&hash) {
            return Err(Rejection::duplicate("duplicate").into());
        }
        let parent = self
            .index
            .get(&block.header.prev_hash)
            .cloned()
            .ok_or(ChainError::Orphan {
                hash,
                parent: block.header.prev_hash,
            })?;
        let entry = Entry::from_header(&block.header, &parent);

        self.check_context(&block, &entry, &parent)?;
        let block = Arc::new(block);

        if entry.chainwork <= self.tip.chainwork {
            self.store_entry(&entry, &block)?;
            info!(
                "Stored alternate tip {} at height {}",
                entry.hash_str(),
                entry.height
            );
            return Ok(AcceptOutcome::AlternateTip);
        }

        if entry.prev_hash == self.tip.hash {
            self.connect_block(&entry, &block, true)?;
            return Ok(AcceptOutcome::Extended);
        }

        let fork = self.index.common_ancestor(&parent.hash, &self.tip.hash)?.clone();
        self.checkpoints.verify_fork(&fork)?;
        self.store_entry(&entry, &block)?;
        self.reorganize(&fork, &entry)
    }

    /// Rules evaluated against the parent: retarget, timestamps, versions,
    /// checkpoints, deployment signaling and transaction finality.
    fn check_context(&mut self, block: &Block, entry: &Entry, parent: &Entry) -> Result<()> {
        let params = self.params.clone();
        let expected_bits = self
            .retarget
            .next_bits(&self.index, parent, block.header.time, &params)?;
        let parent_mtp = self.index.median_time_past(parent);
        check_header_context(block, entry.height, expected_bits, parent_mtp, &params)?;

        self.checkpoints.verify(&self.index, entry, parent)?;

        let mut csv_active = false;
        for deployment in &params.deployments {
            let state = self.deployments.state(&self.index, Some(parent), deployment)?;
            if state != ThresholdState::Active {
                continue;
            }
            if deployment.mandatory_signal && !signals(block.header.version, deployment) {
                return Err(Rejection::invalid("bad-no-signal", 100).into());
            }
            if deployment.name == CSV_DEPLOYMENT {
                csv_active = true;
            }
        }

        let cutoff = if csv_active {
            parent_mtp
        } else {
            i64::from(block.header.time)
        };
        check_block_context(block, entry.height, cutoff, &params)?;
        Ok(())
    }

    pub(crate) fn csv_active(&mut self, parent: &Entry) -> Result<bool> {
        let params = self.params.clone();
        match params.deployment(CSV_DEPLOYMENT) {
            Some(deployment) => self
                .deployments
                .is_active(&self.index, Some(parent), deployment),
            None => Ok(false),
        }
    }

    /// Queues terminal deployment states computed since the last commit.
    pub(crate) fn stage_deployments(&self, batch: &mut ChainBatch) -> Result<()> {
        for record in self.deployments.pending() {
            batch.put_deployment(record)?;
        }
        Ok(())
    }

    /// Persists and indexes an entry without connecting it.
    fn store_entry(&mut self, entry: &Entry, block: &Arc<Block>) -> Result<()> {
        let mut batch = ChainBatch::new();
        batch.put_entry(entry)?;
        batch.put_block(entry.hash, block.clone())?;
        batch.remove_tip(&entry.prev_hash);
        batch.add_tip(&entry.hash);
        self.stage_deployments(&mut batch)?;
        self.db.commit(batch)?;

        self.deployments.clear_pending();
        self.index.insert(entry.clone())?;
        Ok(())
    }

    /// Deletes `hash` and its descendants from storage and the index.
    fn drop_branch(&mut self, hash: &Sha256Hash) -> Result<()> {
        let root = self.index.entry(hash)?.clone();
        let mut doomed = vec![root.hash];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let children = self.index.children(&doomed[cursor]).to_vec();
            doomed.extend(children);
            cursor += 1;
        }

        let mut batch = ChainBatch::new();
        for hash in &doomed {
            batch.delete_entry(hash);
            batch.delete_block(hash);
            batch.remove_tip(hash);
        }
        if self.index.children(&root.prev_hash).len() == 1 {
            batch.add_tip(&root.prev_hash);
        }
        self.db.commit(batch)?;

        let removed = self.index.remove_branch(hash);
        warn!(
            "Dropped invalid branch at {} ({} entries)",
            root.hash_str(),
            removed.len()
        );
        Ok(())
    }

    /// Entries from just above `fork` up to `target`, ascending.
    fn branch_path(&self, fork: &Entry, target: &Entry) -> Result<Vec<Entry>> {
        let mut path = Vec::with_capacity((target.height - fork.height) as usize);
        let mut walk = target.clone();
        while walk.height > fork.height {
            let prev = self.index.entry(&walk.prev_hash)?.clone();
            path.push(walk);
            walk = prev;
        }
        if walk.hash != fork.hash {
            return Err(ChainError::Corrupt(format!(
                "{} does not descend from {}",
                target.hash_str(),
                fork.hash_str()
            )));
        }
        path.reverse();
        Ok(path)
    }

    /// Disconnects down to `fork` and connects up to `target`. A rejected
    /// connect stops the walk and is returned with the offending hash; the
    /// connected prefix stays active.
    fn switch_branch(
        &mut self,
        fork: &Entry,
        target: &Entry,
    ) -> Result<Option<(Sha256Hash, ChainError)>> {
        while self.tip.height > fork.height {
            self.disconnect_tip()?;
        }
        for entry in self.branch_path(fork, target)? {
            let block = self.db.require_block(&entry.hash)?;
            match self.connect_block(&entry, &block, false) {
                Ok(()) => {}
                Err(err @ ChainError::Rejected(_)) => return Ok(Some((entry.hash, err))),
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn reorganize(&mut self, fork: &Entry, target: &Entry) -> Result<AcceptOutcome> {
        let from = self.tip.clone();
        info!(
            "Reorganizing from {} (height {}) to {} (height {}), fork at height {}",
            from.hash_str(),
            from.height,
            target.hash_str(),
            target.height,
            fork.height
        );

        match self.switch_branch(fork, target)? {
            None => {
                info!("Reorganization complete, new tip at height {}", self.tip.height);
                self.notify(&ChainEvent::Reorganize {
                    from,
                    to: self.tip.clone(),
                });
                Ok(AcceptOutcome::Reorganized {
                    fork_height: fork.height,
                })
            }
            Some((bad, err)) => {
                warn!("Reorganization failed at {}: {}", to_hex(&bad), err);
                self.drop_branch(&bad)?;
                self.activate_best_chain()?;
                if self.tip.hash != from.hash {
                    self.notify(&ChainEvent::Reorganize {
                        from,
                        to: self.tip.clone(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Moves the active chain to the most-work valid tip, dropping every
    /// branch that fails to connect on the way.
    fn activate_best_chain(&mut self) -> Result<()> {
        loop {
            let Some(best) = self.index.best_tip().cloned() else {
                return Ok(());
            };
            if best.chainwork <= self.tip.chainwork {
                return Ok(());
            }
            let fork = self.index.common_ancestor(&best.hash, &self.tip.hash)?.clone();
            if self.checkpoints.verify_fork(&fork).is_err() {
                return Ok(());
            }
            match self.switch_branch(&fork, &best)? {
                None => return Ok(()),
                Some((bad, err)) => {
                    warn!("Branch at {} failed to connect: {}", to_hex(&bad), err);
                    self.drop_branch(&bad)?;
                }
            }
        }
    }

    pub(crate) fn notify(&self, event: &ChainEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}
