//! Shared fixture for integration tests: a regtest chain with a fixed clock
//! and a helper that mines valid blocks on any parent.
#![allow(dead_code)]

use chaincore::blockchain::{Block, BlockHeader, Chain, ChainOptions};
use chaincore::chaindb::ChainDb;
use chaincore::clock::FixedClock;
use chaincore::coins::Coin;
use chaincore::error::ChainError;
use chaincore::events::{ChainEvent, ChannelSink};
use chaincore::hash::{Sha256Hash, ZERO_HASH};
use chaincore::index::Entry;
use chaincore::params::ChainParams;
use chaincore::persistence::{Column, InMemoryPersistence, Persistence, WriteBatch};
use chaincore::pow::check_proof_of_work;
use chaincore::script::coinbase_height_script;
use chaincore::transaction::{OutPoint, Transaction, TxIn, TxOut};
use chaincore::verify::{ScriptError, ScriptFlags, ScriptVerifier};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const BLOCK_SPACING: u32 = 600;

pub struct Harness {
    pub chain: Chain,
    pub events: Receiver<ChainEvent>,
}

/// Two script threads and a clock well past genesis.
pub fn test_options(params: &ChainParams) -> ChainOptions {
    let now = i64::from(params.genesis_block().header.time) + 10_000_000;
    ChainOptions::default()
        .with_script_threads(2)
        .with_clock(Arc::new(FixedClock::new(now)))
}

pub fn open_with(params: ChainParams, db: ChainDb, options: ChainOptions) -> chaincore::Result<Harness> {
    let mut chain = Chain::open(params, db, options)?;
    let (sink, events) = ChannelSink::new();
    chain.subscribe(Box::new(sink));
    Ok(Harness { chain, events })
}

pub fn open_chain(params: ChainParams, store: Arc<dyn Persistence>) -> chaincore::Result<Harness> {
    let options = test_options(&params);
    open_with(params, ChainDb::new(store), options)
}

pub fn regtest() -> chaincore::Result<Harness> {
    open_chain(ChainParams::regtest(), Arc::new(InMemoryPersistence::new()))
}

/// 25-byte pay-to-pubkey-hash shaped script.
pub fn lock_script(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn coinbase(height: u32, value: i64, tag: u8) -> Transaction {
    let mut script_sig = coinbase_height_script(height);
    script_sig.extend_from_slice(&[tag; 20]);
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::NULL,
            script_sig,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: lock_script(tag),
        }],
        lock_time: 0,
    }
}

/// Spends `prevouts` into a single output of `value`.
pub fn spend(prevouts: &[OutPoint], value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts
            .iter()
            .map(|prevout| {
                let mut script_sig = vec![0x14];
                script_sig.extend_from_slice(&[tag; 20]);
                TxIn {
                    prevout: *prevout,
                    script_sig,
                    sequence: u32::MAX,
                }
            })
            .collect(),
        outputs: vec![TxOut {
            value,
            script_pubkey: lock_script(tag),
        }],
        lock_time: 0,
    }
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Header fields filled and nonce solved; `txs` are placed after the
/// coinbase exactly as given.
pub fn assemble(params: &ChainParams, parent: &Entry, txs: Vec<Transaction>, tag: u8) -> Block {
    let height = parent.height + 1;
    let mut transactions = vec![coinbase(height, params.subsidy(height), tag)];
    transactions.extend(txs);

    let mut block = Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_hash: parent.hash,
            merkle_root: ZERO_HASH,
            time: parent.time + BLOCK_SPACING,
            bits: params.pow_limit_bits,
            nonce: 0,
        },
        transactions,
    };
    solve(params, &mut block);
    block
}

/// Recomputes the merkle root and searches for a nonce meeting the target.
pub fn solve(params: &ChainParams, block: &mut Block) {
    block.header.merkle_root = block.compute_merkle_root().0;
    block.header.nonce = 0;
    while !check_proof_of_work(&block.hash(), block.header.bits, params.pow_limit_bits) {
        block.header.nonce += 1;
    }
}

/// Like [`assemble`], with the non-coinbase transactions in canonical order.
pub fn make_block(params: &ChainParams, parent: &Entry, mut txs: Vec<Transaction>, tag: u8) -> Block {
    txs.sort_by_key(Transaction::txid);
    assemble(params, parent, txs, tag)
}

impl Harness {
    pub fn entry(&self, hash: &Sha256Hash) -> Entry {
        self.chain
            .get_entry(hash)
            .cloned()
            .expect("entry is indexed")
    }

    /// Builds a block on the active tip and adds it.
    pub fn mine(&mut self, txs: Vec<Transaction>, tag: u8) -> chaincore::Result<Block> {
        let block = make_block(self.chain.params(), self.chain.tip(), txs, tag);
        self.chain.add_block(block.clone())?;
        Ok(block)
    }

    pub fn mine_empty(&mut self, count: u32) -> chaincore::Result<Vec<Block>> {
        (0..count).map(|_| self.mine(Vec::new(), 0)).collect()
    }

    /// Builds a block on an arbitrary indexed parent without adding it.
    pub fn block_on(&self, parent: &Sha256Hash, txs: Vec<Transaction>, tag: u8) -> Block {
        make_block(self.chain.params(), &self.entry(parent), txs, tag)
    }

    pub fn drain(&self) -> Vec<ChainEvent> {
        self.events.try_iter().collect()
    }
}

/// In-memory store whose batch writes can be switched to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: InMemoryPersistence,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

impl Persistence for FailingStore {
    fn get(&self, column: Column, key: &[u8]) -> chaincore::Result<Option<Vec<u8>>> {
        self.inner.get(column, key)
    }

    fn scan(&self, column: Column) -> chaincore::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan(column)
    }

    fn write_batch(&self, batch: &WriteBatch) -> chaincore::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChainError::Database("disk full".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

/// In-memory store that parks the next read of one coin between two
/// barrier waits, after the value has been read.
pub struct PausingStore {
    inner: InMemoryPersistence,
    key: Mutex<Option<Vec<u8>>>,
    barrier: Barrier,
}

impl PausingStore {
    pub fn new() -> Self {
        PausingStore {
            inner: InMemoryPersistence::new(),
            key: Mutex::new(None),
            barrier: Barrier::new(2),
        }
    }

    pub fn pause_next_read(&self, outpoint: &OutPoint) {
        *self.key.lock() = Some(outpoint.key().to_vec());
    }

    /// Meets the paused reader at the barrier.
    pub fn wait(&self) {
        self.barrier.wait();
    }
}

impl Persistence for PausingStore {
    fn get(&self, column: Column, key: &[u8]) -> chaincore::Result<Option<Vec<u8>>> {
        let value = self.inner.get(column, key)?;
        let armed = column == Column::Coin && {
            let mut pending = self.key.lock();
            if pending.as_deref() == Some(key) {
                *pending = None;
                true
            } else {
                false
            }
        };
        if armed {
            self.barrier.wait();
            self.barrier.wait();
        }
        Ok(value)
    }

    fn scan(&self, column: Column) -> chaincore::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan(column)
    }

    fn write_batch(&self, batch: &WriteBatch) -> chaincore::Result<()> {
        self.inner.write_batch(batch)
    }
}

/// Fails every script.
pub struct RejectScripts;

impl ScriptVerifier for RejectScripts {
    fn verify(
        &self,
        _tx: &Transaction,
        _input: usize,
        _coin: &Coin,
        _flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        Err(ScriptError::EvalFalse)
    }
}
