//! Chain schema on top of a [`Persistence`] backend.
//!
//! Values are bincode-encoded. Coin and block reads go through LRU caches
//! that are updated only after a batch has been committed. A read that
//! missed the cache populates it only if no commit landed while it was
//! reading the store.

use crate::blockchain::{Block, ChainState};
use crate::cache::{BlockCache, CoinCache, DEFAULT_BLOCK_CACHE_SIZE, DEFAULT_COIN_CACHE_SIZE};
use crate::coins::{BlockUndo, Coin, CoinSource};
use crate::deployments::DeploymentRecord;
use crate::error::{ChainError, Result};
use crate::hash::{to_hex, Sha256Hash};
use crate::index::Entry;
use crate::persistence::{Column, Persistence, WriteBatch};
use crate::transaction::OutPoint;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::Arc;

const META_BEST: &[u8] = b"best";
const META_STATE: &[u8] = b"state";

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn hash_key(bytes: &[u8]) -> Result<Sha256Hash> {
    bytes
        .try_into()
        .map_err(|_| ChainError::Corrupt(format!("bad hash key of {} bytes", bytes.len())))
}

fn deployment_key(name: &str, boundary: &Sha256Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 33);
    key.extend_from_slice(name.as_bytes());
    key.push(b'/');
    key.extend_from_slice(boundary);
    key
}

/// Writes for one commit, with the cache updates to apply once it lands.
#[derive(Default)]
pub struct ChainBatch {
    batch: WriteBatch,
    coin_puts: Vec<Coin>,
    coin_deletes: Vec<OutPoint>,
    blocks_put: Vec<(Sha256Hash, Arc<Block>)>,
    blocks_deleted: Vec<Sha256Hash>,
}

impl ChainBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn put_entry(&mut self, entry: &Entry) -> Result<()> {
        self.batch
            .put(Column::Entry, entry.hash.to_vec(), bincode::serialize(entry)?);
        Ok(())
    }

    pub fn delete_entry(&mut self, hash: &Sha256Hash) {
        self.batch.delete(Column::Entry, hash.to_vec());
    }

    pub fn put_block(&mut self, hash: Sha256Hash, block: Arc<Block>) -> Result<()> {
        self.batch
            .put(Column::Block, hash.to_vec(), bincode::serialize(block.as_ref())?);
        self.blocks_put.push((hash, block));
        Ok(())
    }

    pub fn delete_block(&mut self, hash: &Sha256Hash) {
        self.batch.delete(Column::Block, hash.to_vec());
        self.blocks_deleted.push(*hash);
    }

    pub fn put_coin(&mut self, coin: Coin) -> Result<()> {
        self.batch
            .put(Column::Coin, coin.outpoint.key().to_vec(), bincode::serialize(&coin)?);
        self.coin_puts.push(coin);
        Ok(())
    }

    pub fn delete_coin(&mut self, outpoint: &OutPoint) {
        self.batch.delete(Column::Coin, outpoint.key().to_vec());
        self.coin_deletes.push(*outpoint);
    }

    pub fn put_undo(&mut self, hash: &Sha256Hash, undo: &BlockUndo) -> Result<()> {
        self.batch
            .put(Column::Undo, hash.to_vec(), bincode::serialize(undo)?);
        Ok(())
    }

    pub fn delete_undo(&mut self, hash: &Sha256Hash) {
        self.batch.delete(Column::Undo, hash.to_vec());
    }

    pub fn add_tip(&mut self, hash: &Sha256Hash) {
        self.batch.put(Column::Tip, hash.to_vec(), Vec::new());
    }

    pub fn remove_tip(&mut self, hash: &Sha256Hash) {
        self.batch.delete(Column::Tip, hash.to_vec());
    }

    pub fn set_best(&mut self, hash: &Sha256Hash) {
        self.batch.put(Column::Meta, META_BEST, hash.to_vec());
    }

    pub fn set_state(&mut self, state: &ChainState) -> Result<()> {
        self.batch
            .put(Column::Meta, META_STATE, bincode::serialize(state)?);
        Ok(())
    }

    pub fn put_deployment(&mut self, record: &DeploymentRecord) -> Result<()> {
        self.batch.put(
            Column::Deployment,
            deployment_key(&record.name, &record.boundary),
            bincode::serialize(record)?,
        );
        Ok(())
    }
}

/// Cloneable handle to the chain's durable state.
#[derive(Clone)]
pub struct ChainDb {
    store: Arc<dyn Persistence>,
    coins: Arc<CoinCache>,
    blocks: Arc<BlockCache>,
    /// Bumped by every commit. Held for writing across a commit.
    generation: Arc<RwLock<u64>>,
}

impl ChainDb {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self::with_cache_sizes(store, DEFAULT_COIN_CACHE_SIZE, DEFAULT_BLOCK_CACHE_SIZE)
    }

    pub fn with_cache_sizes(store: Arc<dyn Persistence>, coin_cache: usize, block_cache: usize) -> Self {
        ChainDb {
            store,
            coins: Arc::new(CoinCache::new_lru(coin_cache)),
            blocks: Arc::new(BlockCache::new_lru(block_cache)),
            generation: Arc::new(RwLock::new(0)),
        }
    }

    pub fn get_entry(&self, hash: &Sha256Hash) -> Result<Option<Entry>> {
        self.store
            .get(Column::Entry, hash)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Every stored entry, unordered.
    pub fn load_entries(&self) -> Result<Vec<Entry>> {
        self.store
            .scan(Column::Entry)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    pub fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Arc<Block>>> {
        if let Some(block) = self.blocks.get(hash) {
            return Ok(Some(block));
        }
        let generation = *self.generation.read();
        let Some(bytes) = self.store.get(Column::Block, hash)? else {
            return Ok(None);
        };
        let block: Arc<Block> = Arc::new(decode(&bytes)?);
        let current = self.generation.read();
        if *current == generation {
            self.blocks.put(*hash, block.clone());
        }
        Ok(Some(block))
    }

    pub fn require_block(&self, hash: &Sha256Hash) -> Result<Arc<Block>> {
        self.get_block(hash)?
            .ok_or_else(|| ChainError::Corrupt(format!("block {} missing from storage", to_hex(hash))))
    }

    pub fn get_undo(&self, hash: &Sha256Hash) -> Result<Option<BlockUndo>> {
        self.store
            .get(Column::Undo, hash)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn tips(&self) -> Result<Vec<Sha256Hash>> {
        self.store
            .scan(Column::Tip)?
            .iter()
            .map(|(key, _)| hash_key(key))
            .collect()
    }

    pub fn best_hash(&self) -> Result<Option<Sha256Hash>> {
        self.store
            .get(Column::Meta, META_BEST)?
            .map(|bytes| hash_key(&bytes))
            .transpose()
    }

    pub fn chain_state(&self) -> Result<ChainState> {
        Ok(self
            .store
            .get(Column::Meta, META_STATE)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn deployment_records(&self) -> Result<Vec<DeploymentRecord>> {
        self.store
            .scan(Column::Deployment)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Number of coins in durable storage. Walks the whole column.
    pub fn coin_count(&self) -> Result<u64> {
        Ok(self.store.scan(Column::Coin)?.len() as u64)
    }

    /// Every coin in durable storage, in outpoint key order.
    pub fn coins(&self) -> Result<Vec<Coin>> {
        self.store
            .scan(Column::Coin)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    pub fn commit(&self, batch: ChainBatch) -> Result<()> {
        let mut generation = self.generation.write();
        self.store.write_batch(&batch.batch)?;
        *generation += 1;

        for outpoint in &batch.coin_deletes {
            self.coins.remove(outpoint);
        }
        for coin in batch.coin_puts {
            self.coins.put(coin.outpoint, coin);
        }
        for hash in &batch.blocks_deleted {
            self.blocks.remove(hash);
        }
        for (hash, block) in batch.blocks_put {
            self.blocks.put(hash, block);
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

impl CoinSource for ChainDb {
    fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        if let Some(coin) = self.coins.get(outpoint) {
            return Ok(Some(coin));
        }
        let generation = *self.generation.read();
        let Some(bytes) = self.store.get(Column::Coin, &outpoint.key())? else {
            return Ok(None);
        };
        let coin: Coin = decode(&bytes)?;
        let current = self.generation.read();
        if *current == generation {
            self.coins.put(*outpoint, coin.clone());
        }
        Ok(Some(coin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Database, InMemoryPersistence};
    use crate::params::ChainParams;
    use parking_lot::Mutex;
    use std::sync::Barrier;

    /// Parks the next read of `key` on the barrier twice, after the value
    /// has been read from the inner store.
    struct PausingStore {
        inner: InMemoryPersistence,
        key: Mutex<Option<Vec<u8>>>,
        barrier: Barrier,
    }

    impl Persistence for PausingStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
            let value = self.inner.get(column, key)?;
            let armed = {
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

        fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan(column)
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
            self.inner.write_batch(batch)
        }
    }

    fn coin(tag: u8) -> Coin {
        Coin {
            outpoint: OutPoint::new([tag; 32], 1),
            value: 42,
            script_pubkey: vec![0x51],
            height: 3,
            coinbase: false,
        }
    }

    #[test]
    fn commit_updates_store_and_cache() {
        let db = ChainDb::new(Arc::new(InMemoryPersistence::new()));
        let c = coin(1);

        let mut batch = ChainBatch::new();
        batch.put_coin(c.clone()).unwrap();
        db.commit(batch).unwrap();
        assert_eq!(db.fetch_coin(&c.outpoint).unwrap(), Some(c.clone()));
        assert_eq!(db.coin_count().unwrap(), 1);

        let mut batch = ChainBatch::new();
        batch.delete_coin(&c.outpoint);
        db.commit(batch).unwrap();
        assert_eq!(db.fetch_coin(&c.outpoint).unwrap(), None);
    }

    #[test]
    fn entries_blocks_and_meta_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();
        let params = ChainParams::regtest();
        let block = Arc::new(params.genesis_block());
        let entry = Entry::genesis(&block.header);
        let state = ChainState {
            tx_count: 1,
            coin_count: 0,
            value: 0,
        };

        {
            let db = ChainDb::new(Arc::new(Database::open(path).unwrap()));
            let mut batch = ChainBatch::new();
            batch.put_entry(&entry).unwrap();
            batch.put_block(entry.hash, block.clone()).unwrap();
            batch.add_tip(&entry.hash);
            batch.set_best(&entry.hash);
            batch.set_state(&state).unwrap();
            db.commit(batch).unwrap();
        }

        let db = ChainDb::new(Arc::new(Database::open(path).unwrap()));
        assert_eq!(db.get_entry(&entry.hash).unwrap(), Some(entry.clone()));
        assert_eq!(db.load_entries().unwrap(), vec![entry.clone()]);
        assert_eq!(db.get_block(&entry.hash).unwrap().as_deref(), Some(block.as_ref()));
        assert_eq!(db.tips().unwrap(), vec![entry.hash]);
        assert_eq!(db.best_hash().unwrap(), Some(entry.hash));
        assert_eq!(db.chain_state().unwrap(), state);
    }

    #[test]
    fn read_racing_a_delete_does_not_refill_cache() {
        let store = Arc::new(PausingStore {
            inner: InMemoryPersistence::new(),
            key: Mutex::new(None),
            barrier: Barrier::new(2),
        });
        let db = ChainDb::new(store.clone());
        let c = coin(7);

        let mut batch = ChainBatch::new();
        batch.put_coin(c.clone()).unwrap();
        db.commit(batch).unwrap();
        db.coins.clear();
        *store.key.lock() = Some(c.outpoint.key().to_vec());

        let reader = {
            let db = db.clone();
            let outpoint = c.outpoint;
            std::thread::spawn(move || db.fetch_coin(&outpoint))
        };
        store.barrier.wait();
        let mut batch = ChainBatch::new();
        batch.delete_coin(&c.outpoint);
        db.commit(batch).unwrap();
        store.barrier.wait();

        assert_eq!(reader.join().unwrap().unwrap(), Some(c.clone()));
        assert_eq!(db.fetch_coin(&c.outpoint).unwrap(), None);
        assert!(db.coins.is_empty());
    }
}
