//! Caching layer for hot chain data
//!
//! Provides LRU caching for:
//! - Recently read or written coins
//! - Recent full blocks (shared as `Arc<Block>`)
use crate::blockchain::Block;
use crate::coins::Coin;
use crate::hash::Sha256Hash;
use crate::transaction::OutPoint;
use lru::LruCache;
use parking_lot::RwLock;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub const DEFAULT_COIN_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 64;

/// Thread-safe LRU cache. A hit promotes the entry, so reads take the
/// write lock.
pub struct ThreadSafeCache<K, V> {
    cache: RwLock<LruCache<K, V>>,
}

impl<K, V> ThreadSafeCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// A capacity of zero is treated as one.
    pub fn new_lru(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ThreadSafeCache {
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.read().cap().get()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.write().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.cache.write().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache.write().pop(key)
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type CoinCache = ThreadSafeCache<OutPoint, Coin>;
pub type BlockCache = ThreadSafeCache<Sha256Hash, Arc<Block>>;
