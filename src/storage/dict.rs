//! Sharded Concurrent Dictionary
//!
//! A thread-safe map from binary keys to values. The key space is split across
//! a power-of-two number of shards, each guarded by its own `RwLock`, so
//! single-key calls on different shards never contend.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConcurrentDict<V>                        │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │            │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dictionary only makes *single* calls atomic. Read-modify-write
//! sequences across calls must be protected by the striped key locks.

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Smallest shard count a dictionary is created with.
const MIN_SHARDS: usize = 16;

/// Hashes a key for shard and stripe selection.
///
/// `DefaultHasher::new()` is seeded with fixed keys, so the result is stable
/// for the lifetime of the process.
#[inline]
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Rounds a requested shard count up to a power of two.
fn shard_count_for(requested: usize) -> usize {
    requested.max(MIN_SHARDS).next_power_of_two()
}

/// A concurrent map of `Bytes` keys to `V`.
pub struct ConcurrentDict<V> {
    shards: Box<[RwLock<HashMap<Bytes, V>>]>,
    count: AtomicUsize,
}

impl<V> std::fmt::Debug for ConcurrentDict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDict")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Default for ConcurrentDict<V> {
    fn default() -> Self {
        Self::with_shards(MIN_SHARDS)
    }
}

impl<V> ConcurrentDict<V> {
    /// Creates a dictionary with at least `shards` shards.
    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shard_count_for(shards))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of shards actually allocated.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        (hash_key(key) as usize) & (self.shards.len() - 1)
    }

    fn read_shard(&self, index: usize) -> RwLockReadGuard<'_, HashMap<Bytes, V>> {
        self.shards[index]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, index: usize) -> RwLockWriteGuard<'_, HashMap<Bytes, V>> {
        self.shards[index]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.read_shard(self.shard_index(key)).get(key).cloned()
    }

    /// Runs `f` against the stored value without cloning it.
    pub fn with_value<R>(&self, key: &[u8], f: impl FnOnce(&V) -> R) -> Option<R> {
        self.read_shard(self.shard_index(key)).get(key).map(f)
    }

    /// Mutates the stored value in place.
    ///
    /// Returns `None` when the key is absent.
    pub fn update<R>(&self, key: &[u8], f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.write_shard(self.shard_index(key)).get_mut(key).map(f)
    }

    /// Mutates the value under `key`, inserting `default()` first when absent.
    ///
    /// The lookup and the mutation happen under one shard lock.
    pub fn upsert<R>(
        &self,
        key: &[u8],
        default: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.write_shard(self.shard_index(key));
        if let Some(value) = shard.get_mut(key) {
            return f(value);
        }

        let mut value = default();
        let result = f(&mut value);
        shard.insert(Bytes::copy_from_slice(key), value);
        self.count.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Checks whether `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.read_shard(self.shard_index(key)).contains_key(key)
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn put(&self, key: Bytes, value: V) -> Option<V> {
        let index = self.shard_index(&key);
        let previous = self.write_shard(index).insert(key, value);
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// Inserts `key` only if it is absent. Returns `true` on insert.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> bool {
        let index = self.shard_index(&key);
        let mut shard = self.write_shard(index);
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Overwrites `key` only if it is present. Returns `true` on overwrite.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool {
        match self.write_shard(self.shard_index(key)).get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        let removed = self.write_shard(self.shard_index(key)).remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns true if the dictionary holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every key, shard by shard.
    ///
    /// Not a point-in-time view: keys written concurrently may or may not appear.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        for index in 0..self.shards.len() {
            keys.extend(self.read_shard(index).keys().cloned());
        }
        keys
    }

    /// Visits entries until `visit` returns `false`.
    ///
    /// Each shard is read-locked while it is visited, so `visit` must not call
    /// back into this dictionary.
    pub fn for_each(&self, mut visit: impl FnMut(&Bytes, &V) -> bool) {
        for index in 0..self.shards.len() {
            let shard = self.read_shard(index);
            for (key, value) in shard.iter() {
                if !visit(key, value) {
                    return;
                }
            }
        }
    }

    /// Removes every entry and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for index in 0..self.shards.len() {
            let mut shard = self.write_shard(index);
            removed += shard.len();
            shard.clear();
        }
        self.count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }
}
