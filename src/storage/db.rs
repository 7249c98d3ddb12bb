//! Database Store
//!
//! One [`Database`] backs one logical database index. It owns three
//! concurrent maps and ties them together with the striped key locks, the
//! pause barrier and the delay scheduler:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Database<V>                            │
//! │                                                               │
//! │   data:     key -> V               ┐                          │
//! │   ttl:      key -> SystemTime      ├─ guarded by key stripes  │
//! │   versions: key -> u64             ┘                          │
//! │                                                               │
//! │   StripedLocks   PauseBarrier   DelayScheduler   on_mutate    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Access Discipline
//!
//! Every per-key operation goes through a [`KeyGuard`]. Building one first
//! passes the pause barrier and then acquires the stripes for the requested
//! write and read keys, so a guard in hand proves both. Whole-keyspace work
//! (`FLUSHDB`) goes through a [`PauseGuard`] instead.
//!
//! ## Expiration
//!
//! Keys with a TTL expire two ways:
//! 1. **Lazy**: any access through a guard first checks the TTL and removes a
//!    due key.
//! 2. **Active**: `expire` registers a callback named `expire:<db>:<key>` with the
//!    scheduler. When it fires it locks the key, re-reads the TTL (it may have
//!    been rewritten or cleared meanwhile) and only removes the key if the
//!    current TTL is due.
//!
//! ## Versions
//!
//! Every effective mutation bumps the key's version while its write lock is
//! held. The exception is lazy expiration found by a reader: it removes the
//! key and bumps under a shared stripe, and exactly one of the racing readers
//! does so. Versions never decrease, which lets `WATCH`-style callers detect
//! changes by comparing snapshots.

use crate::config::ServerConfig;
use crate::storage::barrier::{Pass, PauseBarrier, Paused};
use crate::storage::dict::ConcurrentDict;
use crate::storage::lock::{LockGuard, StripedLocks};
use crate::storage::timewheel::DelayScheduler;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, trace};

/// A command line as it would be replayed from a persistence log.
pub type CmdLine = Vec<Bytes>;

/// Receives every durable mutation, e.g. to append it to a log.
///
/// Called while key locks may be held, so implementations should only enqueue.
pub type MutationHook = Arc<dyn Fn(CmdLine) + Send + Sync>;

const EXPIRE_TASK_PREFIX: &[u8] = b"expire:";

/// Scheduler task name for a key's expiration: `expire:<db>:<key>`.
///
/// Databases of one server share a scheduler, so the index keeps equal keys
/// in different databases apart.
fn expire_task_name(db: usize, key: &[u8]) -> Bytes {
    let index = db.to_string();
    let mut name = BytesMut::with_capacity(EXPIRE_TASK_PREFIX.len() + index.len() + 1 + key.len());
    name.extend_from_slice(EXPIRE_TASK_PREFIX);
    name.extend_from_slice(index.as_bytes());
    name.extend_from_slice(b":");
    name.extend_from_slice(key);
    name.freeze()
}

/// Builds a command line from its parts.
pub fn cmd_line(parts: &[&[u8]]) -> CmdLine {
    parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
}

/// Point-in-time counters for one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Live keys
    pub keys: usize,
    /// Keys carrying a TTL
    pub volatile_keys: usize,
    /// Keys removed by expiration since startup
    pub expired_keys: u64,
}

/// Versions observed for a set of keys, for optimistic transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watched {
    versions: Vec<(Bytes, u64)>,
}

impl Watched {
    /// The watched keys, suitable as a read-key set.
    pub fn keys(&self) -> Vec<Bytes> {
        self.versions.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Number of watched keys.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns true if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

struct Shared<V> {
    index: usize,
    data: ConcurrentDict<V>,
    ttl: ConcurrentDict<SystemTime>,
    versions: ConcurrentDict<u64>,
    locks: StripedLocks,
    barrier: PauseBarrier,
    scheduler: Arc<dyn DelayScheduler>,
    on_mutate: RwLock<MutationHook>,
    expired: AtomicU64,
}

impl<V> Shared<V> {
    fn task_name(&self, key: &[u8]) -> Bytes {
        expire_task_name(self.index, key)
    }

    fn notify(&self, line: CmdLine) {
        let hook = self
            .on_mutate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        hook(line);
    }

    /// Caller holds the key's write lock (or the pause), or is the one reader
    /// that won a lazy expiration.
    fn bump_version(&self, key: &[u8]) -> u64 {
        self.versions.upsert(key, || 0, |version| {
            *version += 1;
            *version
        })
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).unwrap_or(0)
    }

    /// Removes a key whose TTL has passed.
    ///
    /// Readers may race here under shared stripes. The entry goes before the
    /// TTL, so a reader that misses the TTL also misses the entry. Only the
    /// reader that takes the entry out counts and logs it; only the one that
    /// takes the TTL out cancels the task and bumps the version.
    fn expire_key(&self, key: &[u8]) {
        if self.data.remove(key).is_some() {
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.notify(cmd_line(&[b"DEL", key]));
        }

        if self.ttl.remove(key).is_none() {
            return;
        }
        self.scheduler.cancel(&self.task_name(key));
        self.bump_version(key);

        debug!(db = self.index, key = %String::from_utf8_lossy(key), "Key expired");
    }
}

impl<V: Send + Sync + 'static> Shared<V> {
    /// Registers the active-expiration callback for `key`.
    fn schedule_expiration(self: &Arc<Self>, key: &[u8], at: SystemTime) {
        let shared = Arc::downgrade(self);
        let key = Bytes::copy_from_slice(key);
        let name = self.task_name(&key);

        self.scheduler.schedule_at(
            at,
            name,
            Box::new(move || {
                // the database may be gone by the time the wheel fires
                if let Some(shared) = shared.upgrade() {
                    let guard = KeyGuard::acquire(&shared, &[&key], &[] as &[&[u8]]);
                    // check-lock-check: the TTL may have changed while we waited
                    if !guard.is_expired(&key) {
                        trace!(db = shared.index, key = %String::from_utf8_lossy(&key), "Stale expiration ignored");
                    }
                }
            }),
        );
    }
}

/// One logical database.
///
/// Cloning is cheap and yields a handle to the same database.
pub struct Database<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Database<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> std::fmt::Debug for Database<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("index", &self.shared.index)
            .field("keys", &self.shared.data.len())
            .field("volatile_keys", &self.shared.ttl.len())
            .field("locks", &self.shared.locks)
            .finish()
    }
}

impl<V: Send + Sync + 'static> Database<V> {
    /// Creates database `index`, sized from `config`.
    pub fn new(index: usize, config: &ServerConfig, scheduler: Arc<dyn DelayScheduler>) -> Self {
        let noop: MutationHook = Arc::new(|_: CmdLine| {});

        Self {
            shared: Arc::new(Shared {
                index,
                data: ConcurrentDict::with_shards(config.data_dict_shards),
                ttl: ConcurrentDict::with_shards(config.ttl_dict_shards),
                versions: ConcurrentDict::with_shards(config.data_dict_shards),
                locks: StripedLocks::new(config.lock_stripes),
                barrier: PauseBarrier::new(),
                scheduler,
                on_mutate: RwLock::new(noop),
                expired: AtomicU64::new(0),
            }),
        }
    }

    /// The logical index of this database.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Locks `write_keys` for writing and `read_keys` for reading.
    ///
    /// Blocks while the database is paused. The locks are released when the
    /// returned guard is dropped. A thread must not hold two guards of the same
    /// database at once.
    pub fn rw_locks<W, R>(&self, write_keys: &[W], read_keys: &[R]) -> KeyGuard<'_, V>
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        KeyGuard::acquire(&self.shared, write_keys, read_keys)
    }

    /// Write-locks a single key.
    pub fn lock_key(&self, key: &[u8]) -> KeyGuard<'_, V> {
        self.rw_locks(&[key], &[] as &[&[u8]])
    }

    /// Runs `f` with the given keys locked, releasing them afterwards.
    pub fn execute<W, R, T>(
        &self,
        write_keys: &[W],
        read_keys: &[R],
        f: impl FnOnce(&KeyGuard<'_, V>) -> T,
    ) -> T
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let guard = self.rw_locks(write_keys, read_keys);
        f(&guard)
    }

    /// Reads a key under its read lock.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.rw_locks(&[] as &[&[u8]], &[key]).get(key)
    }

    /// Writes a key under its write lock. Returns `true` if it was new.
    pub fn put(&self, key: Bytes, value: V) -> bool {
        let guard = self.lock_key(&key);
        guard.put(key.clone(), value)
    }

    /// Removes a key under its write lock. See [`KeyGuard::remove`].
    pub fn remove(&self, key: &[u8]) -> bool {
        self.lock_key(key).remove(key)
    }

    /// Sets a TTL under the key's write lock. See [`KeyGuard::expire`].
    pub fn expire(&self, key: &[u8], at: SystemTime) {
        self.lock_key(key).expire(key, at)
    }

    /// Clears a TTL under the key's write lock. See [`KeyGuard::persist`].
    pub fn persist(&self, key: &[u8]) -> bool {
        self.lock_key(key).persist(key)
    }

    /// Checks (and applies) expiration under the key's write lock.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        self.lock_key(key).is_expired(key)
    }

    /// Current version of a key; 0 if it was never mutated.
    pub fn version(&self, key: &[u8]) -> u64 {
        self.shared.version(key)
    }

    /// Snapshots the versions of `keys`.
    ///
    /// Check the snapshot later with [`KeyGuard::unchanged_since`] while holding
    /// at least read locks on the same keys.
    pub fn watch<K: AsRef<[u8]>>(&self, keys: &[K]) -> Watched {
        let versions = keys
            .iter()
            .map(|key| {
                let key = key.as_ref();
                (Bytes::copy_from_slice(key), self.shared.version(key))
            })
            .collect();
        Watched { versions }
    }

    /// Stops all per-key operations until the guard is dropped.
    ///
    /// Waits for operations already holding key guards to finish. Must not be
    /// called while the current thread holds a [`KeyGuard`] of this database.
    pub fn pause(&self) -> PauseGuard<'_, V> {
        let paused = self.shared.barrier.pause();
        debug!(db = self.shared.index, "Database paused");
        PauseGuard {
            shared: &self.shared,
            _paused: paused,
        }
    }

    /// Removes every key. Returns the number of keys removed.
    pub fn flush(&self) -> usize {
        let removed = self.pause().flush();
        info!(db = self.shared.index, removed, "Database flushed");
        removed
    }

    /// Installs the mutation hook, replacing the previous one.
    pub fn set_mutation_hook(&self, hook: impl Fn(CmdLine) + Send + Sync + 'static) {
        *self
            .shared
            .on_mutate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(hook);
    }

    /// Forwards a command line that produced a durable change to the hook.
    pub fn append_mutation(&self, line: CmdLine) {
        self.shared.notify(line);
    }

    /// Number of stored keys, including expired keys not yet removed.
    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns database statistics.
    pub fn stats(&self) -> DbStats {
        DbStats {
            keys: self.shared.data.len(),
            volatile_keys: self.shared.ttl.len(),
            expired_keys: self.shared.expired.load(Ordering::Relaxed),
        }
    }
}

/// Key locks plus a barrier pass, held for one logical operation.
///
/// All per-key reads and writes of the database go through this guard. In
/// debug builds each call asserts that the key's stripe is actually held in
/// the required mode.
pub struct KeyGuard<'a, V> {
    shared: &'a Arc<Shared<V>>,
    // field order matters: stripes are released before the pass
    locks: LockGuard<'a>,
    _pass: Pass<'a>,
}

impl<V> std::fmt::Debug for KeyGuard<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard")
            .field("db", &self.shared.index)
            .field("locks", &self.locks)
            .finish()
    }
}

impl<'a, V: Send + Sync + 'static> KeyGuard<'a, V> {
    fn acquire<W, R>(shared: &'a Arc<Shared<V>>, write_keys: &[W], read_keys: &[R]) -> Self
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let pass = shared.barrier.enter();
        let locks = shared.locks.rw_lock(write_keys, read_keys);
        Self {
            shared,
            locks,
            _pass: pass,
        }
    }

    #[inline]
    fn check_read(&self, key: &[u8]) {
        debug_assert!(
            self.locks.holds(self.shared.locks.stripe_of(key)),
            "key accessed without holding its lock"
        );
    }

    #[inline]
    fn check_write(&self, key: &[u8]) {
        debug_assert!(
            self.locks.holds_write(self.shared.locks.stripe_of(key)),
            "key mutated without holding its write lock"
        );
    }

    /// Applies lazy expiration. Returns true if the key was due and removed.
    fn expire_if_due(&self, key: &[u8]) -> bool {
        match self.shared.ttl.get(key) {
            Some(at) if SystemTime::now() >= at => {
                self.shared.expire_key(key);
                true
            }
            _ => false,
        }
    }

    /// Returns a clone of the entity stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.check_read(key);
        if self.expire_if_due(key) {
            return None;
        }
        self.shared.data.get(key)
    }

    /// Runs `f` against the entity stored under `key` without cloning it.
    pub fn with_value<T>(&self, key: &[u8], f: impl FnOnce(&V) -> T) -> Option<T> {
        self.check_read(key);
        if self.expire_if_due(key) {
            return None;
        }
        self.shared.data.with_value(key, f)
    }

    /// Checks whether `key` holds a live entity.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.check_read(key);
        !self.expire_if_due(key) && self.shared.data.contains_key(key)
    }

    /// Stores `value` under `key`. Returns `true` if the key was new.
    ///
    /// An existing TTL is kept; commands that reset it call
    /// [`persist`](Self::persist) as well.
    pub fn put(&self, key: Bytes, value: V) -> bool {
        self.check_write(&key);
        self.expire_if_due(&key);
        let is_new = self.shared.data.put(key.clone(), value).is_none();
        self.shared.bump_version(&key);
        is_new
    }

    /// Stores `value` only if `key` is absent. Returns `true` on insert.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> bool {
        self.check_write(&key);
        self.expire_if_due(&key);
        let inserted = self.shared.data.put_if_absent(key.clone(), value);
        if inserted {
            self.shared.bump_version(&key);
        }
        inserted
    }

    /// Overwrites `key` only if it exists. Returns `true` on overwrite.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool {
        self.check_write(key);
        if self.expire_if_due(key) {
            return false;
        }
        let updated = self.shared.data.put_if_exists(key, value);
        if updated {
            self.shared.bump_version(key);
        }
        updated
    }

    /// Mutates the entity under `key` in place. `None` if the key is absent.
    pub fn update<T>(&self, key: &[u8], f: impl FnOnce(&mut V) -> T) -> Option<T> {
        self.check_write(key);
        if self.expire_if_due(key) {
            return None;
        }
        let result = self.shared.data.update(key, f);
        if result.is_some() {
            self.shared.bump_version(key);
        }
        result
    }

    /// Deletes `key` with its TTL and cancels its pending expiration.
    ///
    /// Returns `true` if an entity was removed; removing an absent key changes
    /// nothing.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.check_write(key);
        let removed = self.shared.data.remove(key).is_some();
        let had_ttl = self.shared.ttl.remove(key).is_some();
        if had_ttl {
            self.shared.scheduler.cancel(&self.shared.task_name(key));
        }
        if removed || had_ttl {
            self.shared.bump_version(key);
        }
        removed
    }

    /// Sets the absolute expiration time of `key`.
    ///
    /// Supersedes any previous TTL and its pending callback.
    pub fn expire(&self, key: &[u8], at: SystemTime) {
        self.check_write(key);
        self.shared.ttl.put(Bytes::copy_from_slice(key), at);
        self.shared.schedule_expiration(key, at);
        self.shared.bump_version(key);
    }

    /// Removes the TTL of `key`. Returns `true` if there was one.
    pub fn persist(&self, key: &[u8]) -> bool {
        self.check_write(key);
        let had_ttl = self.shared.ttl.remove(key).is_some();
        if had_ttl {
            self.shared.scheduler.cancel(&self.shared.task_name(key));
            self.shared.bump_version(key);
        }
        had_ttl
    }

    /// The expiration time of `key`, if it has a TTL that is not yet due.
    pub fn expire_at(&self, key: &[u8]) -> Option<SystemTime> {
        self.check_read(key);
        if self.expire_if_due(key) {
            return None;
        }
        self.shared.ttl.get(key)
    }

    /// Returns true if `key` had a TTL that has passed, removing it.
    ///
    /// Keys without a TTL, or whose TTL is still in the future, are not
    /// expired.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        self.check_read(key);
        self.expire_if_due(key)
    }

    /// Current version of `key`.
    pub fn version(&self, key: &[u8]) -> u64 {
        self.check_read(key);
        self.shared.version(key)
    }

    /// Returns true if no watched key changed since the snapshot was taken.
    pub fn unchanged_since(&self, watched: &Watched) -> bool {
        watched
            .versions
            .iter()
            .all(|(key, version)| self.version(key) == *version)
    }
}

/// Exclusive access to the whole key space. Operations resume on drop.
pub struct PauseGuard<'a, V> {
    shared: &'a Arc<Shared<V>>,
    _paused: Paused<'a>,
}

impl<V> std::fmt::Debug for PauseGuard<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseGuard")
            .field("db", &self.shared.index)
            .finish()
    }
}

impl<V> PauseGuard<'_, V> {
    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored key.
    pub fn keys(&self) -> Vec<Bytes> {
        self.shared.data.keys()
    }

    /// Visits entries until `visit` returns `false`.
    pub fn for_each(&self, visit: impl FnMut(&Bytes, &V) -> bool) {
        self.shared.data.for_each(visit)
    }

    /// Drops every key and TTL. Returns the number of keys removed.
    ///
    /// Versions of the removed keys are bumped rather than reset, so watchers
    /// see the flush as a change. `FLUSHDB` reaches the mutation hook before
    /// the pause ends, ahead of any later write.
    pub fn flush(&self) -> usize {
        for key in self.shared.ttl.keys() {
            self.shared.scheduler.cancel(&self.shared.task_name(&key));
        }
        self.shared.ttl.clear();

        let keys = self.shared.data.keys();
        let removed = self.shared.data.clear();
        for key in &keys {
            self.shared.bump_version(key);
        }

        self.shared.notify(cmd_line(&[b"FLUSHDB"]));
        removed
    }

    /// Resumes normal operation. Same as dropping the guard.
    pub fn resume(self) {}
}
