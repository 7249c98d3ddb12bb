//! Striped Key Locks
//!
//! Commands that touch several keys, or read a key and then write it back,
//! need more than the dictionary's per-call atomicity. `StripedLocks` maps
//! every key onto one of a fixed number of `RwLock` stripes, so lock memory
//! stays bounded no matter how many keys are live.
//!
//! ## Deadlock Freedom
//!
//! A call resolves its keys to stripes, merges duplicates (a stripe wanted for
//! both reading and writing is taken for writing), and acquires them in
//! ascending stripe order. Every caller follows the same total order, so no
//! cycle of waiters can form. Stripes are released in descending order when the
//! [`LockGuard`] is dropped.
//!
//! Unrelated keys may share a stripe and then serialize against each other.
//! That costs throughput, never correctness.

use crate::storage::dict::hash_key;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One stripe held by a [`LockGuard`].
enum Held<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

/// A fixed array of reader-writer locks indexed by key hash.
pub struct StripedLocks {
    stripes: Box<[RwLock<()>]>,
}

impl std::fmt::Debug for StripedLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

impl StripedLocks {
    /// Creates a lock manager with `stripes` stripes (at least one).
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| RwLock::new(())).collect();
        Self { stripes }
    }

    /// Number of stripes.
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Resolves the stripe a key belongs to.
    #[inline]
    pub fn stripe_of(&self, key: &[u8]) -> usize {
        (hash_key(key) % self.stripes.len() as u64) as usize
    }

    /// Write-locks a single key.
    pub fn lock<K: AsRef<[u8]>>(&self, key: K) -> LockGuard<'_> {
        self.rw_lock(&[key], &[] as &[K])
    }

    /// Acquires write locks for `write_keys` and read locks for `read_keys`.
    ///
    /// Blocks until every stripe is held. Not reentrant: requesting a stripe
    /// the calling thread already holds through another guard may deadlock.
    pub fn rw_lock<W, R>(&self, write_keys: &[W], read_keys: &[R]) -> LockGuard<'_>
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        // stripe -> write intent; BTreeMap yields the global acquisition order
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in read_keys {
            plan.entry(self.stripe_of(key.as_ref())).or_insert(false);
        }
        for key in write_keys {
            plan.insert(self.stripe_of(key.as_ref()), true);
        }

        let mut held = Vec::with_capacity(plan.len());
        for (&stripe, &write) in &plan {
            let lock = &self.stripes[stripe];
            let guard = if write {
                Held::Write(lock.write().unwrap_or_else(PoisonError::into_inner))
            } else {
                Held::Read(lock.read().unwrap_or_else(PoisonError::into_inner))
            };
            held.push((stripe, guard));
        }

        LockGuard { held }
    }
}

/// Stripes held by one logical operation, released in reverse acquisition
/// order on drop.
pub struct LockGuard<'a> {
    held: Vec<(usize, Held<'a>)>,
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stripes: Vec<_> = self
            .held
            .iter()
            .map(|(stripe, held)| (*stripe, matches!(held, Held::Write(_))))
            .collect();
        f.debug_struct("LockGuard").field("stripes", &stripes).finish()
    }
}

impl<'a> LockGuard<'a> {
    /// Returns true if `stripe` is held in either mode.
    pub fn holds(&self, stripe: usize) -> bool {
        self.find(stripe).is_some()
    }

    /// Returns true if `stripe` is held for writing.
    pub fn holds_write(&self, stripe: usize) -> bool {
        matches!(self.find(stripe), Some(Held::Write(_)))
    }

    /// Number of distinct stripes held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Returns true if no stripe is held (both key sets were empty).
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn find(&self, stripe: usize) -> Option<&Held<'a>> {
        // held is sorted by stripe
        self.held
            .binary_search_by_key(&stripe, |(s, _)| *s)
            .ok()
            .map(|i| &self.held[i].1)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        while let Some((_, held)) = self.held.pop() {
            drop(held);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    /// Finds a key landing on a different stripe than `other`.
    fn key_on_other_stripe(locks: &StripedLocks, other: &str) -> String {
        let taken = locks.stripe_of(other.as_bytes());
        (0..)
            .map(|i| format!("key{}", i))
            .find(|k| locks.stripe_of(k.as_bytes()) != taken)
            .unwrap()
    }

    #[test]
    fn test_write_wins_over_read() {
        let locks = StripedLocks::new(16);
        let guard = locks.rw_lock(&["a", "b"], &["a", "c"]);

        assert!(guard.holds_write(locks.stripe_of(b"a")));
        assert!(guard.holds_write(locks.stripe_of(b"b")));
        assert!(guard.holds(locks.stripe_of(b"c")));
        assert!(guard.len() <= 3);
    }

    #[test]
    fn test_duplicate_keys_take_one_stripe() {
        let locks = StripedLocks::new(1);
        let guard = locks.rw_lock(&["a", "b", "a"], &["c"]);

        // everything shares stripe 0, taken once for write
        assert_eq!(guard.len(), 1);
        assert!(guard.holds_write(0));
    }

    #[test]
    fn test_empty_key_sets() {
        let locks = StripedLocks::new(8);
        let guard = locks.rw_lock::<&str, &str>(&[], &[]);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_readers_share_a_stripe() {
        let locks = Arc::new(StripedLocks::new(8));
        let _first = locks.rw_lock::<&str, _>(&[], &["k"]);

        let other = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let guard = other.rw_lock::<&str, _>(&[], &["k"]);
            guard.len()
        });

        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_writer_excludes_writer() {
        let locks = Arc::new(StripedLocks::new(8));
        let done = Arc::new(AtomicBool::new(false));

        let guard = locks.lock("k");

        let (other, flag) = (Arc::clone(&locks), Arc::clone(&done));
        let handle = thread::spawn(move || {
            let _guard = other.lock("k");
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disjoint_stripes_do_not_block() {
        let locks = Arc::new(StripedLocks::new(64));
        let other_key = key_on_other_stripe(&locks, "a");

        let _held = locks.lock("a");

        let other = Arc::clone(&locks);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _guard = other.lock(other_key.as_str());
            tx.send(()).unwrap();
        });

        // the second writer must finish while "a" is still held
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_overlapping_random_sets_make_progress() {
        const THREADS: u64 = 8;
        const ROUNDS: usize = 500;

        let locks = Arc::new(StripedLocks::new(16));
        let completed = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();

        for seed in 0..THREADS {
            let (locks, completed, tx) = (Arc::clone(&locks), Arc::clone(&completed), tx.clone());
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                for _ in 0..ROUNDS {
                    let pick = |rng: &mut rand::rngs::StdRng| {
                        let n = rng.gen_range(0..4);
                        (0..n)
                            .map(|_| format!("k{}", rng.gen_range(0..32)))
                            .collect::<Vec<_>>()
                    };
                    let writes = pick(&mut rng);
                    let reads = pick(&mut rng);
                    let _guard = locks.rw_lock(writes.as_slice(), reads.as_slice());
                    completed.fetch_add(1, Ordering::Relaxed);
                }
                tx.send(()).unwrap();
            });
        }
        drop(tx);

        for _ in 0..THREADS {
            rx.recv_timeout(Duration::from_secs(20))
                .expect("lock hammer stalled: possible deadlock");
        }
        assert_eq!(completed.load(Ordering::Relaxed), THREADS * ROUNDS as u64);
    }
}
