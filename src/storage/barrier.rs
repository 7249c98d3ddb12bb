//! Stop-the-World Pause Barrier
//!
//! Whole-database operations such as `FLUSHDB` must see the key space with no
//! per-key command half way through. Instead of a global lock on every command,
//! each per-key operation holds a cheap [`Pass`] while it runs, and a global
//! operation takes a [`Paused`] guard:
//!
//! 1. `pause()` marks the barrier paused, so new `enter()` calls block.
//! 2. It then waits for every outstanding `Pass` to drop.
//! 3. While the `Paused` guard lives, no pass can be issued.
//! 4. Dropping the guard wakes every blocked entrant.
//!
//! Passes are not reentrant. A thread holding a `Pass` must not call `enter()`
//! or `pause()` on the same barrier, or it will wait on itself.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct BarrierState {
    /// A global operation owns (or is draining toward) the key space.
    paused: bool,
    /// Passes currently issued.
    active: usize,
}

/// Admission control between per-key operations and global pauses.
#[derive(Debug, Default)]
pub struct PauseBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

impl PauseBarrier {
    /// Creates an open barrier.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the barrier is open, then registers one in-flight operation.
    pub fn enter(&self) -> Pass<'_> {
        let mut state = self
            .changed
            .wait_while(self.state(), |s| s.paused)
            .unwrap_or_else(PoisonError::into_inner);
        state.active += 1;
        Pass { barrier: self }
    }

    /// Stops new operations and waits for in-flight ones to finish.
    ///
    /// A second concurrent `pause()` queues behind the first.
    pub fn pause(&self) -> Paused<'_> {
        let mut state = self
            .changed
            .wait_while(self.state(), |s| s.paused)
            .unwrap_or_else(PoisonError::into_inner);
        state.paused = true;

        let _drained = self
            .changed
            .wait_while(state, |s| s.active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        Paused { barrier: self }
    }

    /// Returns true while a global operation holds the barrier.
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Number of passes currently issued.
    pub fn in_flight(&self) -> usize {
        self.state().active
    }
}

/// Proof that an operation passed the barrier. Dropping it ends the operation.
#[derive(Debug)]
#[must_use = "the operation ends as soon as the pass is dropped"]
pub struct Pass<'a> {
    barrier: &'a PauseBarrier,
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state();
        state.active -= 1;
        if state.active == 0 {
            self.barrier.changed.notify_all();
        }
    }
}

/// Exclusive hold on the barrier. Operations resume when it is dropped.
#[derive(Debug)]
#[must_use = "the pause ends as soon as the guard is dropped"]
pub struct Paused<'a> {
    barrier: &'a PauseBarrier,
}

impl Paused<'_> {
    /// Resumes normal operation. Same as dropping the guard.
    pub fn resume(self) {}
}

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        self.barrier.state().paused = false;
        self.barrier.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_passes_do_not_block_each_other() {
        let barrier = PauseBarrier::new();
        let a = barrier.enter();
        let b = barrier.enter();
        assert_eq!(barrier.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn test_pause_blocks_new_entrants_until_resume() {
        let barrier = Arc::new(PauseBarrier::new());
        let entered = Arc::new(AtomicBool::new(false));

        let paused = barrier.pause();
        assert!(barrier.is_paused());

        let (b, flag) = (Arc::clone(&barrier), Arc::clone(&entered));
        let handle = thread::spawn(move || {
            let _pass = b.enter();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        paused.resume();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!barrier.is_paused());
    }

    #[test]
    fn test_pause_waits_for_in_flight_pass() {
        let barrier = Arc::new(PauseBarrier::new());
        let pass = barrier.enter();

        let b = Arc::clone(&barrier);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _paused = b.pause();
            tx.send(()).unwrap();
        });

        // the pauser is stuck behind our pass
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(pass);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_pauses_serialize() {
        let barrier = Arc::new(PauseBarrier::new());
        let first = barrier.pause();

        let b = Arc::clone(&barrier);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _second = b.pause();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(first);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }
}
