//! Per-resource reader/writer locks
//!
//! One `RwLock` per resource key, created on first use. Guards own an `Arc`
//! to their lock, so a guard stays valid even after the registry is shut
//! down and its map cleared.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock manager closed")]
    Closed,
}

type KeyLock = Arc<RwLock<()>>;

/// Registry of per-key locks.
///
/// Lock objects are never evicted while the registry is open; the map grows
/// with the number of distinct keys ever referenced.
#[derive(Default)]
pub struct ResourceLocks {
    locks: RwLock<HashMap<String, KeyLock>>,
    closed: AtomicBool,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock object for `key`, creating it if this is the first reference.
    fn lock_for(&self, key: &str) -> Result<KeyLock, LockError> {
        if self.is_closed() {
            return Err(LockError::Closed);
        }
        if let Some(lock) = self.locks.read().get(key) {
            return Ok(Arc::clone(lock));
        }
        let mut locks = self.locks.write();
        // Re-checked under the write lock: a concurrent first reference may have won
        if self.is_closed() {
            return Err(LockError::Closed);
        }
        let lock = locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())));
        Ok(Arc::clone(lock))
    }

    /// Block until `key` is held in `mode`.
    ///
    /// Fails fast once the registry is closed. A waiter that is granted the
    /// lock after shutdown releases it again and reports `Closed`.
    pub fn acquire(&self, key: &str, mode: LockMode) -> Result<ResourceGuard, LockError> {
        let lock = self.lock_for(key)?;
        let held = match mode {
            LockMode::Read => Held::Read(lock.read_arc()),
            LockMode::Write => Held::Write(lock.write_arc()),
        };
        let guard = ResourceGuard {
            key: key.to_string(),
            mode,
            _held: held,
        };
        if self.is_closed() {
            drop(guard);
            return Err(LockError::Closed);
        }
        tracing::trace!(key, ?mode, "lock acquired");
        Ok(guard)
    }

    /// Non-blocking variant of [`acquire`](Self::acquire); `Ok(None)` if the
    /// key is currently held in a conflicting mode.
    pub fn try_acquire(
        &self,
        key: &str,
        mode: LockMode,
    ) -> Result<Option<ResourceGuard>, LockError> {
        let lock = self.lock_for(key)?;
        let held = match mode {
            LockMode::Read => lock.try_read_arc().map(Held::Read),
            LockMode::Write => lock.try_write_arc().map(Held::Write),
        };
        Ok(held.map(|held| ResourceGuard {
            key: key.to_string(),
            mode,
            _held: held,
        }))
    }

    /// Close the registry: later `acquire` calls fail with `Closed` and the
    /// registry drops its lock objects. Guards already handed out release
    /// normally when their holders finish.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut locks = self.locks.write();
            let n = locks.len();
            locks.clear();
            n
        };
        tracing::debug!(locks = dropped, "resource lock registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of distinct keys with a registered lock
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Guards are only ever held for their Drop
#[allow(dead_code)]
enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Proof that a resource key is held; the lock is released on drop.
pub struct ResourceGuard {
    key: String,
    mode: LockMode,
    _held: Held,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        tracing::trace!(key = %self.key, mode = ?self.mode, "lock released");
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_a_key() {
        let locks = ResourceLocks::new();
        let a = locks.acquire("f", LockMode::Read).unwrap();
        let b = locks.try_acquire("f", LockMode::Read).unwrap();
        assert!(b.is_some());
        drop(a);
    }

    #[test]
    fn writer_excludes_readers_and_writers() {
        let locks = ResourceLocks::new();
        let w = locks.acquire("f", LockMode::Write).unwrap();
        assert!(locks.try_acquire("f", LockMode::Read).unwrap().is_none());
        assert!(locks.try_acquire("f", LockMode::Write).unwrap().is_none());
        // other keys are independent
        assert!(locks.try_acquire("g", LockMode::Write).unwrap().is_some());
        w.release();
        assert!(locks.try_acquire("f", LockMode::Write).unwrap().is_some());
    }

    #[test]
    fn reader_blocks_writer() {
        let locks = ResourceLocks::new();
        let r = locks.acquire("f", LockMode::Read).unwrap();
        assert!(locks.try_acquire("f", LockMode::Write).unwrap().is_none());
        drop(r);
        assert!(locks.try_acquire("f", LockMode::Write).unwrap().is_some());
    }

    #[test]
    fn concurrent_first_reference_creates_one_lock() {
        let locks = Arc::new(ResourceLocks::new());
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.lock_for("same").unwrap()
                })
            })
            .collect();
        let got: Vec<KeyLock> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(locks.len(), 1);
        for lock in &got[1..] {
            assert!(Arc::ptr_eq(&got[0], lock));
        }
    }

    #[test]
    fn writers_never_overlap() {
        let locks = Arc::new(ResourceLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let readers_inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let readers_inside = Arc::clone(&readers_inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            let _g = locks.acquire("k", LockMode::Write).unwrap();
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers_inside.load(Ordering::SeqCst), 0);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _g = locks.acquire("k", LockMode::Read).unwrap();
                            readers_inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(inside.load(Ordering::SeqCst), 0);
                            thread::yield_now();
                            readers_inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn shutdown_rejects_new_acquires() {
        let locks = ResourceLocks::new();
        let held = locks.acquire("f", LockMode::Read).unwrap();
        locks.shutdown();
        assert!(locks.is_closed());
        assert!(locks.is_empty());
        assert_eq!(locks.acquire("f", LockMode::Read).unwrap_err(), LockError::Closed);
        assert_eq!(locks.acquire("new", LockMode::Write).unwrap_err(), LockError::Closed);
        // existing holders still release cleanly
        held.release();
        locks.shutdown();
    }

    #[test]
    fn waiter_granted_after_shutdown_gets_closed() {
        let locks = Arc::new(ResourceLocks::new());
        let writer = locks.acquire("f", LockMode::Write).unwrap();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire("f", LockMode::Read).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        locks.shutdown();
        drop(writer);
        assert_eq!(waiter.join().unwrap(), Err(LockError::Closed));
    }
}
