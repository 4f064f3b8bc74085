use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RANK: AtomicU64 = AtomicU64::new(1);

/// Reader/writer asymmetric lock with a globally-unique rank.
///
/// Readers overlap; a writer excludes everyone. The rank is assigned at
/// construction from a process-wide counter and never changes, which gives
/// every set of locks a canonical acquisition order: [`freeze`] sorts by rank
/// before acquiring, so concurrent bulk acquisitions of the same locks in any
/// argument order cannot deadlock.
pub struct AsymLock<T> {
    rank: u64,
    inner: RwLock<T>,
}

impl<T> AsymLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            rank: NEXT_RANK.fetch_add(1, Ordering::Relaxed),
            inner: RwLock::new(value),
        }
    }

    /// Shared acquisition.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Shared acquisition that will not deadlock when the calling thread
    /// already holds a shared guard on this lock, even with a writer parked.
    /// Propagation uses this so cyclic graphs can re-enter a node.
    #[inline]
    pub fn read_recursive(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read_recursive()
    }

    /// Exclusive acquisition.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    #[inline]
    pub fn rank(&self) -> u64 {
        self.rank
    }
}

/// Guards held by a bulk acquisition. Released LIFO on drop.
pub struct Freeze<'a, T> {
    shared: Vec<RwLockReadGuard<'a, T>>,
    exclusive: Vec<RwLockWriteGuard<'a, T>>,
}

impl<'a, T> Freeze<'a, T> {
    pub fn len(&self) -> usize {
        self.shared.len() + self.exclusive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Freeze<'_, T> {
    fn drop(&mut self) {
        // reverse of acquisition order
        while self.exclusive.pop().is_some() {}
        while self.shared.pop().is_some() {}
    }
}

/// Atomically acquire a set of locks, shared or exclusive.
///
/// Duplicate references to the same lock are acquired once. Blocks until all
/// locks are held; cancellation of a blocked acquisition is not supported.
pub fn freeze<'a, T>(exclusive: bool, locks: &[&'a AsymLock<T>]) -> Freeze<'a, T> {
    let mut ordered: Vec<&'a AsymLock<T>> = locks.to_vec();
    ordered.sort_by_key(|l| l.rank);
    ordered.dedup_by_key(|l| l.rank);

    let mut frozen = Freeze {
        shared: Vec::new(),
        exclusive: Vec::new(),
    };
    for lock in ordered {
        if exclusive {
            frozen.exclusive.push(lock.write());
        } else {
            frozen.shared.push(lock.read());
        }
    }
    frozen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ranks_are_unique_and_monotonic() {
        let a = AsymLock::new(());
        let b = AsymLock::new(());
        assert!(b.rank() > a.rank());
    }

    #[test]
    fn readers_overlap() {
        let lock = AsymLock::new(5u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 10);
    }

    #[test]
    fn freeze_dedups_duplicates() {
        let lock = AsymLock::new(());
        let frozen = freeze(true, &[&lock, &lock, &lock]);
        assert_eq!(frozen.len(), 1);
    }

    // Ten threads bulk-acquire the same ten locks in rotated orders while a
    // striped half are under contention from single-lock writers. Deadlock
    // here would hang the test harness.
    #[test]
    fn concurrent_freeze_permutations_complete() {
        let locks: Arc<Vec<AsymLock<u64>>> = Arc::new((0..10).map(AsymLock::new).collect());

        let mut stripers = Vec::new();
        for i in (0..10).step_by(2) {
            let locks = locks.clone();
            stripers.push(thread::spawn(move || {
                for _ in 0..50 {
                    let mut g = locks[i].write();
                    *g += 1;
                    drop(g);
                    thread::sleep(Duration::from_micros(50));
                }
            }));
        }

        let mut freezers = Vec::new();
        for rot in 0..10 {
            let locks = locks.clone();
            freezers.push(thread::spawn(move || {
                for _ in 0..50 {
                    let refs: Vec<&AsymLock<u64>> = locks
                        .iter()
                        .cycle()
                        .skip(rot)
                        .take(10)
                        .collect();
                    let frozen = freeze(true, &refs);
                    assert_eq!(frozen.len(), 10);
                }
            }));
        }

        for h in stripers.into_iter().chain(freezers) {
            h.join().expect("freeze thread panicked");
        }
    }
}
