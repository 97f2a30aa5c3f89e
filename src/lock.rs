//! Concurrency hooks
use core::{fmt, mem};

use crate::Init;

/// A pair of hooks bracketing every access to a [`Heap`](crate::Heap)'s free
/// list.
///
/// Every call to [`lock`](Self::lock) is followed by exactly one call to
/// [`unlock`](Self::unlock) from the same thread, and the heap never calls
/// `lock` again before that. Implementations don't need to support
/// recursion.
pub trait MallocLock {
    /// Enter the critical section.
    fn lock(&self);

    /// Leave the critical section.
    fn unlock(&self);
}

/// Marks a [`MallocLock`] that really provides mutual exclusion between
/// threads.
///
/// # Safety
///
/// While one thread is between `lock` and `unlock`, no other thread may
/// return from `lock`.
pub unsafe trait ExclusiveLock: MallocLock {}

impl<T: MallocLock + ?Sized> MallocLock for &T {
    #[inline]
    fn lock(&self) {
        (**self).lock()
    }

    #[inline]
    fn unlock(&self) {
        (**self).unlock()
    }
}

unsafe impl<T: ExclusiveLock + ?Sized> ExclusiveLock for &T {}

/// A [`MallocLock`] that does nothing. Suitable for single-threaded
/// environments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoLock;

impl MallocLock for NoLock {
    #[inline]
    fn lock(&self) {}

    #[inline]
    fn unlock(&self) {}
}

impl Init for NoLock {
    const INIT: Self = Self;
}

impl const_default1::ConstDefault for NoLock {
    const DEFAULT: Self = Self;
}

/// A spinlock-based [`ExclusiveLock`].
///
/// The lock isn't fair, and a thread waiting for it burns CPU cycles. It's
/// meant for short critical sections on systems without a scheduler-aware
/// primitive.
pub struct SpinLock {
    mutex: spin::mutex::SpinMutex<()>,
}

impl SpinLock {
    /// Construct an unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            mutex: spin::mutex::SpinMutex::new(()),
        }
    }

    /// Check whether the lock is currently held. The result may be stale by
    /// the time it's returned.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }
}

impl MallocLock for SpinLock {
    #[inline]
    fn lock(&self) {
        // The guard would unlock on drop, but the critical section ends in
        // `unlock` instead
        mem::forget(self.mutex.lock());
    }

    #[inline]
    fn unlock(&self) {
        // Safety: `MallocLock`'s contract guarantees a preceding `lock` on
        //         this thread
        unsafe { self.mutex.force_unlock() };
    }
}

unsafe impl ExclusiveLock for SpinLock {}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Init for SpinLock {
    const INIT: Self = Self::new();
}

impl const_default1::ConstDefault for SpinLock {
    const DEFAULT: Self = Self::new();
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_lock_round_trip() {
        let lock = SpinLock::INIT;
        assert!(!lock.is_locked());

        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());

        // Reacquirable after release, here through the impl for `&T`
        fn cycle<L: MallocLock>(lock: L, is_locked: impl Fn() -> bool) {
            lock.lock();
            assert!(is_locked());
            lock.unlock();
            assert!(!is_locked());
        }
        cycle(&lock, || lock.is_locked());
    }

    #[test]
    fn spin_lock_excludes() {
        use std::{
            sync::{
                atomic::{AtomicUsize, Ordering},
                Arc,
            },
            thread,
        };

        let lock = Arc::new(SpinLock::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let workers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        inside.fetch_sub(1, Ordering::Relaxed);
                        lock.unlock();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn no_lock_is_a_no_op() {
        let lock = NoLock::INIT;
        lock.lock();
        lock.lock();
        lock.unlock();
    }
}
