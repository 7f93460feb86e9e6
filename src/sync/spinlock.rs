// src/sync/spinlock.rs
//! Trylock-capable spin lock
//!
//! Handle headers are protected by this lock. Worker threads never block on
//! it: they try the lock and make progress on their own pending data
//! requests between attempts, so a copy they are responsible for can
//! complete and release the header.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Attempts made with progress before falling back to a blocking acquire
pub const SPIN_MAX_TRY: usize = 10;

/// A spin lock protecting a value of type `T`
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `locked`
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Spin until the lock is acquired
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Spin until the lock is acquired, calling `progress` between attempts
    pub fn lock_with_progress<F: FnMut()>(&self, mut progress: F) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            progress();
        }
    }

    /// Try `max_tries` times with progress, then block
    pub fn lock_bounded<F: FnMut()>(&self, max_tries: usize, mut progress: F) -> SpinLockGuard<'_, T> {
        for _ in 0..max_tries {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            progress();
        }
        self.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinLock").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard releasing the lock on drop
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = SpinLock::new(5);
        let guard = lock.try_lock().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_concurrent_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_lock_with_progress_runs_progress() {
        let lock = Arc::new(SpinLock::new(()));
        let guard = lock.lock();
        let other = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            let mut calls = 0u32;
            let _guard = other.lock_with_progress(|| {
                calls += 1;
                std::thread::yield_now();
            });
            calls
        });
        thread::sleep(std::time::Duration::from_millis(5));
        drop(guard);
        assert!(waiter.join().unwrap() > 0);
    }

    #[test]
    fn test_lock_bounded_falls_back_to_blocking() {
        let lock = SpinLock::new(1);
        let mut calls = 0;
        let guard = lock.lock_bounded(SPIN_MAX_TRY, || calls += 1);
        assert_eq!(*guard, 1);
        assert_eq!(calls, 0);
    }
}
