//! Kernel Spinlocks
//!
//! Thin wrapper around `spin::Mutex` that bounds every acquisition with a
//! deadlock-detection counter. The VMM never sleeps, so a lock that stays
//! contended past the bound indicates a lock ordering violation, which is a
//! programming error and not a condition worth retrying.

use spin::mutex::{Mutex, MutexGuard};

/// Number of failed acquisition attempts tolerated before the kernel gives
/// up and reports a deadlock.
const DEADLOCK_SPINS: usize = 100_000_000;

/// A spinlock with bounded busy-wait.
pub struct Spinlock<T> {
    inner: Mutex<T>,
}

/// Guard type returned by [`Spinlock::lock`].
pub type SpinlockGuard<'a, T> = MutexGuard<'a, T>;

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, busy-waiting until it is available.
    ///
    /// # Panics
    /// Panics once the deadlock-detection counter is exceeded.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        for _ in 0..DEADLOCK_SPINS {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            core::hint::spin_loop();
        }
        panic!("spinlock: deadlock detected (lock held past spin bound)");
    }

    /// Acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.inner.try_lock()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lock = Spinlock::new(7usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
