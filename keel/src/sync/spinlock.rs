//! SMP-supported spinlock.
//!
//! The implementing unicore spinlock is simple; it just requires preventing
//! thread preemption while holding a lock. By disabling interrupts on the
//! lock-holding CPU, other threads cannot access the shared resource as they
//! can't be scheduled. On a single-CPU machine the lock therefore does not
//! touch its cell at all.
//!
//! On a multiprocessor, disabling interrupts is not sufficient: threads on
//! other CPUs run concurrently. To acquire a lock there, a CPU atomically
//! tests and sets a shared cell, and spins while the cell was already set.
//!
//! Interrupts must be disabled before taking any spinlock and restored only
//! after releasing it. Taking a spinlock with interrupts enabled is a fatal
//! error, as is dropping a guard without releasing it.

use bedrock::{
    interrupt::{self, InterruptState},
    tas::TasCell,
};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    panic::Location,
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// This spinlock will spin the threads waiting for the lock to become
/// available. Each spinlock has a type parameter which represents the data
/// that it is protecting. The data can only be accessed through the guards
/// returned from [`lock`] and [`try_lock`], which guarantees that the data is
/// only ever accessed when the spinlock is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use keel::{SystemConfiguration, interrupt::InterruptGuard, sync::SpinLock, thread::ThreadBuilder};
/// use std::sync::Arc;
///
/// let data = Arc::new(SpinLock::new(0));
/// let counter = data.clone();
/// let config = SystemConfiguration::builder().cpus(2).build().unwrap();
/// keel::boot(config, move |scheduler| {
///     let handles: Vec<_> = (0..4)
///         .map(|_| {
///             let data = counter.clone();
///             ThreadBuilder::new("work")
///                 .spawn(scheduler, move || {
///                     let _irq = InterruptGuard::new();
///                     let mut guard = data.lock();
///                     *guard += 1;
///                     // the lock must be "explicitly" unlocked.
///                     guard.unlock();
///                 })
///                 .unwrap()
///         })
///         .collect();
///     handles.into_iter().for_each(|h| h.join());
/// })
/// .unwrap();
/// let guard = data.lock();
/// assert_eq!(*guard, 4);
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    cell: TasCell,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            cell: TasCell::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is able to do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. A
    /// guard is returned to allow scoped access of the lock. When the guard
    /// goes out of scope without [`SpinLockGuard::unlock`], panic occurs.
    ///
    /// Locking a spinlock in the thread which already holds it never
    /// returns.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let caller = Location::caller();
        assert_eq!(
            interrupt::level(),
            InterruptState::Off,
            "spinlock taken with interrupts enabled at {caller}"
        );
        let held = !bedrock::is_uniprocessor();
        if held {
            let backoff = Backoff::new();
            while self.cell.test_and_set() {
                backoff.snooze();
                bedrock::halt_point();
            }
        }
        SpinLockGuard {
            caller,
            lock: self,
            held,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then [`Err`] is
    /// returned. Otherwise, a guard is returned. This function does not
    /// spin.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked,
    /// then this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let caller = Location::caller();
        assert_eq!(
            interrupt::level(),
            InterruptState::Off,
            "spinlock taken with interrupts enabled at {caller}"
        );
        let held = !bedrock::is_uniprocessor();
        if held && self.cell.test_and_set() {
            return Err(WouldBlock);
        }
        Ok(SpinLockGuard {
            caller,
            lock: self,
            held,
            _not_send: PhantomData,
        })
    }

    /// Whether the lock is held. The answer may be stale by the time it is
    /// read.
    pub fn is_locked(&self) -> bool {
        self.cell.is_set()
    }
}

impl<T: Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// An implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static Location<'static>,
    lock: &'a SpinLock<T>,
    held: bool,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    ///
    /// As the guard does **not** automatically release the lock on drop,
    /// the caller must explicitly invoke [`unlock`] to mark the lock
    /// as available again.
    ///
    /// [`unlock`]: Self::unlock
    pub fn unlock(self) {
        if self.held {
            self.lock.cell.clear();
        }
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if self.held {
                self.lock.cell.clear();
            }
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_thread_locks_for_real() {
        let lock = SpinLock::new(vec![1, 2]);
        let mut guard = lock.lock();
        guard.push(3);
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_err());
        guard.unlock();
        assert!(!lock.is_locked());

        let guard = lock.try_lock().unwrap();
        assert_eq!(*guard, [1, 2, 3]);
        guard.unlock();
        assert_eq!(lock.into_inner(), [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "must be explicitly called")]
    fn dropping_a_held_guard_panics() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
    }
}
