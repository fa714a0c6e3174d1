//! Mutual exclusion lock.

use super::Semaphore;
use crate::thread::{Scheduler, current, current_or_panic};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

const NO_OWNER: u64 = 0;

/// A sleeping mutual exclusion lock with an owner.
///
/// Unlike a [`SpinLock`](super::SpinLock), a thread waiting for a `Lock`
/// blocks and gives its CPU away. Only the thread that acquired the lock may
/// release it, and the lock is not recursive.
pub struct Lock {
    sema: Semaphore,
    owner: AtomicU64,
}

impl Lock {
    /// Creates a free lock.
    pub fn new(scheduler: &Arc<Scheduler>) -> Self {
        Self {
            sema: Semaphore::new(scheduler, 1),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Acquires the lock, blocking until it is free.
    #[track_caller]
    pub fn acquire(&self) {
        let me = current_or_panic("Lock::acquire");
        assert_ne!(
            self.owner.load(Ordering::SeqCst),
            me.tid(),
            "Lock::acquire: thread `{}` already holds the lock",
            me.name()
        );
        self.sema.wait();
        self.owner.store(me.tid(), Ordering::SeqCst);
    }

    /// Releases the lock. Releasing a lock the caller does not hold is
    /// fatal.
    #[track_caller]
    pub fn release(&self) {
        let me = current_or_panic("Lock::release");
        assert!(
            self.owner.load(Ordering::SeqCst) == me.tid(),
            "Lock::release: thread `{}` does not hold the lock",
            me.name()
        );
        self.owner.store(NO_OWNER, Ordering::SeqCst);
        self.sema.signal();
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        current().is_some_and(|me| self.owner.load(Ordering::SeqCst) == me.tid())
    }
}
