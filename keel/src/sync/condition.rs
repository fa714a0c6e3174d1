//! # Condition Variable.
//!
//! A **condition variable** allows a thread to block until a certain
//! condition over shared data holds, without consuming CPU time. It is always
//! used together with the [`Lock`] that guards that data, which it is bound to
//! at creation.
//!
//! Conditions have Mesa semantics: [`Condition::signal`] only makes a waiter
//! ready, and by the time it reacquires the lock the condition may no longer
//! hold. Waiters therefore re-check their condition in a loop:
//!
//! ```text
//! lock.acquire();
//! while !ready() {
//!     condition.wait();
//! }
//! ...
//! lock.release();
//! ```

use super::{Lock, SpinLock};
use crate::thread::{ParkHandle, Scheduler, current, current_or_panic};
use bedrock::interrupt::InterruptGuard;
use std::{collections::VecDeque, sync::Arc};

/// A Mesa-style condition variable.
pub struct Condition {
    scheduler: Arc<Scheduler>,
    lock: Arc<Lock>,
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

impl Condition {
    /// Creates a condition variable bound to `lock`.
    pub fn new(scheduler: &Arc<Scheduler>, lock: Arc<Lock>) -> Self {
        Self {
            scheduler: scheduler.clone(),
            lock,
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// The lock this condition variable is bound to.
    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    /// Releases the lock, blocks until signaled, then reacquires the lock.
    ///
    /// The caller must hold the lock. Joining the wait queue and releasing
    /// the lock happen atomically with respect to signalers.
    #[track_caller]
    pub fn wait(&self) {
        let me = current_or_panic("Condition::wait");
        assert!(
            self.lock.is_held_by_current_thread(),
            "Condition::wait: thread `{}` does not hold the lock",
            me.name()
        );
        let irq = InterruptGuard::new();
        let mut waiters = self.waiters.lock();
        waiters.push_back(self.scheduler.park_handle());
        self.lock.release();
        self.scheduler.sleep_thread(waiters);
        drop(irq);
        self.lock.acquire();
    }

    /// Wakes up the longest waiting thread, if any.
    ///
    /// The caller must hold the lock, unless it runs in interrupt context.
    #[track_caller]
    pub fn signal(&self) {
        self.assert_may_signal("Condition::signal");
        let _irq = InterruptGuard::new();
        let mut waiters = self.waiters.lock();
        let waiter = waiters.pop_front();
        waiters.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
        }
    }

    /// Wakes up all waiting threads, in the order they started waiting.
    ///
    /// The caller must hold the lock, unless it runs in interrupt context.
    #[track_caller]
    pub fn broadcast(&self) {
        self.assert_may_signal("Condition::broadcast");
        let _irq = InterruptGuard::new();
        let mut waiters = self.waiters.lock();
        let all = std::mem::take(&mut *waiters);
        waiters.unlock();
        debug!(SYNC, "condition: broadcast to {} waiter(s)", all.len());
        for waiter in all {
            waiter.unpark();
        }
    }

    #[track_caller]
    fn assert_may_signal(&self, op: &str) {
        if let Some(me) = current() {
            assert!(
                self.lock.is_held_by_current_thread(),
                "{op}: thread `{}` does not hold the lock",
                me.name()
            );
        }
    }
}
