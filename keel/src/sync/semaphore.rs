//! # Semaphore.
//!
//! A **semaphore** regulates concurrent access to a finite set of resources.
//! It maintains a count of available "permits": [`Semaphore::wait`] (P)
//! takes one, blocking the caller while none is available, and
//! [`Semaphore::signal`] (V) returns one, waking the longest waiting thread.
//!
//! A semaphore initialized with zero permits serves as an event: one thread
//! waits on it until another signals that the event occurred.
//!
//! ```
//! use keel::{SystemConfiguration, sync::Semaphore, thread::ThreadBuilder};
//! use std::sync::Arc;
//!
//! let config = SystemConfiguration::builder().build().unwrap();
//! keel::boot(config, |scheduler| {
//!     let event = Arc::new(Semaphore::new(scheduler, 0));
//!     let e = event.clone();
//!     let handle = ThreadBuilder::new("signaler")
//!         .spawn(scheduler, move || e.signal())
//!         .unwrap();
//!     event.wait();
//!     handle.join();
//!     assert_eq!(event.value(), 0);
//! })
//! .unwrap();
//! ```
//!
//! Woken waiters are readied in FIFO order, but a woken waiter re-checks the
//! count when it runs again: a thread that arrives in between may take the
//! permit first, in which case the waiter goes back to sleep.

use super::SpinLock;
use crate::thread::{ParkHandle, Scheduler};
use bedrock::interrupt::InterruptGuard;
use std::{collections::VecDeque, sync::Arc};

struct SemaphoreState {
    value: usize,
    waiters: VecDeque<ParkHandle>,
}

/// Counting semaphore.
pub struct Semaphore {
    scheduler: Arc<Scheduler>,
    inner: SpinLock<SemaphoreState>,
}

impl Semaphore {
    /// Creates a new semaphore initialized with `permits` permits.
    pub fn new(scheduler: &Arc<Scheduler>, permits: usize) -> Self {
        Self {
            scheduler: scheduler.clone(),
            inner: SpinLock::new(SemaphoreState {
                value: permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    #[track_caller]
    pub fn wait(&self) {
        let _irq = InterruptGuard::new();
        let mut inner = self.inner.lock();
        while inner.value == 0 {
            inner.waiters.push_back(self.scheduler.park_handle());
            self.scheduler.sleep_thread(inner);
            inner = self.inner.lock();
        }
        inner.value -= 1;
        inner.unlock();
    }

    /// Releases a permit back to the semaphore, and readies the longest
    /// waiting thread, if any.
    ///
    /// Never blocks, so it may be called from an interrupt handler.
    pub fn signal(&self) {
        let _irq = InterruptGuard::new();
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiters.pop_front() {
            trace!(SYNC, "semaphore: waking `{}`", waiter.thread().name());
            waiter.unpark();
        }
        inner.value += 1;
        inner.unlock();
    }

    /// Number of available permits.
    pub fn value(&self) -> usize {
        let _irq = InterruptGuard::new();
        let inner = self.inner.lock();
        let value = inner.value;
        inner.unlock();
        value
    }
}
