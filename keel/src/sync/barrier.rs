//! # Cyclic barrier.
//!
//! A [`CyclicBarrier`] lets a fixed number of parties wait for each other.
//! Each call to [`CyclicBarrier::wait`] blocks until the last party arrives.
//! The last party runs the barrier action, if any, and releases everybody.
//! The barrier then starts a new *generation* and can be used again.
//!
//! [`CyclicBarrier::reset`] breaks the current generation: the parties
//! waiting in it return [`KernelError::BrokenBarrier`].

use super::{Condition, Lock, SpinLock};
use crate::{KernelError, thread::Scheduler};
use bedrock::interrupt::InterruptGuard;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// The action run by the last party to arrive.
pub type BarrierAction = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Generation {
    broken: AtomicBool,
}

struct BarrierState {
    remaining: usize,
    generation: Arc<Generation>,
}

/// A reusable rendezvous point for a fixed number of threads.
pub struct CyclicBarrier {
    lock: Arc<Lock>,
    trip: Condition,
    parties: usize,
    action: Option<BarrierAction>,
    state: SpinLock<BarrierState>,
}

impl CyclicBarrier {
    /// Creates a barrier for `parties` threads.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] if `parties` is zero.
    pub fn new(
        scheduler: &Arc<Scheduler>,
        parties: usize,
        action: Option<BarrierAction>,
    ) -> Result<Self, KernelError> {
        if parties == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let lock = Arc::new(Lock::new(scheduler));
        Ok(Self {
            trip: Condition::new(scheduler, lock.clone()),
            lock,
            parties,
            action,
            state: SpinLock::new(BarrierState {
                remaining: parties,
                generation: Arc::default(),
            }),
        })
    }

    /// Number of parties required to trip the barrier.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently waiting.
    pub fn number_waiting(&self) -> usize {
        self.lock.acquire();
        let remaining = self.with_state(|st| st.remaining);
        self.lock.release();
        self.parties - remaining
    }

    /// Waits until all parties have called `wait` on this barrier.
    ///
    /// Returns the arrival index of the caller: `parties - 1` for the first
    /// party to arrive and `0` for the last, which also runs the barrier
    /// action before the others are released.
    ///
    /// # Errors
    ///
    /// [`KernelError::BrokenBarrier`] if the barrier is reset while the
    /// caller waits.
    pub fn wait(&self) -> Result<usize, KernelError> {
        self.lock.acquire();
        let (generation, index) = self.with_state(|st| {
            st.remaining -= 1;
            (st.generation.clone(), st.remaining)
        });

        if index == 0 {
            if let Some(action) = &self.action {
                action();
            }
            self.next_generation();
            self.lock.release();
            return Ok(0);
        }

        loop {
            self.trip.wait();
            let tripped = self.with_state(|st| !Arc::ptr_eq(&st.generation, &generation));
            if generation.broken.load(Ordering::SeqCst) {
                self.lock.release();
                return Err(KernelError::BrokenBarrier);
            }
            if tripped {
                self.lock.release();
                return Ok(index);
            }
        }
    }

    /// Breaks the current generation and starts a new one.
    ///
    /// Parties waiting in the broken generation return
    /// [`KernelError::BrokenBarrier`].
    pub fn reset(&self) {
        self.lock.acquire();
        let waiting = self.with_state(|st| {
            st.generation.broken.store(true, Ordering::SeqCst);
            self.parties - st.remaining
        });
        if waiting > 0 {
            debug!(SYNC, "barrier: breaking {waiting} waiter(s)");
        }
        self.next_generation();
        self.lock.release();
    }

    /// Wakes the parties of the current generation and starts a new one.
    /// Must be called with the lock held.
    fn next_generation(&self) {
        self.with_state(|st| {
            st.remaining = self.parties;
            st.generation = Arc::default();
        });
        self.trip.broadcast();
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BarrierState) -> R) -> R {
        let _irq = InterruptGuard::new();
        let mut st = self.state.lock();
        let r = f(&mut st);
        st.unlock();
        r
    }
}
