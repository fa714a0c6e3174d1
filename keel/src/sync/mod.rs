//! Synchronization primitives.
//!
//! | Primitive          | Waiters                        | Owner     |
//! |--------------------|--------------------------------|-----------|
//! | [`SpinLock`]       | spin on their CPU              | none      |
//! | [`Semaphore`]      | block in FIFO order            | none      |
//! | [`Lock`]           | block in FIFO order            | tracked   |
//! | [`Condition`]      | block in FIFO order, Mesa-style | its lock |
//! | [`CyclicBarrier`]  | block until all parties arrive | none      |
//!
//! All but [`SpinLock`] put waiting threads to sleep through the scheduler,
//! so they may only be waited on by kernel threads, never from an interrupt
//! handler.

pub mod barrier;
pub mod condition;
pub mod lock;
pub mod semaphore;
pub mod spinlock;

pub use barrier::CyclicBarrier;
pub use condition::Condition;
pub use lock::Lock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
