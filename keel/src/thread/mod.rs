//! Thread abstraction, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with its
//! own execution context. At any moment a thread is in one of the states of
//! [`ThreadStatus`]:
//!
//! ```text
//!                 ready_to_run              dispatch
//!  JustCreated ────────────────▶ Ready ─────────────────▶ Running
//!                                  ▲  ◀── yield/preempt ──    │
//!                                  │                          │ sleep_thread
//!                                  └──── ready_to_run ─── Blocked
//!                                                             │
//!                        Running ── finish_thread ──▶ Finished
//! ```
//!
//! Every transition happens inside the [`Scheduler`] under its lock; the
//! rest of the kernel only reads the status.
//!
//! Threads are created with a [`ThreadBuilder`]. The body runs with
//! interrupts enabled. When it returns, the thread finishes and its
//! execution context is reclaimed by the scheduler one generation later,
//! once it is certain that the thread no longer executes.

pub mod policy;
pub mod scheduler;

use crate::{KernelError, sync::Semaphore};
use bedrock::{
    Context, CpuId,
    interrupt::{self, InterruptState},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
};

pub use scheduler::Scheduler;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Thread has never been readied.
    JustCreated,
    /// Thread is in a ready queue.
    Ready,
    /// Thread is running on a CPU.
    Running,
    /// Thread is blocked on a synchronization primitive.
    Blocked,
    /// Thread has finished and awaits reclamation.
    Finished,
}

/// A thread.
///
/// The handle is opaque: a thread's status and tier are only changed by the
/// scheduler.
pub struct Thread {
    name: String,
    status: AtomicU8,
    tier: AtomicUsize,
    pub(crate) context: Arc<Context>,
}

impl Thread {
    /// Thread id.
    pub fn tid(&self) -> u64 {
        self.context.id()
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status of the thread.
    pub fn status(&self) -> ThreadStatus {
        match ThreadStatus::try_from(self.status.load(Ordering::SeqCst)) {
            Ok(status) => status,
            Err(e) => unreachable!("thread `{}` has status {}", self.name, e.number),
        }
    }

    /// MLFQ tier of the thread, 0 being the highest priority.
    pub fn tier(&self) -> usize {
        self.tier.load(Ordering::SeqCst)
    }

    /// Whether the execution context of this finished thread was reclaimed.
    pub fn is_reclaimed(&self) -> bool {
        self.context.is_reclaimed()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status.into(), Ordering::SeqCst);
    }

    pub(crate) fn set_tier(&self, tier: usize) {
        self.tier.store(tier, Ordering::SeqCst);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid())
            .field("name", &self.name)
            .field("status", &self.status())
            .field("tier", &self.tier())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// The kernel thread executing the caller.
///
/// Returns `None` in interrupt context, and on host threads that do not run
/// a kernel thread.
pub fn current() -> Option<Arc<Thread>> {
    if interrupt::in_handler() {
        None
    } else {
        running()
    }
}

/// The kernel thread executing the caller, interrupted or not.
pub(crate) fn running() -> Option<Arc<Thread>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Like [`current`], but a missing thread is a protocol violation of `op`.
#[track_caller]
pub(crate) fn current_or_panic(op: &str) -> Arc<Thread> {
    assert!(
        !interrupt::in_handler(),
        "{op}: called from an interrupt handler"
    );
    match running() {
        Some(th) => th,
        None => panic!("{op}: not called from a kernel thread"),
    }
}

/// Lets simulated time advance on the current CPU.
///
/// Busy-waiting threads call this so that timer interrupts, and therefore
/// preemption, keep happening.
pub fn pass_time() {
    interrupt::pass_time();
}

/// The CPU the caller executes on, if any.
pub fn cpu_id() -> Option<CpuId> {
    bedrock::cpu::current_id()
}

/// Clock of the CPU the caller executes on, in ticks.
pub fn now() -> u64 {
    bedrock::cpu::current().map_or(0, |cpu| cpu.now())
}

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: u64,
    thread: Arc<Thread>,
    done: Arc<Semaphore>,
}

impl JoinHandle {
    /// The joined thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Blocks until the body of the thread has returned.
    pub fn join(self) {
        self.done.wait();
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    th: Arc<Thread>,
    scheduler: Arc<Scheduler>,
}

impl ParkHandle {
    pub(crate) fn new(th: Arc<Thread>, scheduler: Arc<Scheduler>) -> Self {
        Self { th, scheduler }
    }

    /// The parked thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.th
    }

    /// Consume the handle and unpark the underlying thread.
    pub fn unpark(self) {
        let Self { th, scheduler } = self;
        scheduler.ready_to_run(th);
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Creates the thread without readying it.
    ///
    /// The thread stays [`ThreadStatus::JustCreated`] until it is handed to
    /// [`Scheduler::ready_to_run`]. When `thread_fn` returns, the thread
    /// finishes.
    pub fn build<F: FnOnce() + Send + 'static>(
        self,
        scheduler: &Arc<Scheduler>,
        thread_fn: F,
    ) -> Result<Arc<Thread>, KernelError> {
        let context = Context::new(scheduler.machine(), self.name.clone());
        let th = Arc::new(Thread {
            name: self.name,
            status: AtomicU8::new(ThreadStatus::JustCreated.into()),
            tier: AtomicUsize::new(0),
            context: context.clone(),
        });

        let (me, sched) = (th.clone(), scheduler.clone());
        context.launch(move || {
            debug!(THREAD, "thread `{}` starts on cpu{:?}", me.name, cpu_id());
            CURRENT.with(|c| *c.borrow_mut() = Some(me));
            interrupt::set_level(InterruptState::On);
            thread_fn();
            sched.finish_thread();
        })?;
        scheduler.admit(&th);
        Ok(th)
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        self,
        scheduler: &Arc<Scheduler>,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let done = Arc::new(Semaphore::new(scheduler, 0));
        let signal = done.clone();
        let thread = self.build(scheduler, move || {
            thread_fn();
            signal.signal();
        })?;
        scheduler.ready_to_run(thread.clone());
        Ok(JoinHandle {
            tid: thread.tid(),
            thread,
            done,
        })
    }
}
