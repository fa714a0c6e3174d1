//! # keel
//!
//! The concurrency core of a small teaching kernel: a multiprocessor thread
//! scheduler and the synchronization primitives built directly on it.
//!
//! The kernel runs on the simulated machine of the [`bedrock`] crate. Every
//! kernel thread executes on one of the machine's CPUs, which it only leaves
//! through the scheduler. The pieces, leaves first:
//!
//! | Component                        | Built on                                  |
//! |----------------------------------|-------------------------------------------|
//! | [`SpinLock`]                     | the machine's test-and-set cell           |
//! | [`Semaphore`]                    | [`SpinLock`] and the scheduler            |
//! | [`Lock`]                         | [`Semaphore`]                             |
//! | [`Condition`]                    | [`SpinLock`], [`Lock`] and the scheduler  |
//! | [`Scheduler`]                    | [`SpinLock`] and the dispatch primitives  |
//! | [`CyclicBarrier`], [`TaskManager`] | the primitives above                    |
//!
//! Locks follow a two-level discipline: disable local interrupts, then take
//! the spinlock; release the spinlock, then restore interrupts. A thread never
//! blocks while holding a spinlock except by handing it to
//! [`Scheduler::sleep_thread`], which releases it at the exact moment the
//! thread leaves its CPU.
//!
//! Protocol violations (releasing a lock you do not hold, sleeping in an
//! interrupt handler, taking a spinlock with interrupts enabled, ...) are
//! fatal: the panic halts the machine, and [`boot`] reports it as
//! [`KernelError::Panic`].
//!
//! ```
//! use keel::{SystemConfiguration, thread::ThreadBuilder};
//!
//! let config = SystemConfiguration::builder().cpus(2).build().unwrap();
//! let report = keel::boot(config, |scheduler| {
//!     let handle = ThreadBuilder::new("hello")
//!         .spawn(scheduler, || keel::info!(TEST, "hello from a kernel thread"))
//!         .unwrap();
//!     handle.join();
//! })
//! .unwrap();
//! assert_eq!(report.stranded, 0);
//! ```
//!
//! [`SpinLock`]: sync::SpinLock
//! [`Semaphore`]: sync::Semaphore
//! [`Lock`]: sync::Lock
//! [`Condition`]: sync::Condition
//! [`CyclicBarrier`]: sync::CyclicBarrier
//! [`TaskManager`]: task::TaskManager
#![deny(missing_docs)]

#[macro_use]
extern crate bedrock;

pub mod config;
pub mod sync;
pub mod task;
pub mod thread;

pub use bedrock::{Halt, MAX_CPU, debug, info, interrupt, kprint::DebugFlags, trace, warning};
pub use config::{SystemConfiguration, SystemConfigurationBuilder};
pub use thread::{policy::Policy, scheduler::Scheduler};

use arrayvec::ArrayVec;
use bedrock::Machine;
use std::sync::Arc;
use thread::ThreadBuilder;

/// Errors reported by the kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The system configuration is rejected before boot.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// An argument is out of range.
    #[error("invalid argument")]
    InvalidArgument,
    /// The caller is not allowed to perform the operation.
    #[error("operation not permitted")]
    OperationNotPermitted,
    /// The barrier was reset while the caller waited on it.
    #[error("barrier is broken")]
    BrokenBarrier,
    /// The host refused to create a thread.
    #[error("cannot create a host thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The kernel panicked, which halted the machine.
    #[error("kernel panic: {0}")]
    Panic(String),
}

/// What a machine did between boot and halt.
#[derive(Clone, Debug)]
pub struct Report {
    /// Ticks elapsed on each CPU.
    pub ticks: ArrayVec<u64, MAX_CPU>,
    /// Threads that never finished, i.e. were left blocked at halt.
    pub stranded: usize,
    /// Why the machine halted.
    pub halt: Halt,
}

/// Boots a machine described by `config` and runs `main` as its first
/// thread.
///
/// Threads may outlive `main`. The machine halts once every thread has
/// finished or blocked for good, and the CPU timers keep running for as long
/// as a thread is ready, running or in a timed sleep. This returns after the
/// halt, with the last finished thread reclaimed.
pub fn boot(
    config: SystemConfiguration,
    main: impl FnOnce(&Arc<Scheduler>) + Send + 'static,
) -> Result<Report, KernelError> {
    bedrock::kprint::set_debug_flags(config.debug());
    let machine = Machine::new(config.machine_config())?;
    let scheduler = Scheduler::new(machine.clone(), &config);

    let s = scheduler.clone();
    let first = ThreadBuilder::new("main").build(&scheduler, move || main(&s));
    let first = match first {
        Ok(first) => first,
        Err(e) => {
            machine.halt(Halt::Panic(e.to_string()));
            machine.wait();
            return Err(e);
        }
    };
    info!(THREAD, "booting `{}` on {} cpu(s)", first.name(), machine.cpus().len());
    scheduler.start(&first);
    drop(first);

    let halt = machine.wait();
    let stranded = scheduler.live_threads();
    scheduler.reap();
    let ticks = machine.cpus().iter().map(|cpu| cpu.now()).collect();
    match halt {
        Halt::Panic(msg) => Err(KernelError::Panic(msg)),
        halt => {
            if stranded > 0 {
                warning!(THREAD, "{stranded} thread(s) left blocked at halt");
            }
            Ok(Report {
                ticks,
                stranded,
                halt,
            })
        }
    }
}
