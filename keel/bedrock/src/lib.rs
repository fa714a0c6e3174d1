//! The bedrock of keel: the machine the kernel runs on.
//!
//! This crate simulates the hardware that the kernel concurrency core
//! consumes: a fixed set of CPUs, each with a local interrupt level, a clock
//! measured in ticks, a periodic timer, and a queue of continuations to run
//! when an interrupt handler returns. Kernel threads are backed by host
//! threads that only make progress while a simulated CPU is assigned to them,
//! so at any moment each CPU executes exactly one instruction stream, either
//! a kernel thread or its own idle loop.
//!
//! The kernel reaches the machine through a small surface:
//!
//! - [`interrupt`]: reading and setting the local interrupt level, and the
//!   [`InterruptGuard`] that restores it.
//! - [`tas::TasCell`]: the atomic test-and-set cell spinlocks are built on.
//! - [`Cpu`]: the per-unit timer and the dispatch primitives
//!   [`Cpu::dispatch`], [`cpu::switch_to`] and [`cpu::idle`].
//! - [`Context`]: the execution context of a kernel thread, and its
//!   [`Context::reclaim`] operation.
//! - [`Machine`]: construction, halting, and waiting for the machine to halt.
//!
//! You are **not** supposed to schedule threads with this crate directly.
//! The dispatch primitives have strict preconditions (interrupts off, the
//! target CPU idle, the caller holding the lock it asks to be released) that
//! the kernel's scheduler upholds.
//!
//! [`InterruptGuard`]: interrupt::InterruptGuard
#![deny(missing_docs)]

#[doc(hidden)]
pub use log;

#[macro_use]
pub mod kprint;
pub mod context;
pub mod cpu;
pub mod interrupt;
pub mod machine;
pub mod tas;
pub mod timer;

pub use context::Context;
pub use cpu::{Cpu, CpuId};
pub use machine::{Halt, Machine, MachineConfig, halt_point, is_uniprocessor};

/// Maximum number of CPU the machine can simulate.
pub const MAX_CPU: usize = 8;
