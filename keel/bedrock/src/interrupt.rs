//! Interrupt
//!
//! Each CPU has a local interrupt level. While it is [`InterruptState::Off`]
//! no timer interrupt is delivered on that CPU, which also means the running
//! thread cannot be preempted there.
//!
//! Simulated time advances when interrupts are turned back on: each
//! Off-to-On transition moves the CPU clock forward by the configured number
//! of ticks and delivers a timer interrupt if one became due. The handler
//! runs in handler context, and the continuations it registered run right
//! after it, before the level is finally set to On.
//!
//! Host threads that are not simulated CPUs always observe interrupts as
//! off, and changing the level from them has no effect.

use crate::cpu;
use std::{marker::PhantomData, sync::atomic::Ordering};

/// Enumeration representing the interrupt state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the interrupt state of the current CPU.
    pub fn current() -> Self {
        level()
    }
}

/// Reads the interrupt level of the current CPU.
pub fn level() -> InterruptState {
    match cpu::current() {
        Some(cpu) if cpu.enabled.load(Ordering::SeqCst) => InterruptState::On,
        _ => InterruptState::Off,
    }
}

/// Sets the interrupt level of the current CPU and returns the previous one.
///
/// Turning interrupts on advances simulated time and may deliver a timer
/// interrupt, whose continuations may in turn switch the caller out. By the
/// time this returns the caller may therefore run on another CPU.
pub fn set_level(level: InterruptState) -> InterruptState {
    let Some(cpu) = cpu::current() else {
        return InterruptState::Off;
    };
    match level {
        InterruptState::Off => {
            if cpu.enabled.swap(false, Ordering::SeqCst) {
                InterruptState::On
            } else {
                InterruptState::Off
            }
        }
        InterruptState::On => {
            if cpu.enabled.load(Ordering::SeqCst) {
                return InterruptState::On;
            }
            if !std::thread::panicking() {
                one_tick(&cpu);
            }
            if let Some(cpu) = cpu::current() {
                cpu.enabled.store(true, Ordering::SeqCst);
            }
            InterruptState::Off
        }
    }
}

fn one_tick(cpu: &cpu::Cpu) {
    let ticks = cpu
        .machine
        .upgrade()
        .map_or(0, |machine| machine.config().enable_ticks);
    cpu.advance(ticks);
}

/// Lets simulated time advance on the current CPU by toggling interrupts off
/// and back on. Does nothing while interrupts are disabled.
pub fn pass_time() {
    if set_level(InterruptState::Off) == InterruptState::On {
        set_level(InterruptState::On);
    }
}

/// Whether the current CPU is running an interrupt handler.
pub fn in_handler() -> bool {
    cpu::current().is_some_and(|cpu| cpu.in_handler.load(Ordering::SeqCst))
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt level saved at creation is restored on the CPU the
/// thread is running on at that time, which may differ from the CPU it was
/// created on if the thread blocked in between.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Any spinlock taken after creating the guard must be released before the
///   guard is dropped.
pub struct InterruptGuard {
    prev: InterruptState,
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Example
    /// ```
    /// use bedrock::interrupt::InterruptGuard;
    ///
    /// let _guard = InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            prev: set_level(InterruptState::Off),
            _not_send: PhantomData,
        }
    }

    /// The level that will be restored when this guard is dropped.
    pub fn saved(&self) -> InterruptState {
        self.prev
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.prev == InterruptState::On && !std::thread::panicking() {
            set_level(InterruptState::On);
        }
    }
}
