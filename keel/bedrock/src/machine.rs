//! The simulated machine.
//!
//! A [`Machine`] owns its CPUs and one idle-loop host thread per CPU. It
//! halts in one of three ways:
//!
//! - **Quiescent**: once booted, every CPU is idle, no timer is running and
//!   no interrupt handler is in flight. Nothing can ever run again.
//! - **Time limit**: a CPU clock reached the configured limit.
//! - **Panic**: a kernel thread or an interrupt handler panicked, which is
//!   how fatal assertions of the kernel stop the machine.
//!
//! Halting releases every host thread parked on the machine so that they
//! exit, and [`Machine::wait`] returns the reason once all idle loops are
//! gone.

use crate::{
    MAX_CPU,
    context::{Context, Executor, Unwind, with_executor},
    cpu::{self, Cpu, CpuId},
    timer::Timer,
};
use arrayvec::ArrayVec;
use crossbeam_utils::sync::Parker;
use std::{
    collections::BTreeMap,
    io,
    panic,
    sync::{
        Arc, Condvar, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

/// Static description of a machine.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Number of CPUs, between 1 and [`MAX_CPU`].
    pub cpus: usize,
    /// Period of the CPU timers, in ticks.
    pub timer_interval: u64,
    /// Ticks a CPU clock advances each time interrupts are re-enabled.
    pub enable_ticks: u64,
    /// Seed for randomized timer periods. `None` keeps them fixed.
    pub random_seed: Option<u64>,
    /// Halts the machine once any CPU clock reaches this many ticks.
    pub time_limit: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            timer_interval: 100,
            enable_ticks: 10,
            random_seed: None,
            time_limit: None,
        }
    }
}

/// Why a machine halted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Halt {
    /// Every CPU became idle with no timer left to wake anything up.
    Quiescent,
    /// A CPU clock reached the configured time limit.
    TimeLimit,
    /// A kernel thread or an interrupt handler panicked.
    Panic(String),
}

/// A simulated multiprocessor.
pub struct Machine {
    cpus: ArrayVec<Arc<Cpu>, MAX_CPU>,
    config: MachineConfig,
    armed: AtomicBool,
    halted: AtomicBool,
    reason: Mutex<Option<Halt>>,
    on_halt: Condvar,
    /// Busy CPUs plus timer handlers in flight.
    active: AtomicUsize,
    contexts: Mutex<BTreeMap<u64, Weak<Context>>>,
    idle_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Machine {
    /// Powers on a machine described by `config`.
    ///
    /// All CPUs start idle. The machine does not halt on quiescence until the
    /// first thread has been dispatched.
    pub fn new(config: MachineConfig) -> io::Result<Arc<Self>> {
        assert!(
            (1..=MAX_CPU).contains(&config.cpus),
            "a machine has between 1 and {MAX_CPU} cpus, not {}",
            config.cpus
        );
        let mut parkers = Vec::with_capacity(config.cpus);
        let machine = Arc::new_cyclic(|weak: &Weak<Machine>| {
            let cpus = (0..config.cpus)
                .map(|id| {
                    let parker = Parker::new();
                    let seed = config.random_seed.map(|seed| seed.wrapping_add(id as u64));
                    let cpu = Cpu::new(
                        id,
                        weak.clone(),
                        parker.unparker().clone(),
                        Timer::new(config.timer_interval, seed),
                    );
                    parkers.push(parker);
                    Arc::new(cpu)
                })
                .collect();
            Machine {
                cpus,
                config: config.clone(),
                armed: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                reason: Mutex::new(None),
                on_halt: Condvar::new(),
                active: AtomicUsize::new(0),
                contexts: Mutex::new(BTreeMap::new()),
                idle_loops: Mutex::new(Vec::new()),
            }
        });

        for (cpu, parker) in machine.cpus.iter().zip(parkers) {
            let (m, c) = (machine.clone(), cpu.clone());
            let spawned = thread::Builder::new()
                .name(format!("cpu{}", cpu.id()))
                .spawn(move || cpu::idle_loop(m, c, parker));
            match spawned {
                Ok(handle) => machine
                    .idle_loops
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle),
                Err(e) => {
                    machine.halt(Halt::Panic(format!("cannot power on cpu{}: {e}", cpu.id())));
                    return Err(e);
                }
            }
        }
        info!(MACHINE, "machine powered on with {} cpu(s)", config.cpus);
        Ok(machine)
    }

    /// The configuration this machine was built from.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// All CPUs of this machine.
    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    /// The CPU identified by `id`.
    pub fn cpu(&self, id: CpuId) -> &Arc<Cpu> {
        &self.cpus[id]
    }

    /// Whether the machine halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Halts the machine. Only the first reason is kept.
    pub fn halt(&self, reason: Halt) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            match &reason {
                Halt::Panic(msg) => warning!(MACHINE, "machine halted: {msg}"),
                reason => info!(MACHINE, "machine halted: {reason:?}"),
            }
            *slot = Some(reason);
            self.halted.store(true, Ordering::SeqCst);
            self.on_halt.notify_all();
        }
        for cpu in self.cpus.iter() {
            cpu.stop_timer();
        }
        let contexts = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();
        for ctx in contexts {
            ctx.wake();
        }
    }

    /// Blocks the calling host thread until the machine halts, then returns
    /// the reason once every idle loop has exited.
    pub fn wait(&self) -> Halt {
        let reason = {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(reason) = slot.as_ref() {
                    break reason.clone();
                }
                slot = self
                    .on_halt
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let idle_loops = std::mem::take(
            &mut *self.idle_loops.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in idle_loops {
            let _ = handle.join();
        }
        reason
    }

    pub(crate) fn register(&self, ctx: &Arc<Context>) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.id(), Arc::downgrade(ctx));
    }

    pub(crate) fn forget(&self, id: u64) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Counts a CPU that is handed a context.
    pub(crate) fn occupy(&self) {
        self.armed.store(true, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a CPU that goes idle.
    pub(crate) fn vacate(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn enter_interrupt(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_interrupt(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Halts the machine if nothing can run any more.
    ///
    /// A CPU that dispatches onto another one is counted on the target before
    /// it can go idle itself, so a single read of the counter is a consistent
    /// snapshot.
    pub(crate) fn check_quiescent(&self) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        let ticking = self.cpus.iter().any(|cpu| cpu.timer_running());
        if !ticking && self.active.load(Ordering::SeqCst) == 0 {
            self.halt(Halt::Quiescent);
        }
    }
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("cpus", &self.cpus)
            .field("halted", &self.is_halted())
            .finish()
    }
}

fn with_current_machine<R>(f: impl FnOnce(&Machine) -> R) -> Option<R> {
    let machine = with_executor(|e| match e {
        Some(Executor::Thread { ctx, .. }) => Some(ctx.machine.clone()),
        Some(Executor::Idle { cpu }) => cpu.machine.upgrade(),
        None => None,
    })?;
    Some(f(&machine))
}

/// Retires the calling host thread if its machine has halted.
///
/// Busy-wait loops call this so that a machine halted by a panic on one CPU
/// does not leave the other CPUs spinning forever.
pub fn halt_point() {
    if with_current_machine(Machine::is_halted).unwrap_or(false) {
        panic::resume_unwind(Box::new(Unwind::Halted));
    }
}

/// Whether the calling host thread executes on a single-CPU machine.
///
/// Host threads that are not simulated CPUs report `false`.
pub fn is_uniprocessor() -> bool {
    with_current_machine(|m| m.cpus.len() == 1).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use std::sync::atomic::AtomicU64;

    fn machine(cpus: usize, time_limit: Option<u64>) -> Arc<Machine> {
        Machine::new(MachineConfig {
            cpus,
            time_limit,
            ..MachineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn halts_when_quiescent() {
        let m = machine(2, None);
        let ctx = Context::new(&m, "idler");
        ctx.launch(|| {
            cpu::idle(|| ());
        })
        .unwrap();
        m.cpu(1).dispatch(ctx);
        assert_eq!(m.wait(), Halt::Quiescent);
    }

    #[test]
    fn handoff_between_cpus_is_not_quiescent() {
        for _ in 0..50 {
            let m = machine(3, None);
            let ran = Arc::new(AtomicBool::new(false));
            let (r, target) = (ran.clone(), m.cpu(0).clone());
            let second = Context::new(&m, "second");
            second
                .launch(move || {
                    r.store(true, Ordering::SeqCst);
                    cpu::idle(|| ());
                })
                .unwrap();
            let first = Context::new(&m, "first");
            first
                .launch(move || {
                    target.dispatch(second);
                    cpu::idle(|| ());
                })
                .unwrap();
            m.cpu(1).dispatch(first);
            assert_eq!(m.wait(), Halt::Quiescent);
            assert!(ran.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn panic_halts() {
        let m = machine(1, None);
        let ctx = Context::new(&m, "doomed");
        ctx.launch(|| panic!("boom")).unwrap();
        m.cpu(0).dispatch(ctx);
        match m.wait() {
            Halt::Panic(msg) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected halt: {other:?}"),
        }
    }

    #[test]
    fn idle_cpu_keeps_its_timer_going() {
        let m = machine(1, Some(1_000));
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        m.cpu(0).set_timer_handler(move |frame| {
            assert!(frame.elapsed() > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        m.cpu(0).start_timer();
        assert_eq!(m.wait(), Halt::TimeLimit);
        assert!(fired.load(Ordering::SeqCst) >= 9);
        assert!(m.cpu(0).now() >= 1_000);
    }
}
