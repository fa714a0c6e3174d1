//! Simulated CPUs and the dispatch primitives.
//!
//! A CPU is either running a kernel thread or idle. While idle, its idle
//! loop keeps the clock moving so that timer interrupts continue to fire,
//! and it hands the CPU over when a thread is dispatched onto it.
//!
//! The kernel moves threads between CPUs with three primitives:
//!
//! | Primitive        | Called from               | Effect                                       |
//! |------------------|---------------------------|----------------------------------------------|
//! | [`Cpu::dispatch`]| any CPU, or the boot path | starts a thread on an idle CPU               |
//! | [`switch_to`]    | the running thread        | hands this CPU to another thread and parks   |
//! | [`idle`]         | the running thread        | leaves this CPU idle and parks               |
//!
//! The latter two take a `release` closure. It runs after the caller is off
//! the CPU and before anything else may observe that, which is how the
//! scheduler releases its lock at the exact instant of the switch.

use crate::{
    context::{self, Context, Executor, Unwind, with_executor},
    interrupt::{self, InterruptState},
    machine::{Halt, Machine},
    timer::{Handler, InterruptFrame, Timer},
};
use crossbeam_queue::SegQueue;
use crossbeam_utils::{
    atomic::AtomicCell,
    sync::{Parker, Unparker},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

/// Identifier of a CPU.
pub type CpuId = usize;

/// Wall-clock pause between two timer interrupts of an idle CPU.
const IDLE_STEP: Duration = Duration::from_micros(50);

/// A simulated CPU.
pub struct Cpu {
    id: CpuId,
    pub(crate) machine: Weak<Machine>,
    pub(crate) enabled: AtomicBool,
    pub(crate) in_handler: AtomicBool,
    clock: AtomicU64,
    busy: AtomicBool,
    pending: AtomicCell<Option<Arc<Context>>>,
    idle_loop: Unparker,
    pub(crate) timer: Timer,
    pub(crate) continuations: SegQueue<Box<dyn FnOnce() + Send>>,
}

impl Cpu {
    pub(crate) fn new(id: CpuId, machine: Weak<Machine>, idle_loop: Unparker, timer: Timer) -> Self {
        Self {
            id,
            machine,
            enabled: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            pending: AtomicCell::new(None),
            idle_loop,
            timer,
            continuations: SegQueue::new(),
        }
    }

    /// Identifier of this CPU.
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Ticks elapsed on this CPU.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Whether a thread is assigned to this CPU.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Installs the timer interrupt handler of this CPU.
    pub fn set_timer_handler(&self, handler: impl Fn(&InterruptFrame<'_>) + Send + Sync + 'static) {
        let handler: Handler = Arc::new(handler);
        self.timer.set_handler(handler);
    }

    /// Starts the periodic timer of this CPU.
    pub fn start_timer(&self) {
        self.timer.start(self.now());
        self.idle_loop.unpark();
    }

    /// Stops the periodic timer of this CPU.
    pub fn stop_timer(&self) {
        self.timer.stop();
        self.idle_loop.unpark();
    }

    /// Whether the timer of this CPU is running.
    pub fn timer_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Period of the timer of this CPU, in ticks.
    pub fn timer_interval(&self) -> u64 {
        self.timer.interval()
    }

    /// Starts `ctx` on this CPU, which must be idle.
    ///
    /// The idle loop of this CPU performs the handoff at its next safe point,
    /// so this returns before `ctx` actually runs.
    pub fn dispatch(&self, ctx: Arc<Context>) {
        assert!(
            !self.busy.swap(true, Ordering::SeqCst),
            "dispatching `{}` onto busy cpu{}",
            ctx.name(),
            self.id
        );
        debug!(MACHINE, "cpu{}: dispatch `{}`", self.id, ctx.name());
        if let Some(machine) = self.machine.upgrade() {
            machine.occupy();
        }
        self.pending.store(Some(ctx));
        self.idle_loop.unpark();
    }

    /// Advances the clock by `ticks` and delivers a due timer interrupt.
    ///
    /// Runs on this CPU with interrupts disabled.
    pub(crate) fn advance(&self, ticks: u64) {
        let now = self.clock.fetch_add(ticks, Ordering::SeqCst) + ticks;
        if let Some(machine) = self.machine.upgrade()
            && let Some(limit) = machine.config().time_limit
            && now >= limit
        {
            machine.halt(Halt::TimeLimit);
            return;
        }
        if self.timer.is_due(now) && !self.in_handler.load(Ordering::SeqCst) {
            self.deliver(now);
        }
    }

    fn deliver(&self, now: u64) {
        let Some(machine) = self.machine.upgrade() else {
            return;
        };
        machine.enter_interrupt();
        if self.timer.is_running() {
            let saved = self.enabled.swap(false, Ordering::SeqCst);
            self.in_handler.store(true, Ordering::SeqCst);
            let (handler, elapsed) = self.timer.fire(now);
            trace!(INTERRUPT, "cpu{}: timer interrupt at {now}", self.id);
            if let Some(handler) = handler {
                handler(&InterruptFrame {
                    cpu: self,
                    now,
                    elapsed,
                });
            }
            self.in_handler.store(false, Ordering::SeqCst);
            self.enabled.store(saved, Ordering::SeqCst);
        }
        machine.leave_interrupt();

        // A continuation may switch this thread to another CPU, so collect
        // them before running any.
        let mut pending = Vec::new();
        while let Some(k) = self.continuations.pop() {
            pending.push(k);
        }
        for k in pending {
            k();
        }
    }

    fn take_pending(&self) -> Option<Arc<Context>> {
        self.pending.take()
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("now", &self.now())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// The CPU this host thread executes on, if any.
pub fn current() -> Option<Arc<Cpu>> {
    with_executor(|e| match e {
        Some(Executor::Thread { ctx, .. }) => ctx.cpu().map(|id| ctx.machine.cpu(id).clone()),
        Some(Executor::Idle { cpu }) => Some(cpu.clone()),
        None => None,
    })
}

/// Identifier of the CPU this host thread executes on, if any.
pub fn current_id() -> Option<CpuId> {
    current().map(|cpu| cpu.id())
}

fn running_on_cpu(op: &str) -> (Arc<Context>, Arc<Cpu>) {
    let Some(ctx) = context::current() else {
        panic!("{op}: not called from a kernel thread");
    };
    let Some(cpu) = current() else {
        panic!("{op}: thread `{}` is not on a cpu", ctx.name());
    };
    assert_eq!(
        interrupt::level(),
        InterruptState::Off,
        "{op}: thread `{}` switches with interrupts enabled",
        ctx.name()
    );
    (ctx, cpu)
}

/// Switches this CPU from the calling thread to `next`.
///
/// `release` runs once the caller is off the CPU and `next` is assigned to
/// it. Returns when the caller is dispatched again, possibly on another CPU,
/// with interrupts disabled.
pub fn switch_to(next: &Arc<Context>, release: impl FnOnce()) {
    let (me, cpu) = running_on_cpu("switch_to");
    assert!(
        !Arc::ptr_eq(&me, next),
        "switch_to: `{}` switches to itself",
        me.name()
    );
    me.unassign();
    next.assign(cpu.id());
    release();
    next.wake();
    me.wait_for_dispatch();
}

/// Leaves this CPU idle.
///
/// `release` runs once the caller is off the CPU. Returns when the caller is
/// dispatched again, with interrupts disabled.
pub fn idle(release: impl FnOnce()) {
    let (me, cpu) = running_on_cpu("idle");
    me.unassign();
    cpu.busy.store(false, Ordering::SeqCst);
    if let Some(machine) = cpu.machine.upgrade() {
        machine.vacate();
    }
    release();
    cpu.idle_loop.unpark();
    me.wait_for_dispatch();
}

/// Body of the host thread that stands for a CPU while no kernel thread runs
/// on it.
pub(crate) fn idle_loop(machine: Arc<Machine>, cpu: Arc<Cpu>, parker: Parker) {
    context::install_executor(Some(Executor::Idle { cpu: cpu.clone() }));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        while !machine.is_halted() {
            if let Some(ctx) = cpu.take_pending() {
                cpu.enabled.store(false, Ordering::SeqCst);
                ctx.assign(cpu.id);
                ctx.wake();
                continue;
            }
            if cpu.is_busy() {
                parker.park();
                continue;
            }
            if cpu.timer.is_running() {
                // Nothing to run: skip ahead to the next timer interrupt.
                let next = cpu.timer.next_due();
                let now = cpu.now();
                cpu.advance(next.saturating_sub(now).max(1));
                parker.park_timeout(IDLE_STEP);
                continue;
            }
            machine.check_quiescent();
            parker.park();
        }
    }));
    if let Err(payload) = outcome
        && !payload.is::<Unwind>()
    {
        machine.halt(Halt::Panic(format!(
            "cpu{} idle loop panicked: {}",
            cpu.id,
            context::describe(payload.as_ref())
        )));
    }
    context::install_executor(None);
}
