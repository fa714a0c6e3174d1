//! Thread scheduler
//!
//! The [`Scheduler`] owns the ready queue, the pool of idle CPUs, the slot of
//! the finished thread awaiting reclamation and the registry of sleeping
//! threads. All of it sits behind one [`SpinLock`], the scheduler lock,
//! which is only taken with interrupts disabled.
//!
//! ## Leaving the CPU
//!
//! A running thread leaves its CPU in one of three ways:
//!
//! | Operation                      | Thread becomes | If nothing else is ready |
//! |--------------------------------|----------------|--------------------------|
//! | [`Scheduler::yield_thread`]    | `Ready`        | keeps running            |
//! | [`Scheduler::sleep_thread`]    | `Blocked`      | the CPU goes idle        |
//! | [`Scheduler::finish_thread`]   | `Finished`     | the CPU goes idle        |
//!
//! The scheduler lock is held across the switch and released by the machine
//! at the instant the thread is off its CPU. [`Scheduler::sleep_thread`]
//! releases the caller's spinlock at the same instant, so a waker that needs
//! that spinlock can never observe a thread that is queued as a waiter but
//! still running.
//!
//! ## Preemption
//!
//! When the system is preemptive, each CPU timer fires every
//! [`TICK_INTERVAL`] ticks. The handler charges the elapsed ticks to the
//! thread running on the CPU, and once the thread has used up its quantum it
//! asks the machine to make that thread yield right after the handler
//! returns. The same handler expires timed sleeps and ages the MLFQ.
//!
//! The timers stop by themselves once every CPU is idle with nothing ready,
//! no thread in a timed sleep and no sleeper on its way back to the ready
//! queue. Nothing can run after that, so the machine halts.
//!
//! ## Reclamation
//!
//! A finished thread cannot reclaim its own execution context while running
//! on it. It is parked in the pending-destruction slot instead, and the next
//! thread to finish reclaims it, under the same hold of the scheduler lock
//! that installs itself.

use super::{
    ParkHandle, Thread, ThreadStatus, current_or_panic,
    policy::{Policy, RunQueue},
    running,
};
use crate::{
    MAX_CPU, SystemConfiguration,
    sync::{Semaphore, SpinLock, SpinLockGuard},
};
use arrayvec::ArrayVec;
use bedrock::{
    CpuId, Machine,
    interrupt::{self, InterruptGuard, InterruptState},
    timer::InterruptFrame,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

/// Period of the CPU timers, in ticks.
pub const TICK_INTERVAL: u64 = 100;
/// Ticks a CPU clock advances each time interrupts are re-enabled.
pub const ENABLE_TICKS: u64 = 10;
/// Quantum of a thread under FIFO scheduling, in ticks.
pub const MAX_QUANTUM: u64 = 1000;
/// Number of MLFQ tiers.
pub const MLFQ_LEVELS: usize = 5;
/// Default quantum of the top MLFQ tier, in ticks.
pub const DEFAULT_MLFQ_QUANTUM: u64 = 100;
/// Default period of the MLFQ boost, in ticks.
pub const DEFAULT_BOOST_PERIOD: u64 = 10_000;

struct SchedState {
    ready: Box<dyn RunQueue + Send>,
    idle_cpus: VecDeque<CpuId>,
    pending_destruction: Option<Arc<Thread>>,
    sleepers: Vec<Sleeper>,
    /// Sleepers taken off the registry whose alarm is not signalled yet.
    waking: usize,
}

struct Sleeper {
    tid: u64,
    deadline: u64,
    cpu: CpuId,
    alarm: Arc<Semaphore>,
}

/// Why a thread goes back to the ready queue.
#[derive(Clone, Copy, Debug)]
enum Enqueue {
    /// Created or woken up.
    Admitted,
    /// Gave up the CPU voluntarily.
    Yielded,
    /// Used up its quantum.
    Preempted,
}

/// What becomes of a thread that leaves its CPU.
#[derive(Clone, Copy, Debug)]
enum Next {
    Ready(Enqueue),
    Blocked,
    Finished,
}

/// The thread scheduler of a machine.
pub struct Scheduler {
    machine: Arc<Machine>,
    state: SpinLock<SchedState>,
    slices: ArrayVec<AtomicU64, MAX_CPU>,
    policy: Policy,
    preemptive: bool,
    live: AtomicUsize,
}

impl Scheduler {
    /// Creates the scheduler of `machine`. All CPUs start idle.
    pub fn new(machine: Arc<Machine>, config: &SystemConfiguration) -> Arc<Self> {
        let slices = machine.cpus().iter().map(|_| AtomicU64::new(0)).collect();
        Arc::new(Self {
            state: SpinLock::new(SchedState {
                ready: config.policy().run_queue(),
                idle_cpus: VecDeque::new(),
                pending_destruction: None,
                sleepers: Vec::new(),
                waking: 0,
            }),
            slices,
            policy: config.policy(),
            preemptive: config.preemptive(),
            live: AtomicUsize::new(0),
            machine,
        })
    }

    /// The machine this scheduler runs on.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The scheduling policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Starts scheduling with `first` running on cpu 0.
    ///
    /// The other CPUs join the idle pool, and when the system is preemptive
    /// every CPU timer is wired to the timer interrupt handler and started.
    pub fn start(self: &Arc<Self>, first: &Arc<Thread>) {
        let mut st = self.state.lock();
        assert_eq!(
            first.status(),
            ThreadStatus::JustCreated,
            "start: thread `{}` was already scheduled",
            first.name()
        );
        st.idle_cpus.extend(1..self.machine.cpus().len());
        first.set_status(ThreadStatus::Running);
        st.unlock();

        if self.preemptive {
            for cpu in self.machine.cpus() {
                let scheduler = Arc::downgrade(self);
                cpu.set_timer_handler(move |frame| {
                    if let Some(scheduler) = scheduler.upgrade() {
                        scheduler.timer_interrupt(frame);
                    }
                });
                cpu.start_timer();
            }
        }
        self.machine.cpu(0).dispatch(first.context.clone());
    }

    /// Hands `th` to the scheduler.
    ///
    /// The thread must be [`ThreadStatus::JustCreated`] or
    /// [`ThreadStatus::Blocked`]. It becomes ready, and then ready threads
    /// are dispatched onto idle CPUs for as long as both exist.
    pub fn ready_to_run(&self, th: Arc<Thread>) {
        let _irq = InterruptGuard::new();
        let mut st = self.state.lock();
        self.make_ready(&mut st, th, Enqueue::Admitted);
        self.dispatch_idle_cpus(&mut st);
        st.unlock();
    }

    /// Gives the CPU to another ready thread, if any.
    ///
    /// The caller goes to the back of its ready queue. If no other thread is
    /// ready, this returns immediately.
    pub fn yield_thread(&self) {
        self.yield_with("yield_thread", Enqueue::Yielded);
    }

    /// Blocks the caller and releases `guard` once it is off its CPU.
    ///
    /// Interrupts must already be disabled, and they are still disabled
    /// when the caller resumes, after another thread handed it to
    /// [`Scheduler::ready_to_run`].
    #[track_caller]
    pub fn sleep_thread<T: ?Sized>(&self, guard: SpinLockGuard<'_, T>) {
        let cur = current_or_panic("sleep_thread");
        assert_eq!(
            interrupt::level(),
            InterruptState::Off,
            "sleep_thread: thread `{}` sleeps with interrupts enabled",
            cur.name()
        );
        let st = self.state.lock();
        self.relinquish(st, &cur, Next::Blocked, move || guard.unlock());
    }

    /// Finishes the caller.
    ///
    /// The previous finished thread is reclaimed and the caller takes its
    /// place in the pending-destruction slot.
    pub fn finish_thread(&self) -> ! {
        let cur = current_or_panic("finish_thread");
        interrupt::set_level(InterruptState::Off);
        let mut st = self.state.lock();
        cur.set_status(ThreadStatus::Finished);
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(THREAD, "thread `{}` finished", cur.name());
        if let Some(prev) = st.pending_destruction.replace(cur.clone()) {
            Self::destroy(&prev);
        }
        self.relinquish(st, &cur, Next::Finished, || ());
        unreachable!("finished thread `{}` was scheduled again", cur.name());
    }

    /// Blocks the caller for at least `ticks` ticks of its CPU clock.
    ///
    /// The deadline is measured on the CPU the caller runs on when it calls
    /// this; that CPU's timer interrupt wakes it up. Requires a preemptive
    /// system.
    pub fn sleep(self: &Arc<Self>, ticks: u64) {
        let cur = current_or_panic("sleep");
        assert!(
            self.preemptive,
            "sleep: thread `{}` sleeps but the cpu timers are disabled",
            cur.name()
        );
        let alarm = Arc::new(Semaphore::new(self, 0));
        {
            let _irq = InterruptGuard::new();
            let Some(cpu) = bedrock::cpu::current() else {
                unreachable!("thread `{}` runs on no cpu", cur.name());
            };
            let deadline = cpu.now().saturating_add(ticks);
            let mut st = self.state.lock();
            st.sleepers.push(Sleeper {
                tid: cur.tid(),
                deadline,
                cpu: cpu.id(),
                alarm: alarm.clone(),
            });
            st.unlock();
            debug!(
                THREAD,
                "thread `{}` sleeps until {deadline} on cpu{}",
                cur.name(),
                cpu.id()
            );
        }
        alarm.wait();
    }

    /// A handle that readies the calling thread once it has blocked.
    ///
    /// Queue the handle where a waker finds it, then block with
    /// [`Scheduler::sleep_thread`] while holding the spinlock that guards
    /// that queue.
    #[track_caller]
    pub fn park_handle(self: &Arc<Self>) -> ParkHandle {
        ParkHandle::new(current_or_panic("park"), self.clone())
    }

    /// Number of threads created and not yet finished.
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of ready threads.
    pub fn ready_count(&self) -> usize {
        self.with_state(|st| st.ready.len())
    }

    /// Number of CPUs in the idle pool.
    pub fn idle_cpu_count(&self) -> usize {
        self.with_state(|st| st.idle_cpus.len())
    }

    /// Thread id of the finished thread awaiting reclamation, if any.
    pub fn pending_destruction(&self) -> Option<u64> {
        self.with_state(|st| st.pending_destruction.as_ref().map(|th| th.tid()))
    }

    /// Number of threads in a timed sleep.
    pub fn sleeping_count(&self) -> usize {
        self.with_state(|st| st.sleepers.len())
    }

    /// Reclaims the pending finished thread.
    ///
    /// Call once the machine has halted.
    pub fn reap(&self) {
        if let Some(th) = self.with_state(|st| st.pending_destruction.take()) {
            Self::destroy(&th);
        }
    }

    pub(crate) fn admit(&self, th: &Arc<Thread>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(THREAD, "thread `{}` created with tid {}", th.name(), th.tid());
    }

    pub(crate) fn preempt(&self) {
        self.yield_with("preempt", Enqueue::Preempted);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SchedState) -> R) -> R {
        let _irq = InterruptGuard::new();
        let mut st = self.state.lock();
        let r = f(&mut st);
        st.unlock();
        r
    }

    fn destroy(th: &Arc<Thread>) {
        debug!(THREAD, "reclaiming thread `{}`", th.name());
        th.context.reclaim();
    }

    fn yield_with(&self, op: &str, reason: Enqueue) {
        let cur = current_or_panic(op);
        let _irq = InterruptGuard::new();
        let st = self.state.lock();
        self.relinquish(st, &cur, Next::Ready(reason), || ());
    }

    fn charge(&self, th: &Thread, reason: Enqueue) {
        if let Policy::Mlfq { .. } = self.policy {
            match reason {
                Enqueue::Admitted => th.set_tier(0),
                Enqueue::Yielded => (),
                Enqueue::Preempted => th.set_tier((th.tier() + 1).min(MLFQ_LEVELS - 1)),
            }
        }
    }

    fn make_ready(&self, st: &mut SchedState, th: Arc<Thread>, reason: Enqueue) {
        if let Enqueue::Admitted = reason {
            assert!(
                matches!(
                    th.status(),
                    ThreadStatus::JustCreated | ThreadStatus::Blocked
                ),
                "ready_to_run: thread `{}` is {:?}",
                th.name(),
                th.status()
            );
        }
        self.charge(&th, reason);
        th.set_status(ThreadStatus::Ready);
        st.ready.push_to_queue(th);
    }

    fn dispatch_idle_cpus(&self, st: &mut SchedState) {
        while let Some(&cpu) = st.idle_cpus.front() {
            let Some(th) = st.ready.next_to_run() else {
                break;
            };
            st.idle_cpus.pop_front();
            th.set_status(ThreadStatus::Running);
            self.slices[cpu].store(0, Ordering::SeqCst);
            debug!(THREAD, "cpu{cpu}: dispatch `{}`", th.name());
            self.machine.cpu(cpu).dispatch(th.context.clone());
        }
    }

    /// Takes `cur` off its CPU.
    ///
    /// `st` and the caller's `release` are both released once `cur` is off
    /// the CPU. Returns when `cur` runs again, or immediately if `cur` would
    /// become ready and no other thread is.
    fn relinquish(
        &self,
        mut st: SpinLockGuard<'_, SchedState>,
        cur: &Arc<Thread>,
        next: Next,
        release: impl FnOnce(),
    ) {
        let Some(cpu) = bedrock::cpu::current_id() else {
            unreachable!("thread `{}` runs on no cpu", cur.name());
        };
        match st.ready.next_to_run() {
            Some(successor) => {
                match next {
                    Next::Ready(reason) => self.make_ready(&mut st, cur.clone(), reason),
                    Next::Blocked => cur.set_status(ThreadStatus::Blocked),
                    Next::Finished => (),
                }
                successor.set_status(ThreadStatus::Running);
                self.slices[cpu].store(0, Ordering::SeqCst);
                trace!(
                    THREAD,
                    "cpu{cpu}: switch `{}` -> `{}`",
                    cur.name(),
                    successor.name()
                );
                let context = successor.context.clone();
                drop(successor);
                bedrock::cpu::switch_to(&context, move || {
                    st.unlock();
                    release();
                });
            }
            None if matches!(next, Next::Ready(_)) => {
                if let Next::Ready(reason) = next {
                    self.charge(cur, reason);
                }
                st.unlock();
                release();
                return;
            }
            None => {
                if let Next::Blocked = next {
                    cur.set_status(ThreadStatus::Blocked);
                }
                st.idle_cpus.push_back(cpu);
                trace!(THREAD, "cpu{cpu}: idle after `{}`", cur.name());
                self.stop_timers_if_unneeded(&st);
                bedrock::cpu::idle(move || {
                    st.unlock();
                    release();
                });
            }
        }
        trace!(
            THREAD,
            "cpu{:?}: now in thread `{}`",
            bedrock::cpu::current_id(),
            cur.name()
        );
    }

    fn timer_interrupt(self: &Arc<Self>, frame: &InterruptFrame<'_>) {
        let cpu = frame.cpu_id();
        self.expire_sleepers(cpu, frame.now());

        let mut st = self.state.lock();
        st.ready.timer_tick(cpu, frame.elapsed());
        st.unlock();

        let Some(th) = running() else {
            return;
        };
        let used = self.slices[cpu].fetch_add(frame.elapsed(), Ordering::SeqCst) + frame.elapsed();
        if used >= self.policy.quantum_for(th.tier()) {
            self.slices[cpu].store(0, Ordering::SeqCst);
            trace!(THREAD, "cpu{cpu}: `{}` used up its quantum", th.name());
            let scheduler = self.clone();
            frame.on_return(move || scheduler.preempt());
        }
    }

    fn expire_sleepers(&self, cpu: CpuId, now: u64) {
        let mut due = Vec::new();
        let mut st = self.state.lock();
        st.sleepers.retain(|s| {
            if s.cpu == cpu && s.deadline <= now {
                due.push((s.tid, s.alarm.clone()));
                false
            } else {
                true
            }
        });
        if due.is_empty() {
            st.unlock();
            return;
        }
        st.waking += due.len();
        st.unlock();

        let woken = due.len();
        for (tid, alarm) in due {
            trace!(THREAD, "cpu{cpu}: waking sleeper {tid} at {now}");
            alarm.signal();
        }
        let mut st = self.state.lock();
        st.waking -= woken;
        self.stop_timers_if_unneeded(&st);
        st.unlock();
    }

    /// Stops every CPU timer once no thread can ever run again.
    fn stop_timers_if_unneeded(&self, st: &SchedState) {
        let unneeded = self.preemptive
            && st.idle_cpus.len() == self.machine.cpus().len()
            && st.ready.is_empty()
            && st.sleepers.is_empty()
            && st.waking == 0;
        if unneeded && self.machine.cpus().iter().any(|cpu| cpu.timer_running()) {
            debug!(THREAD, "nothing left to run, stopping the cpu timers");
            for cpu in self.machine.cpus() {
                cpu.stop_timer();
            }
        }
    }
}
