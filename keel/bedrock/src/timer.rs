//! Per-CPU periodic timer.
//!
//! A timer is programmed in ticks of its CPU's clock. When the clock reaches
//! the next due time the CPU delivers a timer interrupt: it runs the handler
//! installed with [`Cpu::set_timer_handler`] with local interrupts off and
//! passes an [`InterruptFrame`] describing the interrupt.
//!
//! With a random seed configured, each period is drawn uniformly from
//! `1..=2 * interval`, which shakes out code that only works under one
//! particular interleaving.
//!
//! [`Cpu::set_timer_handler`]: crate::Cpu::set_timer_handler

use crate::cpu::Cpu;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

/// A timer interrupt handler.
pub type Handler = Arc<dyn Fn(&InterruptFrame<'_>) + Send + Sync>;

/// Description of a delivered timer interrupt.
pub struct InterruptFrame<'a> {
    pub(crate) cpu: &'a Cpu,
    pub(crate) now: u64,
    pub(crate) elapsed: u64,
}

impl InterruptFrame<'_> {
    /// The interrupted CPU.
    pub fn cpu_id(&self) -> usize {
        self.cpu.id()
    }

    /// Clock of the interrupted CPU when the interrupt was delivered.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Ticks elapsed on this CPU since its previous timer interrupt.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Registers `k` to run once the handler has returned, before the
    /// interrupted execution resumes.
    ///
    /// The continuation runs with interrupts still disabled and outside of
    /// handler context, so it may block or switch threads. Continuations
    /// registered while the CPU was idle run in the idle loop.
    pub fn on_return(&self, k: impl FnOnce() + Send + 'static) {
        self.cpu.continuations.push(Box::new(k));
    }
}

pub(crate) struct Timer {
    interval: u64,
    running: AtomicBool,
    next_due: AtomicU64,
    last_fire: AtomicU64,
    handler: Mutex<Option<Handler>>,
    rng: Mutex<Option<StdRng>>,
}

impl Timer {
    pub(crate) fn new(interval: u64, seed: Option<u64>) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
            next_due: AtomicU64::new(u64::MAX),
            last_fire: AtomicU64::new(0),
            handler: Mutex::new(None),
            rng: Mutex::new(seed.map(StdRng::seed_from_u64)),
        }
    }

    pub(crate) fn interval(&self) -> u64 {
        self.interval
    }

    pub(crate) fn set_handler(&self, handler: Handler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub(crate) fn start(&self, now: u64) {
        self.last_fire.store(now, Ordering::SeqCst);
        self.next_due
            .store(now + self.next_period(), Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn next_due(&self) -> u64 {
        self.next_due.load(Ordering::SeqCst)
    }

    pub(crate) fn is_due(&self, now: u64) -> bool {
        self.is_running() && now >= self.next_due()
    }

    /// Consumes a due interrupt and reprograms the next one.
    ///
    /// Returns the handler and the ticks elapsed since the previous fire.
    pub(crate) fn fire(&self, now: u64) -> (Option<Handler>, u64) {
        let elapsed = now - self.last_fire.swap(now, Ordering::SeqCst);
        self.next_due
            .store(now + self.next_period(), Ordering::SeqCst);
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        (handler, elapsed)
    }

    fn next_period(&self) -> u64 {
        match self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(rng) => rng.gen_range(1..=2 * self.interval),
            None => self.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;

    #[test]
    fn fixed_interval() {
        let timer = Timer::new(100, None);
        assert!(!timer.is_due(1_000));
        timer.start(40);
        assert!(!timer.is_due(139));
        assert!(timer.is_due(140));
        let (handler, elapsed) = timer.fire(150);
        assert!(handler.is_none());
        assert_eq!(elapsed, 110);
        assert_eq!(timer.next_due(), 250);
        timer.stop();
        assert!(!timer.is_due(10_000));
    }

    #[test]
    fn random_interval_is_seeded() {
        let a = Timer::new(100, Some(7));
        let b = Timer::new(100, Some(7));
        a.start(0);
        b.start(0);
        for step in 0..32 {
            let now = a.next_due();
            assert_eq!(now, b.next_due(), "diverged at step {step}");
            a.fire(now);
            b.fire(now);
            let period = a.next_due() - now;
            assert!((1..=200).contains(&period));
        }
    }
}
