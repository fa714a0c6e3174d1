//! Scheduling policies.
//!
//! The scheduler delegates the order in which ready threads run to a
//! [`RunQueue`]. Two are provided:
//!
//! - [`Fifo`]: a single global first-in-first-out queue. Every thread runs
//!   for at most [`MAX_QUANTUM`] ticks before it is preempted.
//! - [`Mlfq`]: a multi-level feedback queue of [`MLFQ_LEVELS`] tiers. Tier
//!   `k` has a quantum of `Q << k`. Threads enter the top tier when they are
//!   created or woken up, sink one tier each time they use up their quantum,
//!   and keep their tier when they yield voluntarily. Every `boost_period`
//!   ticks of cpu 0 all ready threads float back to the top tier so that a CPU-bound
//!   thread is not starved by a stream of interactive ones.
//!
//! Run queues are only touched with the scheduler lock held.

use super::{
    Thread,
    scheduler::{DEFAULT_BOOST_PERIOD, DEFAULT_MLFQ_QUANTUM, MAX_QUANTUM, MLFQ_LEVELS},
};
use bedrock::CpuId;
use std::{collections::VecDeque, sync::Arc};

/// A scheduling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// One global FIFO ready queue.
    Fifo,
    /// Multi-level feedback queue.
    Mlfq {
        /// Quantum of the top tier, in ticks.
        quantum: u64,
        /// Ticks of cpu 0's clock between two promotions of every ready
        /// thread to the top tier. The period does not shrink as CPUs are
        /// added.
        boost_period: u64,
    },
}

impl Policy {
    /// MLFQ with the default quantum and boost period.
    pub fn mlfq() -> Self {
        Policy::Mlfq {
            quantum: DEFAULT_MLFQ_QUANTUM,
            boost_period: DEFAULT_BOOST_PERIOD,
        }
    }

    /// Ticks a thread of `tier` may run before it is preempted.
    pub fn quantum_for(&self, tier: usize) -> u64 {
        match self {
            Policy::Fifo => MAX_QUANTUM,
            Policy::Mlfq { quantum, .. } => quantum << tier.min(MLFQ_LEVELS - 1),
        }
    }

    pub(crate) fn run_queue(&self) -> Box<dyn RunQueue + Send> {
        match *self {
            Policy::Fifo => Box::new(Fifo::default()),
            Policy::Mlfq { boost_period, .. } => Box::new(Mlfq::new(boost_period)),
        }
    }
}

/// A trait for a ready queue.
///
/// The scheduler pushes every thread that becomes ready with
/// [`RunQueue::push_to_queue`], pops the thread to dispatch with
/// [`RunQueue::next_to_run`], and reports elapsed time with
/// [`RunQueue::timer_tick`] from the timer interrupt handler.
pub trait RunQueue {
    /// Pushes a ready thread.
    fn push_to_queue(&mut self, th: Arc<Thread>);

    /// Pops the next thread to run, or `None` if no thread is ready.
    fn next_to_run(&mut self) -> Option<Arc<Thread>>;

    /// Called from the timer interrupt of `cpu` with the ticks elapsed on
    /// that CPU since its previous timer interrupt.
    fn timer_tick(&mut self, _cpu: CpuId, _ticks: u64) {}

    /// Number of ready threads.
    fn len(&self) -> usize;

    /// Whether no thread is ready.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A first-in-first-out run queue.
#[derive(Default)]
pub struct Fifo {
    runqueue: VecDeque<Arc<Thread>>,
}

impl RunQueue for Fifo {
    fn push_to_queue(&mut self, th: Arc<Thread>) {
        self.runqueue.push_back(th);
    }

    fn next_to_run(&mut self) -> Option<Arc<Thread>> {
        self.runqueue.pop_front()
    }

    fn len(&self) -> usize {
        self.runqueue.len()
    }
}

/// FIFO queues of decreasing priority, tier 0 first.
struct Tiers<T> {
    levels: [VecDeque<T>; MLFQ_LEVELS],
}

impl<T> Tiers<T> {
    fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn push(&mut self, tier: usize, item: T) {
        self.levels[tier.min(MLFQ_LEVELS - 1)].push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Moves every lower tier to the back of tier 0, preserving order.
    fn flatten(&mut self, mut promote: impl FnMut(&T)) {
        let (top, rest) = self.levels.split_at_mut(1);
        for level in rest {
            for item in level.drain(..) {
                promote(&item);
                top[0].push_back(item);
            }
        }
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

/// A multi-level feedback run queue.
pub struct Mlfq {
    tiers: Tiers<Arc<Thread>>,
    boost_period: u64,
    since_boost: u64,
}

impl Mlfq {
    /// Creates an empty queue that boosts every `boost_period` ticks.
    pub fn new(boost_period: u64) -> Self {
        Self {
            tiers: Tiers::new(),
            boost_period,
            since_boost: 0,
        }
    }
}

impl RunQueue for Mlfq {
    fn push_to_queue(&mut self, th: Arc<Thread>) {
        let tier = th.tier();
        self.tiers.push(tier, th);
    }

    fn next_to_run(&mut self) -> Option<Arc<Thread>> {
        self.tiers.pop()
    }

    fn timer_tick(&mut self, cpu: CpuId, ticks: u64) {
        // Every CPU interrupts, but only one clock drives the boost.
        if cpu != 0 {
            return;
        }
        self.since_boost += ticks;
        if self.since_boost >= self.boost_period {
            self.since_boost = 0;
            trace!(THREAD, "mlfq: boosting {} ready thread(s)", self.tiers.len());
            self.tiers.flatten(|th| th.set_tier(0));
        }
    }

    fn len(&self) -> usize {
        self.tiers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_drain_highest_first() {
        let mut tiers = Tiers::new();
        tiers.push(2, 20);
        tiers.push(0, 1);
        tiers.push(4, 40);
        tiers.push(0, 2);
        tiers.push(9, 90);
        assert_eq!(tiers.len(), 5);
        let order: Vec<_> = std::iter::from_fn(|| tiers.pop()).collect();
        assert_eq!(order, [1, 2, 20, 40, 90]);
    }

    #[test]
    fn flatten_keeps_order() {
        let mut tiers = Tiers::new();
        tiers.push(0, 'a');
        tiers.push(3, 'd');
        tiers.push(1, 'b');
        tiers.push(1, 'c');
        let mut promoted = Vec::new();
        tiers.flatten(|c| promoted.push(*c));
        assert_eq!(promoted, ['b', 'c', 'd']);
        assert_eq!(tiers.levels[0].iter().collect::<String>(), "abcd");
        assert_eq!(tiers.len(), 4);
    }

    #[test]
    fn boost_clock_follows_cpu_zero() {
        let mut mlfq = Mlfq::new(500);
        for cpu in 1..4 {
            mlfq.timer_tick(cpu, 400);
        }
        assert_eq!(mlfq.since_boost, 0);
        mlfq.timer_tick(0, 300);
        mlfq.timer_tick(2, 300);
        assert_eq!(mlfq.since_boost, 300);
        mlfq.timer_tick(0, 300);
        assert_eq!(mlfq.since_boost, 0);
    }

    #[test]
    fn quantum_doubles_per_tier() {
        let policy = Policy::Mlfq {
            quantum: 100,
            boost_period: 1,
        };
        let quanta: Vec<_> = (0..MLFQ_LEVELS).map(|t| policy.quantum_for(t)).collect();
        assert_eq!(quanta, [100, 200, 400, 800, 1600]);
        assert_eq!(policy.quantum_for(MLFQ_LEVELS + 3), 1600);
        assert_eq!(Policy::Fifo.quantum_for(3), MAX_QUANTUM);
    }
}
