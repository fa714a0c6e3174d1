mod common;

pub mod semaphore {
    use crate::common::{Recorder, machine};
    use keel::{
        Halt,
        sync::Semaphore,
        thread::{self, ThreadBuilder},
    };
    use proptest::prelude::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    #[test]
    fn handoff() {
        let log = Recorder::new();
        let l = log.clone();
        let report = keel::boot(machine(1).build().unwrap(), move |scheduler| {
            let event = Arc::new(Semaphore::new(scheduler, 0));
            let (e, w) = (event.clone(), l.clone());
            let waiter = ThreadBuilder::new("waiter")
                .spawn(scheduler, move || {
                    w.record("waiting");
                    e.wait();
                    w.record("woken");
                })
                .unwrap();
            scheduler.yield_thread();
            l.record("signal");
            event.signal();
            waiter.join();
            assert_eq!(event.value(), 0);
        })
        .unwrap();
        assert_eq!(log.events(), ["waiting", "signal", "woken"]);
        assert_eq!(report.stranded, 0);
        assert_eq!(report.halt, Halt::Quiescent);
    }

    #[test]
    fn permits_are_counted() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        keel::boot(machine(2).build().unwrap(), move |scheduler| {
            let sema = Semaphore::new(scheduler, 3);
            sema.wait();
            sema.wait();
            sema.signal();
            s.store(sema.value(), Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocked_forever_is_stranded() {
        let report = keel::boot(machine(2).build().unwrap(), |scheduler| {
            let never = Arc::new(Semaphore::new(scheduler, 0));
            ThreadBuilder::new("stuck")
                .spawn(scheduler, move || never.wait())
                .unwrap();
            scheduler.yield_thread();
        })
        .unwrap();
        assert_eq!(report.stranded, 1);
        assert_eq!(report.halt, Halt::Quiescent);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn never_hands_out_more_than_it_got(
            cpus in 1usize..=3,
            initial in 0usize..3,
            consumers in 1usize..4,
            rounds in 1usize..6,
            seed in any::<u64>(),
        ) {
            let given = Arc::new(AtomicUsize::new(0));
            let taken = Arc::new(AtomicUsize::new(0));
            let violated = Arc::new(AtomicBool::new(false));
            let last_value = Arc::new(AtomicUsize::new(usize::MAX));

            let (g, t, v, lv) = (given.clone(), taken.clone(), violated.clone(), last_value.clone());
            let config = machine(cpus)
                .random_yield(seed)
                .time_limit(50_000_000)
                .build()
                .unwrap();
            let report = keel::boot(config, move |scheduler| {
                let sema = Arc::new(Semaphore::new(scheduler, initial));
                let mut handles = Vec::new();
                for i in 0..consumers {
                    let (sema, g, t, v) = (sema.clone(), g.clone(), t.clone(), v.clone());
                    let handle = ThreadBuilder::new(format!("consumer-{i}"))
                        .spawn(scheduler, move || {
                            for _ in 0..rounds {
                                sema.wait();
                                let taken = t.fetch_add(1, Ordering::SeqCst) + 1;
                                if taken > initial + g.load(Ordering::SeqCst) {
                                    v.store(true, Ordering::SeqCst);
                                }
                            }
                        })
                        .unwrap();
                    handles.push(handle);
                }
                for _ in 0..consumers * rounds {
                    g.fetch_add(1, Ordering::SeqCst);
                    sema.signal();
                    thread::pass_time();
                }
                handles.into_iter().for_each(|h| h.join());
                lv.store(sema.value(), Ordering::SeqCst);
            })
            .unwrap();

            prop_assert_eq!(report.halt, Halt::Quiescent);
            prop_assert!(!violated.load(Ordering::SeqCst));
            prop_assert_eq!(taken.load(Ordering::SeqCst), consumers * rounds);
            prop_assert_eq!(last_value.load(Ordering::SeqCst), initial);
        }
    }
}

pub mod lock {
    use crate::common::machine;
    use keel::{
        KernelError,
        sync::Lock,
        thread::{self, ThreadBuilder},
    };
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    #[test]
    fn excludes_across_cpus() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 50;
        let counter = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let (c, o) = (counter.clone(), overlap.clone());
        let config = machine(4)
            .random_yield(7)
            .time_limit(50_000_000)
            .build()
            .unwrap();
        keel::boot(config, move |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            let inside = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let (lock, inside, c, o) = (lock.clone(), inside.clone(), c.clone(), o.clone());
                    ThreadBuilder::new(format!("worker-{i}"))
                        .spawn(scheduler, move || {
                            for _ in 0..ROUNDS {
                                lock.acquire();
                                if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                    o.store(true, Ordering::SeqCst);
                                }
                                let v = c.load(Ordering::SeqCst);
                                thread::pass_time();
                                c.store(v + 1, Ordering::SeqCst);
                                inside.fetch_sub(1, Ordering::SeqCst);
                                lock.release();
                            }
                        })
                        .unwrap()
                })
                .collect();
            handles.into_iter().for_each(|h| h.join());
        })
        .unwrap();
        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), THREADS * ROUNDS);
    }

    #[test]
    fn tracks_its_holder() {
        let held = Arc::new(AtomicUsize::new(0));
        let h = held.clone();
        keel::boot(machine(1).build().unwrap(), move |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            lock.acquire();
            if lock.is_held_by_current_thread() {
                h.fetch_add(1, Ordering::SeqCst);
            }
            let (l, h2) = (lock.clone(), h.clone());
            let other = ThreadBuilder::new("other")
                .spawn(scheduler, move || {
                    if !l.is_held_by_current_thread() {
                        h2.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
            other.join();
            lock.release();
            if !lock.is_held_by_current_thread() {
                h.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert_eq!(held.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn recursive_acquire_is_fatal() {
        let result = keel::boot(machine(1).build().unwrap(), |scheduler| {
            let lock = Lock::new(scheduler);
            lock.acquire();
            lock.acquire();
        });
        match result {
            Err(KernelError::Panic(msg)) => {
                assert!(msg.contains("thread `main` already holds the lock"), "{msg}")
            }
            other => panic!("expected a kernel panic, got {other:?}"),
        }
    }

    #[test]
    fn release_by_non_holder_is_fatal() {
        let result = keel::boot(machine(2).build().unwrap(), |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            let l = lock.clone();
            ThreadBuilder::new("holder")
                .spawn(scheduler, move || l.acquire())
                .unwrap()
                .join();
            lock.release();
        });
        match result {
            Err(KernelError::Panic(msg)) => assert!(msg.contains("does not hold the lock"), "{msg}"),
            other => panic!("expected a kernel panic, got {other:?}"),
        }
    }
}

pub mod condition {
    use crate::common::{Recorder, machine};
    use keel::{
        Halt, KernelError,
        sync::{Condition, Lock},
        thread::ThreadBuilder,
    };
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    fn waiters(cpus: usize, count: usize, wake: fn(&Condition)) -> Vec<String> {
        let log = Recorder::new();
        let l = log.clone();
        keel::boot(machine(cpus).build().unwrap(), move |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            let cond = Arc::new(Condition::new(scheduler, lock.clone()));
            let handles: Vec<_> = (0..count)
                .map(|i| {
                    let (cond, l) = (cond.clone(), l.clone());
                    ThreadBuilder::new(format!("waiter-{i}"))
                        .spawn(scheduler, move || {
                            cond.lock().acquire();
                            l.record(format!("wait {i}"));
                            cond.wait();
                            l.record(format!("woken {i}"));
                            cond.lock().release();
                        })
                        .unwrap()
                })
                .collect();
            while l.len() < count {
                scheduler.yield_thread();
                keel::thread::pass_time();
            }
            lock.acquire();
            wake(&cond);
            lock.release();
            handles.into_iter().for_each(|h| h.join());
        })
        .unwrap();
        log.events()
    }

    fn expected(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("wait {i}"))
            .chain((0..count).map(|i| format!("woken {i}")))
            .collect()
    }

    #[test]
    fn broadcast_wakes_in_wait_order() {
        assert_eq!(waiters(1, 5, Condition::broadcast), expected(5));
    }

    #[test]
    fn broadcast_wakes_everybody() {
        let mut woken: Vec<_> = waiters(2, 5, Condition::broadcast)
            .into_iter()
            .filter(|e| e.starts_with("woken"))
            .collect();
        woken.sort();
        assert_eq!(woken, expected(5)[5..]);
    }

    #[test]
    fn signals_wake_in_wait_order() {
        let signal_each = |cond: &Condition| {
            for _ in 0..3 {
                cond.signal();
            }
        };
        assert_eq!(waiters(1, 3, signal_each), expected(3));
    }

    #[test]
    fn signal_without_waiters_is_lost() {
        let log = Recorder::new();
        let l = log.clone();
        let report = keel::boot(machine(1).build().unwrap(), move |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            let cond = Arc::new(Condition::new(scheduler, lock.clone()));
            lock.acquire();
            cond.signal();
            lock.release();
            let (cond, l) = (cond.clone(), l.clone());
            ThreadBuilder::new("late")
                .spawn(scheduler, move || {
                    cond.lock().acquire();
                    l.record("waiting");
                    cond.wait();
                    l.record("woken");
                })
                .unwrap();
        })
        .unwrap();
        assert_eq!(log.events(), ["waiting"]);
        assert_eq!(report.stranded, 1);
    }

    #[test]
    fn wait_requires_the_lock() {
        let result = keel::boot(machine(1).build().unwrap(), |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            Condition::new(scheduler, lock).wait();
        });
        match result {
            Err(KernelError::Panic(msg)) => {
                assert!(msg.contains("Condition::wait"), "{msg}");
                assert!(msg.contains("does not hold the lock"), "{msg}");
            }
            other => panic!("expected a kernel panic, got {other:?}"),
        }
    }

    #[test]
    fn interrupt_handler_may_signal() {
        let log = Recorder::new();
        let l = log.clone();
        let config = machine(1).time_limit(1_000_000).build().unwrap();
        let report = keel::boot(config, move |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            let cond = Arc::new(Condition::new(scheduler, lock.clone()));
            let cpu = scheduler.machine().cpu(0).clone();
            let fired = Arc::new(AtomicBool::new(false));
            let (c, f) = (cond.clone(), fired.clone());
            cpu.set_timer_handler(move |_frame| {
                f.store(true, Ordering::SeqCst);
                c.signal();
            });

            lock.acquire();
            l.record("waiting");
            cpu.start_timer();
            // No other thread exists, so only the handler can wake us.
            cond.wait();
            cpu.stop_timer();
            l.record(if fired.load(Ordering::SeqCst) { "woken" } else { "spurious" });
            lock.release();
        })
        .unwrap();
        assert_eq!(log.events(), ["waiting", "woken"]);
        assert_eq!(report.stranded, 0);
        assert_eq!(report.halt, Halt::Quiescent);
    }

    #[test]
    fn signal_requires_the_lock() {
        let result = keel::boot(machine(1).build().unwrap(), |scheduler| {
            let lock = Arc::new(Lock::new(scheduler));
            Condition::new(scheduler, lock).signal();
        });
        match result {
            Err(KernelError::Panic(msg)) => {
                assert!(msg.contains("Condition::signal"), "{msg}");
                assert!(msg.contains("does not hold the lock"), "{msg}");
            }
            other => panic!("expected a kernel panic, got {other:?}"),
        }
    }
}
