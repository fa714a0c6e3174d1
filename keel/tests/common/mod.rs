#![allow(dead_code)]

use keel::{
    SystemConfiguration, SystemConfigurationBuilder, interrupt::InterruptGuard, sync::SpinLock,
    thread,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// An ordered log of events, shared between kernel threads and the test.
pub struct Recorder<T> {
    events: SpinLock<Vec<T>>,
}

impl<T: Clone + Send> Recorder<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: SpinLock::new(Vec::new()),
        })
    }

    pub fn record(&self, event: T) {
        let _irq = InterruptGuard::new();
        let mut events = self.events.lock();
        events.push(event);
        events.unlock();
    }

    pub fn len(&self) -> usize {
        let _irq = InterruptGuard::new();
        let events = self.events.lock();
        let len = events.len();
        events.unlock();
        len
    }

    pub fn events(&self) -> Vec<T> {
        let _irq = InterruptGuard::new();
        let events = self.events.lock();
        let copy = events.clone();
        events.unlock();
        copy
    }
}

pub fn machine(cpus: usize) -> SystemConfigurationBuilder {
    SystemConfiguration::builder().cpus(cpus)
}

/// Busy-waits until `flag` is set, letting simulated time pass.
pub fn spin_until(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        thread::pass_time();
        bedrock::halt_point();
        std::hint::spin_loop();
    }
}
