mod common;

use common::{Recorder, machine};
use keel::{
    KernelError,
    task::{Task, TaskHandle, TaskManager, TaskState},
    thread::{self, ThreadBuilder},
};
use std::sync::Arc;

fn on_thread(tid: u64) -> bool {
    thread::current().is_some_and(|th| th.tid() == tid)
}

struct Sum {
    upto: u64,
    total: u64,
    parent: u64,
    log: Arc<Recorder<String>>,
}

impl Task for Sum {
    fn do_in_background(&mut self, _handle: &TaskHandle) {
        self.total = (1..=self.upto).sum();
    }

    fn on_completion(self: Box<Self>) {
        self.log.record(format!(
            "sum {} = {} on parent: {}",
            self.upto,
            self.total,
            on_thread(self.parent)
        ));
    }

    fn on_cancellation(self: Box<Self>) {
        self.log.record(format!("sum {} cancelled", self.upto));
    }
}

struct Spin {
    log: Arc<Recorder<String>>,
}

impl Task for Spin {
    fn do_in_background(&mut self, handle: &TaskHandle) {
        while !handle.is_cancelled() {
            thread::pass_time();
            bedrock::halt_point();
        }
    }

    fn on_completion(self: Box<Self>) {
        self.log.record("spin completed".to_string());
    }

    fn on_cancellation(self: Box<Self>) {
        self.log.record("spin cancelled".to_string());
    }
}

#[test]
fn completions_run_on_the_parent() {
    let log = Recorder::new();
    let l = log.clone();
    keel::boot(machine(2).build().unwrap(), move |scheduler| {
        let parent = thread::current().unwrap().tid();
        let manager = TaskManager::new(scheduler);
        let handles: Vec<_> = [10, 100, 1000]
            .into_iter()
            .map(|upto| {
                manager
                    .execute(Sum {
                        upto,
                        total: 0,
                        parent,
                        log: l.clone(),
                    })
                    .unwrap()
            })
            .collect();
        manager.process_requests().unwrap();
        for handle in handles {
            l.record(format!(
                "{:?}, cancel: {}",
                handle.state(),
                handle.cancel()
            ));
        }
        l.record(format!("outstanding: {}", manager.outstanding()));
    })
    .unwrap();

    let mut events = log.events();
    let tail = events.split_off(3);
    events.sort();
    assert_eq!(
        events,
        [
            "sum 10 = 55 on parent: true",
            "sum 100 = 5050 on parent: true",
            "sum 1000 = 500500 on parent: true",
        ]
    );
    assert_eq!(
        tail,
        [
            "Completed, cancel: false",
            "Completed, cancel: false",
            "Completed, cancel: false",
            "outstanding: 0",
        ]
    );
}

#[test]
fn cancelled_task_reports_cancellation() {
    let log = Recorder::new();
    let l = log.clone();
    keel::boot(machine(2).build().unwrap(), move |scheduler| {
        let manager = TaskManager::new(scheduler);
        let handle = manager.execute(Spin { log: l.clone() }).unwrap();
        let first = handle.cancel();
        let second = handle.cancel();
        manager.process_requests().unwrap();
        l.record(format!(
            "{first} {second} {:?} {}",
            handle.state(),
            handle.is_cancelled()
        ));
    })
    .unwrap();
    assert_eq!(log.events(), ["spin cancelled", "true false Cancelled true"]);
}

#[test]
fn only_the_parent_processes_requests() {
    let log = Recorder::new();
    let l = log.clone();
    keel::boot(machine(2).build().unwrap(), move |scheduler| {
        let manager = Arc::new(TaskManager::new(scheduler));
        let (m, l2) = (manager.clone(), l.clone());
        ThreadBuilder::new("stranger")
            .spawn(scheduler, move || {
                l2.record(matches!(
                    m.process_requests(),
                    Err(KernelError::OperationNotPermitted)
                ));
            })
            .unwrap()
            .join();
        l.record(manager.process_requests().is_ok());
    })
    .unwrap();
    assert_eq!(log.events(), [true, true]);
}

#[test]
fn requests_posted_by_any_thread_run_on_the_parent() {
    let log = Recorder::new();
    let l = log.clone();
    keel::boot(machine(2).build().unwrap(), move |scheduler| {
        let parent = thread::current().unwrap().tid();
        let manager = Arc::new(TaskManager::new(scheduler));
        let (m, l2) = (manager.clone(), l.clone());
        ThreadBuilder::new("poster")
            .spawn(scheduler, move || {
                for i in 0..3 {
                    let l = l2.clone();
                    m.post_request(move || {
                        l.record(format!("request {i} on parent: {}", on_thread(parent)))
                    });
                }
            })
            .unwrap()
            .join();
        manager.process_requests().unwrap();
    })
    .unwrap();
    assert_eq!(
        log.events(),
        [
            "request 0 on parent: true",
            "request 1 on parent: true",
            "request 2 on parent: true",
        ]
    );
}
