//! Background tasks that report back to their parent thread.
//!
//! A [`TaskManager`] belongs to the thread that created it, the *parent*.
//! [`TaskManager::execute`] runs a [`Task`] on a fresh thread. When the task
//! is done, the completion callback is not run on the worker: it is posted
//! to the parent as a request, and the parent runs it the next time it calls
//! [`TaskManager::process_requests`]. Any thread may post arbitrary requests
//! with [`TaskManager::post_request`].
//!
//! This keeps every callback on one thread, so the state they touch needs no
//! locking against each other.

use crate::{
    KernelError,
    sync::Semaphore,
    thread::{Scheduler, ThreadBuilder, current, current_or_panic},
};
use crossbeam_queue::SegQueue;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

/// Represents a **task** executed in the background.
pub trait Task: Send + 'static {
    /// The work of the task. Runs on a worker thread.
    ///
    /// Long-running tasks should poll [`TaskHandle::is_cancelled`] and
    /// return early once it is set.
    fn do_in_background(&mut self, handle: &TaskHandle);

    /// Runs on the parent thread once the task completed.
    fn on_completion(self: Box<Self>) {}

    /// Runs on the parent thread instead of [`Task::on_completion`] if the
    /// task was cancelled before it completed.
    fn on_cancellation(self: Box<Self>) {}
}

/// A possible state of a task.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TaskState {
    /// The task has not completed yet.
    Running,
    /// The task was cancelled before it completed.
    Cancelled,
    /// The task completed.
    Completed,
}

/// A handle to a task started with [`TaskManager::execute`].
#[derive(Clone)]
pub struct TaskHandle {
    tid: u64,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    /// Id of the thread that runs the task.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The state of the task.
    pub fn state(&self) -> TaskState {
        match TaskState::try_from(self.state.load(Ordering::SeqCst)) {
            Ok(state) => state,
            Err(e) => unreachable!("task {} has state {}", self.tid, e.number),
        }
    }

    /// Requests the task to stop.
    ///
    /// Returns `false` if the task already completed or was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Cancelled)
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    fn transition(&self, to: TaskState) -> bool {
        self.state
            .compare_exchange(
                TaskState::Running.into(),
                to.into(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

type Request = Box<dyn FnOnce() + Send>;

struct Shared {
    requests: SegQueue<Request>,
    posted: Semaphore,
    outstanding: AtomicUsize,
}

impl Shared {
    fn post(&self, request: Request) {
        self.requests.push(request);
        self.posted.signal();
    }
}

/// Runs tasks in the background on behalf of a parent thread.
pub struct TaskManager {
    scheduler: Arc<Scheduler>,
    parent: u64,
    shared: Arc<Shared>,
}

impl TaskManager {
    /// Creates a task manager whose parent is the calling thread.
    #[track_caller]
    pub fn new(scheduler: &Arc<Scheduler>) -> Self {
        let parent = current_or_panic("TaskManager::new");
        Self {
            scheduler: scheduler.clone(),
            parent: parent.tid(),
            shared: Arc::new(Shared {
                requests: SegQueue::new(),
                posted: Semaphore::new(scheduler, 0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs `task` on a new thread.
    pub fn execute(&self, task: impl Task) -> Result<TaskHandle, KernelError> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::SeqCst);

        let builder = ThreadBuilder::new(format!("task-{seq}"));
        let shared = self.shared.clone();
        let state = Arc::new(AtomicU8::new(TaskState::Running.into()));
        let worker_state = state.clone();
        let th = builder.build(&self.scheduler, move || {
            let handle = TaskHandle {
                tid: current().map_or(0, |th| th.tid()),
                state: worker_state,
            };
            let mut task = Box::new(task);
            task.do_in_background(&handle);
            let completed = handle.transition(TaskState::Completed);
            let s = shared.clone();
            shared.post(Box::new(move || {
                if completed {
                    task.on_completion();
                } else {
                    task.on_cancellation();
                }
                s.outstanding.fetch_sub(1, Ordering::SeqCst);
            }));
        })?;
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let handle = TaskHandle {
            tid: th.tid(),
            state,
        };
        debug!(THREAD, "task {} started", handle.tid);
        self.scheduler.ready_to_run(th);
        Ok(handle)
    }

    /// Posts `request` to be run by the parent thread.
    pub fn post_request(&self, request: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(request));
    }

    /// Number of tasks whose completion has not been processed yet.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Runs posted requests until no request is pending and every task
    /// started by this manager has been processed.
    ///
    /// # Errors
    ///
    /// [`KernelError::OperationNotPermitted`] if the caller is not the
    /// parent thread.
    pub fn process_requests(&self) -> Result<(), KernelError> {
        if current().map(|th| th.tid()) != Some(self.parent) {
            return Err(KernelError::OperationNotPermitted);
        }
        loop {
            if self.outstanding() == 0 && self.shared.requests.is_empty() {
                return Ok(());
            }
            self.shared.posted.wait();
            if let Some(request) = self.shared.requests.pop() {
                request();
            }
        }
    }
}
