//! Execution contexts of kernel threads.
//!
//! Each [`Context`] is backed by a host thread. The host thread only runs
//! while a CPU is assigned to the context; otherwise it is parked on the
//! context's gate. Assigning a CPU and opening the gate are done by the
//! dispatch primitives in [`crate::cpu`], so the host scheduler never decides
//! which kernel thread runs.
//!
//! The gate keeps a permit, so a context that is re-dispatched before its
//! host thread actually parked does not miss the wakeup.

use crate::{
    cpu::{Cpu, CpuId},
    machine::{Halt, Machine},
};
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    any::Any,
    cell::RefCell,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

const NO_CPU: usize = usize::MAX;

/// Unwinding payloads used to retire a host thread without a panic message.
#[derive(Debug)]
pub(crate) enum Unwind {
    /// The machine halted.
    Halted,
    /// The context was reclaimed.
    Reclaimed,
}

pub(crate) enum Executor {
    Thread { ctx: Arc<Context>, parker: Parker },
    Idle { cpu: Arc<Cpu> },
}

thread_local! {
    static EXECUTOR: RefCell<Option<Executor>> = const { RefCell::new(None) };
}

pub(crate) fn with_executor<R>(f: impl FnOnce(Option<&Executor>) -> R) -> R {
    EXECUTOR.with(|e| f(e.borrow().as_ref()))
}

pub(crate) fn install_executor(executor: Option<Executor>) {
    EXECUTOR.with(|e| *e.borrow_mut() = executor);
}

/// The execution context of a kernel thread.
pub struct Context {
    id: u64,
    name: String,
    cpu: AtomicUsize,
    reclaimed: AtomicBool,
    unparker: Unparker,
    parker: Mutex<Option<Parker>>,
    pub(crate) machine: Arc<Machine>,
}

impl Context {
    /// Creates a context on `machine`. Identifiers start from 1 and are
    /// unique across all machines of the process.
    pub fn new(machine: &Arc<Machine>, name: impl Into<String>) -> Arc<Self> {
        static ID: AtomicU64 = AtomicU64::new(1);
        let parker = Parker::new();
        let ctx = Arc::new(Self {
            id: ID.fetch_add(1, Ordering::SeqCst),
            name: name.into(),
            cpu: AtomicUsize::new(NO_CPU),
            reclaimed: AtomicBool::new(false),
            unparker: parker.unparker().clone(),
            parker: Mutex::new(Some(parker)),
            machine: machine.clone(),
        });
        machine.register(&ctx);
        ctx
    }

    /// Identifier of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of this context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The CPU this context is assigned to, if any.
    pub fn cpu(&self) -> Option<CpuId> {
        match self.cpu.load(Ordering::SeqCst) {
            NO_CPU => None,
            id => Some(id),
        }
    }

    /// Starts the host thread backing this context.
    ///
    /// `entry` runs on the first dispatch of the context, with interrupts
    /// disabled. It must never return: a kernel thread leaves the CPU by
    /// switching away for good, and its host thread exits when the context
    /// is reclaimed or the machine halts.
    pub fn launch(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let parker = self
            .parker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(parker) = parker else {
            panic!("context `{}` launched twice", self.name);
        };
        let ctx = self.clone();
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || ctx.run(parker, entry))
            .map(|_| ())
    }

    fn run(self: Arc<Self>, parker: Parker, entry: impl FnOnce()) {
        install_executor(Some(Executor::Thread {
            ctx: self.clone(),
            parker,
        }));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.wait_for_dispatch();
            entry();
        }));
        match outcome {
            Ok(()) => self.machine.halt(Halt::Panic(format!(
                "thread `{}` returned from its entry point",
                self.name
            ))),
            Err(payload) if payload.is::<Unwind>() => (),
            Err(payload) => self.machine.halt(Halt::Panic(format!(
                "thread `{}` panicked: {}",
                self.name,
                describe(payload.as_ref())
            ))),
        }
        self.machine.forget(self.id);
        install_executor(None);
    }

    /// Parks the host thread until a CPU is assigned to this context.
    pub(crate) fn wait_for_dispatch(&self) {
        loop {
            if self.machine.is_halted() {
                panic::resume_unwind(Box::new(Unwind::Halted));
            }
            if self.reclaimed.load(Ordering::SeqCst) {
                panic::resume_unwind(Box::new(Unwind::Reclaimed));
            }
            if self.cpu().is_some() {
                return;
            }
            with_executor(|e| match e {
                Some(Executor::Thread { parker, .. }) => parker.park(),
                _ => unreachable!("context `{}` parked from a foreign thread", self.name),
            });
        }
    }

    pub(crate) fn assign(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn unassign(&self) {
        self.cpu.store(NO_CPU, Ordering::SeqCst);
    }

    pub(crate) fn wake(&self) {
        self.unparker.unpark();
    }

    /// Reclaims the execution resources of this context.
    ///
    /// The context must have switched away for good. Its host thread exits
    /// once it observes the reclamation.
    pub fn reclaim(&self) {
        assert!(
            self.cpu().is_none(),
            "reclaiming context `{}` while it runs on cpu{:?}",
            self.name,
            self.cpu()
        );
        self.reclaimed.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }

    /// Whether [`reclaim`] has been called.
    ///
    /// [`reclaim`]: Self::reclaim
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu", &self.cpu())
            .finish()
    }
}

/// The context executing on this host thread, if it runs a kernel thread.
pub fn current() -> Option<Arc<Context>> {
    with_executor(|e| match e {
        Some(Executor::Thread { ctx, .. }) => Some(ctx.clone()),
        _ => None,
    })
}

pub(crate) fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
