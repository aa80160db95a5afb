//! Execution contexts for stackful work units
//!
//! A context is a dedicated native thread that stays parked except while the
//! unit it hosts holds the baton. The dispatching execution stream hands the
//! baton over and waits until the unit yields, blocks or terminates, so only
//! one side ever runs and scheduling stays cooperative. Because the context
//! is not tied to the stream that resumes it, a suspended unit can be picked
//! up again by any stream (work stealing, migration).
//!
//! Contexts outlive the jobs they run: after a job ends the thread parks
//! again, ready for a revival or, once the unit is freed, for another unit
//! through the [`ContextCache`].

use crate::unit::{self, WorkUnit};
use crate::{fatal, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Entry closure of a work unit (function and argument in one)
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a unit handed the baton back to its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// Voluntary yield, the unit stays ready
    Yield,
    /// Waiting on a synchronization primitive
    Block,
    /// The entry closure returned (or panicked)
    Exit,
}

enum Slot {
    Parked,
    Start(Job, WorkUnit),
    Resume,
    Running,
    Suspended(Suspend),
    Shutdown,
}

struct Baton {
    slot: Mutex<Slot>,
    cv: Condvar,
}

/// Panic payload used to unwind a suspended unit whose context is torn down
struct ContextShutdown;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable access to a context's baton
#[derive(Clone)]
pub(crate) struct ContextHandle {
    baton: Arc<Baton>,
}

impl ContextHandle {
    /// Start a new job on the parked context and wait for it to hand back
    pub(crate) fn start(&self, job: Job, unit: WorkUnit) -> Suspend {
        self.baton.switch_in(Slot::Start(job, unit))
    }

    /// Resume the suspended job and wait for it to hand back
    pub(crate) fn resume(&self) -> Suspend {
        self.baton.switch_in(Slot::Resume)
    }

    /// Called by the running unit: give control back to the stream
    pub(crate) fn suspend(&self, why: Suspend) {
        self.baton.suspend(why)
    }

    /// Stop a parked context; a suspended job is unwound first
    pub(crate) fn shutdown(&self) {
        let mut slot = self.baton.slot.lock();
        if matches!(*slot, Slot::Parked) {
            *slot = Slot::Shutdown;
            self.baton.cv.notify_all();
        }
    }
}

/// A parked native thread able to host one stackful job at a time
pub(crate) struct Context {
    id: u64,
    stack_size: usize,
    handle: ContextHandle,
}

impl Context {
    /// Allocate a new context with its own native stack
    pub(crate) fn spawn(name_prefix: &str, stack_size: usize) -> Result<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let baton = Arc::new(Baton {
            slot: Mutex::new(Slot::Parked),
            cv: Condvar::new(),
        });

        let thread_baton = baton.clone();
        thread::Builder::new()
            .name(format!("{}-ctx-{}", name_prefix, id))
            .stack_size(stack_size)
            .spawn(move || context_main(thread_baton))
            .map_err(|e| {
                Error::ResourceExhausted(format!("cannot allocate execution context: {}", e))
            })?;

        Ok(Self {
            id,
            stack_size,
            handle: ContextHandle { baton },
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut slot = self.handle.baton.slot.lock();
        *slot = Slot::Shutdown;
        self.handle.baton.cv.notify_all();
    }
}

impl Baton {
    fn switch_in(&self, msg: Slot) -> Suspend {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Parked) {
            drop(slot);
            fatal("execution context resumed while it was not parked");
        }
        *slot = msg;
        self.cv.notify_all();

        loop {
            match mem::replace(&mut *slot, Slot::Parked) {
                Slot::Suspended(why) => return why,
                other => {
                    *slot = other;
                    self.cv.wait(&mut slot);
                }
            }
        }
    }

    fn suspend(&self, why: Suspend) {
        let mut slot = self.slot.lock();
        *slot = Slot::Suspended(why);
        self.cv.notify_all();

        loop {
            match *slot {
                Slot::Resume => {
                    *slot = Slot::Running;
                    return;
                }
                Slot::Shutdown => {
                    drop(slot);
                    panic::resume_unwind(Box::new(ContextShutdown));
                }
                _ => self.cv.wait(&mut slot),
            }
        }
    }

    fn wait_start(&self) -> Option<(Job, WorkUnit)> {
        let mut slot = self.slot.lock();
        loop {
            match mem::replace(&mut *slot, Slot::Parked) {
                Slot::Start(job, unit) => {
                    *slot = Slot::Running;
                    return Some((job, unit));
                }
                Slot::Shutdown => {
                    *slot = Slot::Shutdown;
                    return None;
                }
                other => {
                    *slot = other;
                    self.cv.wait(&mut slot);
                }
            }
        }
    }
}

fn context_main(baton: Arc<Baton>) {
    while let Some((job, unit)) = baton.wait_start() {
        let outcome = unit::enter(unit.clone(), || panic::catch_unwind(AssertUnwindSafe(job)));
        if let Err(payload) = outcome {
            if payload.is::<ContextShutdown>() {
                return;
            }
            unit.record_panic(&*payload);
        }
        unit.finish_job();
        drop(unit);
        baton.suspend_exit();
    }
}

impl Baton {
    fn suspend_exit(&self) {
        let mut slot = self.slot.lock();
        *slot = Slot::Suspended(Suspend::Exit);
        self.cv.notify_all();
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Cache of released contexts for reuse by later spawns.
///
/// Contexts keep their native thread and stack while cached, so taking one
/// from the cache skips thread creation entirely.
pub(crate) struct ContextCache {
    contexts: Mutex<Vec<Context>>,
    max_size: usize,
}

impl ContextCache {
    /// Create a cache that holds up to `max_size` contexts.
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            contexts: Mutex::new(Vec::with_capacity(max_size.min(64))),
            max_size,
        }
    }

    /// Take a cached context, if any.
    pub(crate) fn acquire(&self) -> Option<Context> {
        self.contexts.lock().pop()
    }

    /// Return a parked context to the cache.
    pub(crate) fn release(&self, context: Context) {
        let mut cache = self.contexts.lock();
        if cache.len() < self.max_size {
            cache.push(context);
        }
        // else: dropped, its thread exits
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.lock().len()
    }
}
