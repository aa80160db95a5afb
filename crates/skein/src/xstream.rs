//! Execution streams
//!
//! An execution stream is a native thread that runs one scheduler at a
//! time. Secondary streams own a worker thread running
//! `init -> run -> finalize` and swap schedulers between runs when asked to.
//!
//! The primary stream (rank 0) is the thread that initialized the runtime.
//! It has no worker of its own: whenever that thread blocks inside the
//! runtime (joining a unit, waiting on a primitive, finalizing) it runs its
//! scheduler until the wait is over, so units queued on the primary stream
//! make progress exactly while the main thread waits for them.

use crate::pool::Pool;
use crate::runtime::RuntimeInner;
use crate::sched::Scheduler;
use crate::sync::Latch;
use crate::unit::{self, WorkUnit};
use crate::{Error, Result};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

thread_local! {
    /// Stream whose scheduler runs on this thread
    static CURRENT_STREAM: RefCell<Option<ExecutionStream>> = const { RefCell::new(None) };

    /// Set while this thread is inside a scheduler (no nested help loops)
    static IN_SCHEDULER: Cell<bool> = const { Cell::new(false) };
}

/// Lifecycle state of an execution stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Running its scheduler
    Running,
    /// Asked to stop; draining its pools
    Joining,
    /// Worker finished
    Terminated,
}

/// Handle to an execution stream
#[derive(Clone)]
pub struct ExecutionStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    rank: usize,
    primary: bool,
    state: AtomicCell<StreamState>,

    /// Scheduler currently in charge
    sched: Mutex<Scheduler>,

    /// Scheduler to switch to at the next swap point
    pending: Mutex<Option<Scheduler>>,

    thread: Mutex<Option<JoinHandle<()>>>,
    terminated: Latch,
    freed: AtomicBool,
    runtime: Weak<RuntimeInner>,
}

struct SchedulerScope {
    prev: bool,
}

impl SchedulerScope {
    fn enter() -> Self {
        Self {
            prev: IN_SCHEDULER.with(|f| f.replace(true)),
        }
    }
}

impl Drop for SchedulerScope {
    fn drop(&mut self) {
        IN_SCHEDULER.with(|f| f.set(self.prev));
    }
}

/// Rank of the stream the caller runs on
pub fn current_rank() -> Option<usize> {
    if let Some(unit) = unit::current() {
        return unit.stream_rank();
    }
    CURRENT_STREAM.with(|c| c.borrow().as_ref().map(ExecutionStream::rank))
}

impl ExecutionStream {
    /// The stream the caller runs on
    pub fn current() -> Option<ExecutionStream> {
        if let Some(unit) = unit::current() {
            let rank = unit.stream_rank()?;
            return unit.runtime()?.stream(rank);
        }
        CURRENT_STREAM.with(|c| c.borrow().clone())
    }

    fn build(rank: usize, primary: bool, runtime: Weak<RuntimeInner>, sched: Scheduler) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                rank,
                primary,
                state: AtomicCell::new(StreamState::Running),
                sched: Mutex::new(sched),
                pending: Mutex::new(None),
                thread: Mutex::new(None),
                terminated: Latch::new(),
                freed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Rank, unique within the runtime (the primary stream is 0)
    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    /// Whether this is the primary stream
    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    /// Lifecycle state
    pub fn state(&self) -> StreamState {
        self.inner.state.load()
    }

    /// Scheduler currently in charge
    pub fn scheduler(&self) -> Scheduler {
        self.inner.sched.lock().clone()
    }

    /// Pools of the current scheduler
    pub fn main_pools(&self) -> Vec<Pool> {
        self.scheduler().pools().to_vec()
    }

    /// Whether two handles refer to the same stream
    pub fn ptr_eq(&self, other: &ExecutionStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stop the stream once its pools are drained and wait for it.
    ///
    /// A stackful caller is suspended while waiting; a plain thread parks.
    pub fn join(&self) -> Result<()> {
        if self.is_primary() {
            return Err(Error::InvalidState(
                "the primary execution stream cannot be joined".into(),
            ));
        }
        self.check_not_freed()?;
        if Self::current().is_some_and(|s| s.ptr_eq(self)) {
            return Err(Error::InvalidState(format!(
                "execution stream {} cannot join itself",
                self.rank()
            )));
        }

        let _ = self
            .inner
            .state
            .compare_exchange(StreamState::Running, StreamState::Joining);
        self.scheduler().request_stop();
        self.inner.terminated.wait()?;

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(rank = self.rank(), "execution stream worker panicked");
            }
        }
        Ok(())
    }

    /// Release a joined stream (and its scheduler if it is automatic)
    pub fn free(&self) -> Result<()> {
        if self.is_primary() {
            return Err(Error::InvalidState(
                "the primary execution stream is released by Runtime::finalize".into(),
            ));
        }
        if self.state() != StreamState::Terminated {
            return Err(Error::InvalidState(format!(
                "execution stream {} must be joined before it is freed",
                self.rank()
            )));
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!(
                "execution stream {} already freed",
                self.rank()
            )));
        }

        if let Some(rt) = self.inner.runtime.upgrade() {
            rt.remove_stream(self.rank());
        }
        let sched = self.scheduler();
        if sched.config().automatic {
            if let Err(e) = sched.free() {
                warn!(rank = self.rank(), sched = %sched.id(), error = %e, "automatic scheduler not freed");
            }
        }
        debug!(rank = self.rank(), "execution stream freed");
        Ok(())
    }

    /// Replace the stream's scheduler.
    ///
    /// On the primary thread outside of any scheduler the current scheduler
    /// is drained on the spot and the swap happens right away. Otherwise the
    /// current scheduler is asked to stop and the new one takes over once it
    /// has drained its pools and left its loop.
    pub fn set_main_scheduler(&self, sched: &Scheduler) -> Result<()> {
        self.check_not_freed()?;
        if self.state() != StreamState::Running {
            return Err(Error::InvalidState(format!(
                "execution stream {} is {:?}",
                self.rank(),
                self.state()
            )));
        }
        let current = self.scheduler();
        if current.ptr_eq(sched) {
            return Ok(());
        }
        sched.bind(self.rank())?;

        if self.is_primary() && self.is_idle_primary_thread() {
            if let Err(e) = self.drain_primary(&current) {
                sched.unbind(self.rank());
                return Err(e);
            }
            *self.inner.sched.lock() = sched.clone();
            if let Err(e) = current.finalize(self) {
                warn!(rank = self.rank(), sched = %current.id(), error = %e, "scheduler finalize failed");
            }
            self.retire(&current);
            debug!(rank = self.rank(), from = %current.id(), to = %sched.id(), "main scheduler replaced");
            return Ok(());
        }

        let previous = self.inner.pending.lock().replace(sched.clone());
        if let Some(previous) = previous {
            previous.unbind(self.rank());
        }
        current.request_stop();
        debug!(rank = self.rank(), to = %sched.id(), "main scheduler swap deferred");
        Ok(())
    }

    /// Send `unit` to this stream's migration pool (or its first pool)
    pub fn migrate_unit(&self, unit: &WorkUnit) -> Result<()> {
        let sched = self.scheduler();
        let pool = sched
            .migration_pool()
            .or_else(|| sched.pools().first().cloned())
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "execution stream {} has no pool to migrate into",
                    self.rank()
                ))
            })?;
        unit.migrate_to(&pool)
    }

    // ---- crate-internal ----

    /// Register the calling thread as the primary stream
    pub(crate) fn new_primary(runtime: Weak<RuntimeInner>, sched: Scheduler) -> Self {
        Self::build(0, true, runtime, sched)
    }

    pub(crate) fn install_current(&self) {
        let previous = CURRENT_STREAM.with(|c| c.replace(Some(self.clone())));
        drop(previous);
    }

    /// Clear the calling thread's stream if it is this one
    pub(crate) fn uninstall_current(&self) {
        let _ = CURRENT_STREAM.try_with(|c| {
            let ours = c.borrow().as_ref().is_some_and(|s| s.ptr_eq(self));
            if ours {
                c.borrow_mut().take()
            } else {
                None
            }
        });
    }

    /// Whether the calling thread already hosts a stream
    pub(crate) fn thread_has_stream() -> bool {
        CURRENT_STREAM.with(|c| c.borrow().is_some())
    }

    /// Spawn a secondary stream running `sched`
    pub(crate) fn spawn(runtime: &Arc<RuntimeInner>, rank: usize, sched: &Scheduler) -> Result<Self> {
        sched.bind(rank)?;
        let stream = Self::build(rank, false, Arc::downgrade(runtime), sched.clone());

        let worker = stream.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-xstream-{}", runtime.config.thread_name_prefix, rank))
            .spawn(move || worker.worker_main());

        match spawned {
            Ok(handle) => {
                *stream.inner.thread.lock() = Some(handle);
                Ok(stream)
            }
            Err(e) => {
                sched.unbind(rank);
                Err(Error::ResourceExhausted(format!(
                    "cannot spawn execution stream {}: {}",
                    rank, e
                )))
            }
        }
    }

    /// Ask the stream to stop once drained (runtime teardown)
    pub(crate) fn request_stop(&self) {
        let _ = self
            .inner
            .state
            .compare_exchange(StreamState::Running, StreamState::Joining);
        self.scheduler().request_stop();
    }

    fn worker_main(self) {
        self.install_current();
        let _scope = SchedulerScope::enter();
        let rank = self.rank();
        info!(rank, "execution stream started");

        loop {
            let sched = self.scheduler();
            match sched.initialize(&self) {
                Ok(()) => sched.run(&self, None),
                Err(e) => error!(rank, sched = %sched.id(), error = %e, "scheduler init failed"),
            }
            if self.apply_pending_swap() {
                continue;
            }
            if let Err(e) = sched.finalize(&self) {
                warn!(rank, sched = %sched.id(), error = %e, "scheduler finalize failed");
            }
            break;
        }

        self.terminate();
        self.uninstall_current();
        info!(rank, "execution stream terminated");
    }

    fn terminate(&self) {
        let rank = self.rank();
        self.scheduler().unbind(rank);
        let pending = self.inner.pending.lock().take();
        if let Some(pending) = pending {
            pending.unbind(rank);
        }
        self.inner.state.store(StreamState::Terminated);
        self.inner.terminated.set();
    }

    /// Switch to the pending scheduler, if any; the old one must not be running
    fn apply_pending_swap(&self) -> bool {
        let Some(next) = self.inner.pending.lock().take() else {
            return false;
        };
        let old = std::mem::replace(&mut *self.inner.sched.lock(), next.clone());
        if let Err(e) = old.finalize(self) {
            warn!(rank = self.rank(), sched = %old.id(), error = %e, "scheduler finalize failed");
        }
        self.retire(&old);
        if self.state() == StreamState::Joining {
            next.request_stop();
        }
        debug!(rank = self.rank(), from = %old.id(), to = %next.id(), "main scheduler replaced");
        true
    }

    /// Detach a scheduler that no longer runs here
    fn retire(&self, old: &Scheduler) {
        old.unbind(self.rank());
        if old.config().automatic {
            if let Err(e) = old.free() {
                warn!(rank = self.rank(), sched = %old.id(), error = %e, "automatic scheduler not freed");
            }
        }
    }

    /// Run `sched` on the calling primary thread until its pools are empty
    fn drain_primary(&self, sched: &Scheduler) -> Result<()> {
        let _scope = SchedulerScope::enter();
        sched.request_stop();
        sched.initialize(self)?;
        sched.run(self, None);
        Ok(())
    }

    fn is_idle_primary_thread(&self) -> bool {
        !IN_SCHEDULER.with(Cell::get)
            && unit::current().is_none()
            && CURRENT_STREAM.with(|c| c.borrow().as_ref().is_some_and(|s| s.ptr_eq(self)))
    }

    /// Drain the primary stream and finalize its scheduler (runtime teardown)
    pub(crate) fn shutdown_primary(&self) -> Result<()> {
        let _scope = SchedulerScope::enter();
        self.inner.state.store(StreamState::Joining);

        loop {
            self.apply_pending_swap();
            let sched = self.scheduler();
            sched.request_stop();
            sched.initialize(self)?;
            sched.run(self, None);
            if self.inner.pending.lock().is_none() {
                break;
            }
        }

        let sched = self.scheduler();
        let result = sched.finalize(self);
        self.retire(&sched);
        self.inner.state.store(StreamState::Terminated);
        self.inner.terminated.set();
        result
    }

    fn check_not_freed(&self) -> Result<()> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "execution stream {} already freed",
                self.rank()
            )));
        }
        Ok(())
    }
}

/// Run the primary stream's scheduler until `done` holds.
///
/// Returns false (without waiting) when the caller is not the primary
/// thread outside of its scheduler; the caller must then block by other
/// means.
pub(crate) fn help_primary_until(done: &dyn Fn() -> bool) -> bool {
    if IN_SCHEDULER.with(Cell::get) || unit::current().is_some() {
        return false;
    }
    let stream = match CURRENT_STREAM.with(|c| c.borrow().clone()) {
        Some(stream) if stream.is_primary() => stream,
        _ => return false,
    };

    let _scope = SchedulerScope::enter();
    while !done() {
        stream.apply_pending_swap();
        let sched = stream.scheduler();
        if let Err(e) = sched.initialize(&stream) {
            error!(rank = 0, sched = %sched.id(), error = %e, "scheduler init failed");
            return false;
        }
        sched.run(&stream, Some(done));
        if !done() {
            thread::sleep(sched.config().idle_sleep);
        }
    }
    true
}

impl fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("rank", &self.rank())
            .field("primary", &self.is_primary())
            .field("state", &self.state())
            .finish()
    }
}
