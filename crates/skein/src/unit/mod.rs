//! Work units
//!
//! A work unit is the schedulable entity of the runtime. Stackful units
//! (ULTs) own an execution context and may yield, block and migrate between
//! execution streams. Stackless units (tasklets) run to completion on the
//! dispatching stream and never suspend.
//!
//! # State machine
//!
//! ```text
//! Ready -> Running -> Terminated
//!   ^         |  \
//!   |         v   Notified (woken before it finished switching out)
//!   +----- Blocked
//! ```
//!
//! A `Terminated` stackful unit can be revived back to `Ready`.

mod context;

pub(crate) use context::ContextCache;
pub(crate) use context::{Context, Job};

use crate::pool::{Pool, PoolInner};
use crate::runtime::RuntimeInner;
use crate::sync::Latch;
use crate::{fatal, Error, Result};
use context::{panic_message, ContextHandle, Suspend};
use crossbeam::atomic::AtomicCell;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace, warn};

/// Unique identifier for a work unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

impl UnitId {
    pub(crate) fn new() -> Self {
        UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Kind of work unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// Owns an execution context; may yield, block and migrate
    Stackful,
    /// Runs to completion on the dispatching stream
    Stackless,
}

/// Observable state of a work unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitState {
    /// Queued in a pool (or about to be)
    Ready,
    /// Executing on a stream
    Running,
    /// Suspended on a synchronization primitive
    Blocked,
    /// Entry closure returned
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RawState {
    Ready,
    Running,
    /// Woken while still running, must not block on its next suspension
    Notified,
    Blocked,
    Terminated,
}

/// Creation attributes of a work unit
#[derive(Debug, Clone)]
pub struct UnitAttr {
    /// Stackful or stackless
    pub kind: UnitKind,

    /// Whether the unit may move to another pool or be stolen
    pub migratable: bool,

    /// Ordering hint for priority pools (higher runs first)
    pub priority: i32,

    /// Stack size of the execution context (runtime default if `None`)
    pub stack_size: Option<usize>,
}

impl Default for UnitAttr {
    fn default() -> Self {
        Self {
            kind: UnitKind::Stackful,
            migratable: true,
            priority: 0,
            stack_size: None,
        }
    }
}

impl UnitAttr {
    /// Attributes of a stackless unit
    pub fn tasklet() -> Self {
        Self {
            kind: UnitKind::Stackless,
            migratable: false,
            ..Self::default()
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set migratability
    pub fn with_migratable(mut self, migratable: bool) -> Self {
        self.migratable = migratable;
        self
    }

    /// Set the execution context stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.kind {
            UnitKind::Stackful => {
                if let Some(size) = self.stack_size {
                    if size < crate::config::MIN_STACK_SIZE {
                        return Err(Error::InvalidArgument(format!(
                            "stack size {} is below the minimum of {} bytes",
                            size,
                            crate::config::MIN_STACK_SIZE
                        )));
                    }
                }
            }
            UnitKind::Stackless => {
                if self.migratable {
                    return Err(Error::InvalidArgument(
                        "stackless units cannot be migratable".into(),
                    ));
                }
                if self.stack_size.is_some() {
                    return Err(Error::InvalidArgument(
                        "stackless units have no stack".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Handle to a work unit
#[derive(Clone)]
pub struct WorkUnit {
    inner: Arc<UnitInner>,
}

pub(crate) struct UnitInner {
    id: UnitId,
    kind: UnitKind,
    priority: i32,

    migratable: AtomicBool,
    state: AtomicCell<RawState>,

    /// Entry closure, consumed by the first dispatch after spawn/revive
    entry: Mutex<Option<Job>>,

    /// Execution context (stackful only), kept across revivals
    context: Mutex<Option<Context>>,

    /// Pool the unit is queued in
    pool: Mutex<Option<Weak<PoolInner>>>,

    /// Pool the unit was last queued in; target of yields and wake-ups
    last_pool: Mutex<Option<Weak<PoolInner>>>,

    /// Destination recorded by a migration request
    migrate_to: Mutex<Option<Weak<PoolInner>>>,

    /// Rank of the stream that last dispatched the unit
    stream_rank: AtomicCell<Option<usize>>,

    termination: Latch,
    freed: AtomicBool,
    panicked: AtomicBool,
    revivals: AtomicUsize,

    runtime: Weak<RuntimeInner>,
}

thread_local! {
    static CURRENT_UNIT: RefCell<Option<WorkUnit>> = const { RefCell::new(None) };
}

/// The work unit running on the calling thread, if any
pub fn current() -> Option<WorkUnit> {
    CURRENT_UNIT.with(|c| c.borrow().clone())
}

/// Run `f` with `unit` installed as the current unit of this thread
pub(crate) fn enter<R>(unit: WorkUnit, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_UNIT.with(|c| c.replace(Some(unit)));
    let result = f();
    let ours = CURRENT_UNIT.with(|c| c.replace(prev));
    drop(ours);
    result
}

/// Give control back to the scheduler; the calling unit stays ready.
///
/// The unit is re-queued into the pool it came from (or into the pool a
/// pending migration names).
pub fn yield_now() -> Result<()> {
    let unit = current()
        .ok_or_else(|| Error::InvalidState("yield_now called outside of a work unit".into()))?;
    if unit.kind() == UnitKind::Stackless {
        return Err(Error::Unsupported(format!("tasklet {} cannot yield", unit.id())));
    }
    let handle = unit.context_handle();
    trace!(unit = %unit.id(), "yield");
    handle.suspend(Suspend::Yield);
    Ok(())
}

/// Create a unit and queue it into `pool`
pub(crate) fn create(
    runtime: &Arc<RuntimeInner>,
    pool: &Pool,
    attr: UnitAttr,
    job: Job,
) -> Result<WorkUnit> {
    attr.validate()?;
    if pool.is_destroyed() {
        return Err(Error::InvalidArgument(format!("{} is destroyed", pool.id())));
    }
    pool.check_producer()?;

    let context = match attr.kind {
        UnitKind::Stackful => Some(runtime.acquire_context(attr.stack_size)?),
        UnitKind::Stackless => None,
    };

    let unit = WorkUnit {
        inner: Arc::new(UnitInner {
            id: UnitId::new(),
            kind: attr.kind,
            priority: attr.priority,
            migratable: AtomicBool::new(attr.migratable),
            state: AtomicCell::new(RawState::Ready),
            entry: Mutex::new(Some(job)),
            context: Mutex::new(context),
            pool: Mutex::new(None),
            last_pool: Mutex::new(None),
            migrate_to: Mutex::new(None),
            stream_rank: AtomicCell::new(None),
            termination: Latch::new(),
            freed: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            revivals: AtomicUsize::new(0),
            runtime: Arc::downgrade(runtime),
        }),
    };

    if let Err(e) = pool.enqueue(unit.clone()) {
        unit.release_context();
        return Err(Error::InvalidArgument(e.to_string()));
    }
    runtime.register_unit(&unit);
    trace!(unit = %unit.id(), pool = %pool.id(), kind = ?attr.kind, "spawned");
    Ok(unit)
}

impl WorkUnit {
    /// Unit identifier
    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    /// Stackful or stackless
    pub fn kind(&self) -> UnitKind {
        self.inner.kind
    }

    /// Current state
    pub fn state(&self) -> UnitState {
        match self.inner.state.load() {
            RawState::Ready => UnitState::Ready,
            RawState::Running | RawState::Notified => UnitState::Running,
            RawState::Blocked => UnitState::Blocked,
            RawState::Terminated => UnitState::Terminated,
        }
    }

    /// Priority used by priority pools
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// Whether the unit may be stolen or migrated
    pub fn is_migratable(&self) -> bool {
        self.inner.migratable.load(Ordering::Acquire)
    }

    /// Change migratability (stackful units only)
    pub fn set_migratable(&self, migratable: bool) -> Result<()> {
        if self.kind() == UnitKind::Stackless {
            return Err(Error::Unsupported(format!(
                "tasklet {} is never migratable",
                self.id()
            )));
        }
        self.inner.migratable.store(migratable, Ordering::Release);
        Ok(())
    }

    /// Pool the unit is queued in, if it is queued
    pub fn pool(&self) -> Option<Pool> {
        upgrade(&self.inner.pool)
    }

    /// Pool the unit returns to when it yields or is woken
    pub fn last_pool(&self) -> Option<Pool> {
        upgrade(&self.inner.last_pool)
    }

    /// Rank of the stream that last ran the unit
    pub fn stream_rank(&self) -> Option<usize> {
        self.inner.stream_rank.load()
    }

    /// How many times the unit was revived
    pub fn revivals(&self) -> usize {
        self.inner.revivals.load(Ordering::Acquire)
    }

    /// Whether the last run of the entry closure panicked
    pub fn panicked(&self) -> bool {
        self.inner.panicked.load(Ordering::Acquire)
    }

    /// Identifier of the execution context, stable across revivals
    pub fn context_id(&self) -> Option<u64> {
        self.inner.context.lock().as_ref().map(Context::id)
    }

    /// Whether the unit was freed
    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Wait until the unit terminates.
    ///
    /// A stackful caller is suspended, an external thread parks. A tasklet
    /// may only join a unit that already terminated.
    pub fn join(&self) -> Result<()> {
        self.check_not_freed()?;
        if let Some(me) = current() {
            if me.id() == self.id() {
                return Err(Error::InvalidState(format!("{} cannot join itself", self.id())));
            }
        }
        self.inner.termination.wait()
    }

    /// Join the unit, then release it
    pub fn free(&self) -> Result<()> {
        self.join()?;
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!("{} already freed", self.id())));
        }
        self.inner.entry.lock().take();
        self.release_context();
        if let Some(rt) = self.inner.runtime.upgrade() {
            rt.unregister_unit(self.id());
        }
        trace!(unit = %self.id(), "freed");
        Ok(())
    }

    /// Move the unit to `pool`.
    ///
    /// A queued unit moves right away. A running or blocked unit records the
    /// destination and lands there on its next re-queue.
    pub fn migrate_to(&self, pool: &Pool) -> Result<()> {
        self.check_not_freed()?;
        if self.kind() == UnitKind::Stackless || !self.is_migratable() {
            return Err(Error::Unsupported(format!("{} is not migratable", self.id())));
        }
        if pool.is_destroyed() {
            return Err(Error::InvalidArgument(format!("{} is destroyed", pool.id())));
        }

        match self.inner.state.load() {
            RawState::Terminated => {
                return Err(Error::InvalidState(format!("{} has terminated", self.id())))
            }
            RawState::Ready => {
                if let Some(current) = self.pool() {
                    if current.ptr_eq(pool) {
                        return Ok(());
                    }
                    if current.remove(self) {
                        trace!(unit = %self.id(), to = %pool.id(), "migrated");
                        return pool.enqueue(self.clone());
                    }
                }
            }
            _ => {}
        }

        *self.inner.migrate_to.lock() = Some(pool.downgrade());
        Ok(())
    }

    // ---- crate-internal ----

    pub(crate) fn downgrade(&self) -> Weak<UnitInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<UnitInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn runtime(&self) -> Option<Arc<RuntimeInner>> {
        self.inner.runtime.upgrade()
    }

    pub(crate) fn set_pool(&self, pool: Option<Weak<PoolInner>>) {
        if let Some(p) = &pool {
            *self.inner.last_pool.lock() = Some(p.clone());
        }
        *self.inner.pool.lock() = pool;
    }

    /// Run the unit on stream `rank` until it terminates or suspends
    pub(crate) fn dispatch(self, rank: usize) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(RawState::Ready, RawState::Running)
            .is_err()
        {
            fatal("dispatched a work unit that is not ready");
        }
        inner.stream_rank.store(Some(rank));
        trace!(unit = %inner.id, rank, "dispatch");

        match inner.kind {
            UnitKind::Stackless => {
                let job = inner.entry.lock().take();
                if let Some(job) = job {
                    let outcome =
                        enter(self.clone(), || panic::catch_unwind(AssertUnwindSafe(job)));
                    if let Err(payload) = outcome {
                        self.record_panic(&*payload);
                    }
                }
                self.finish_job();
                self.terminate();
            }
            UnitKind::Stackful => {
                let handle = self.context_handle();
                let job = inner.entry.lock().take();
                let why = match job {
                    Some(job) => handle.start(job, self.clone()),
                    None => handle.resume(),
                };
                match why {
                    Suspend::Yield => {
                        inner.state.store(RawState::Ready);
                        self.requeue();
                    }
                    Suspend::Block => {
                        if inner
                            .state
                            .compare_exchange(RawState::Running, RawState::Blocked)
                            .is_err()
                        {
                            // Notified: the wake-up already happened
                            inner.state.store(RawState::Ready);
                            self.requeue();
                        } else {
                            trace!(unit = %inner.id, rank, "blocked");
                        }
                    }
                    Suspend::Exit => self.terminate(),
                }
            }
        }
    }

    /// Suspend the calling unit until [`WorkUnit::wake`]
    pub(crate) fn block_current(&self) {
        self.context_handle().suspend(Suspend::Block);
    }

    /// Make a blocked (or about to block) unit ready again
    pub(crate) fn wake(&self) {
        let state = &self.inner.state;
        loop {
            match state.load() {
                RawState::Blocked => {
                    if state
                        .compare_exchange(RawState::Blocked, RawState::Ready)
                        .is_ok()
                    {
                        self.requeue();
                        return;
                    }
                }
                RawState::Running => {
                    if state
                        .compare_exchange(RawState::Running, RawState::Notified)
                        .is_ok()
                    {
                        return;
                    }
                }
                other => {
                    warn!(unit = %self.id(), state = ?other, "spurious wake-up ignored");
                    return;
                }
            }
        }
    }

    /// Reset a terminated stackful unit with a new entry closure
    pub(crate) fn revive(&self, pool: &Pool, job: Job) -> Result<()> {
        self.check_not_freed()?;
        if self.kind() == UnitKind::Stackless {
            return Err(Error::InvalidState(format!(
                "tasklet {} cannot be revived",
                self.id()
            )));
        }
        if pool.is_destroyed() {
            return Err(Error::InvalidArgument(format!("{} is destroyed", pool.id())));
        }
        pool.check_producer()?;

        // `terminate` publishes the state before it sets the latch
        let backoff = Backoff::new();
        loop {
            let rearmed = self.inner.termination.reset_if(|| {
                self.inner
                    .state
                    .compare_exchange(RawState::Terminated, RawState::Ready)
                    .is_ok()
            });
            if rearmed {
                break;
            }
            if self.state() == UnitState::Terminated && !self.inner.termination.is_set() {
                backoff.snooze();
                continue;
            }
            return Err(Error::InvalidState(format!(
                "{} is {:?}, only terminated units can be revived",
                self.id(),
                self.state()
            )));
        }

        *self.inner.entry.lock() = Some(job);
        *self.inner.migrate_to.lock() = None;
        self.inner.panicked.store(false, Ordering::Release);
        self.inner.revivals.fetch_add(1, Ordering::AcqRel);
        trace!(unit = %self.id(), pool = %pool.id(), "revived");
        pool.enqueue(self.clone())
    }

    pub(crate) fn record_panic(&self, payload: &(dyn Any + Send)) {
        self.inner.panicked.store(true, Ordering::Release);
        error!(
            unit = %self.id(),
            message = %panic_message(payload),
            "work unit panicked"
        );
    }

    /// Per-run cleanup on the executing thread: key destructors
    pub(crate) fn finish_job(&self) {
        if let Some(rt) = self.runtime() {
            rt.run_key_destructors(self.id());
        }
    }

    /// Terminate a unit stranded at runtime teardown (blocked, or queued
    /// where no scheduler will pop it) and stop its context thread
    pub(crate) fn abandon(&self) -> bool {
        let from = match self.inner.state.load() {
            state @ (RawState::Blocked | RawState::Ready) => state,
            _ => return false,
        };
        if self
            .inner
            .state
            .compare_exchange(from, RawState::Terminated)
            .is_err()
        {
            return false;
        }
        if from == RawState::Ready {
            if let Some(pool) = self.pool() {
                pool.remove(self);
            }
        }

        self.inner.entry.lock().take();
        let handle = self.inner.context.lock().as_ref().map(Context::handle);
        if let Some(handle) = handle {
            handle.shutdown();
        }
        warn!(unit = %self.id(), "work unit abandoned at runtime teardown");
        self.terminate();
        true
    }

    fn terminate(&self) {
        self.inner.state.store(RawState::Terminated);
        if let Some(rt) = self.runtime() {
            rt.note_terminated();
        }
        trace!(unit = %self.id(), "terminated");
        self.inner.termination.set();
    }

    fn requeue(&self) {
        let target = self
            .inner
            .migrate_to
            .lock()
            .take()
            .or_else(|| self.inner.last_pool.lock().clone());

        match target.and_then(|w| w.upgrade()) {
            Some(pool) => {
                let pool = Pool::from_inner(pool);
                if let Err(e) = pool.enqueue(self.clone()) {
                    error!(unit = %self.id(), error = %e, "cannot re-queue work unit");
                }
            }
            None => error!(unit = %self.id(), "work unit has no live pool to return to"),
        }
    }

    fn context_handle(&self) -> ContextHandle {
        match self.inner.context.lock().as_ref() {
            Some(context) => context.handle(),
            None => fatal("stackful work unit has no execution context"),
        }
    }

    fn release_context(&self) {
        let context = self.inner.context.lock().take();
        if let (Some(context), Some(rt)) = (context, self.runtime()) {
            rt.release_context(context);
        }
    }

    fn check_not_freed(&self) -> Result<()> {
        if self.is_freed() {
            return Err(Error::InvalidState(format!("{} already freed", self.id())));
        }
        Ok(())
    }
}

fn upgrade(slot: &Mutex<Option<Weak<PoolInner>>>) -> Option<Pool> {
    slot.lock()
        .as_ref()
        .and_then(Weak::upgrade)
        .map(Pool::from_inner)
}

impl PartialEq for WorkUnit {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for WorkUnit {}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}
