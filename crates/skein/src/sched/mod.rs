//! Schedulers
//!
//! A scheduler is the policy an execution stream runs: it decides which
//! ready unit from its pools is dispatched next. The policy itself is a
//! [`SchedulerDef`] implementation whose struct doubles as the scheduler's
//! private data; [`Scheduler`] wraps it with the pools, the lifecycle
//! state and the stop/event plumbing shared by every policy.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Initialized -> Running -> Stopping -> Finalized
//!                 ^            |
//!                 +------------+  (run left without a stop request)
//! ```

mod basic;
mod prio;

pub use basic::{BasicScheduler, StealOrder};
pub use prio::PriorityScheduler;

use crate::config::RuntimeConfig;
use crate::pool::Pool;
use crate::unit::WorkUnit;
use crate::xstream::ExecutionStream;
use crate::{fatal, Error, Result};
use crossbeam::atomic::AtomicCell;
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Unique identifier for a scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerId(u64);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

impl SchedulerId {
    pub(crate) fn new() -> Self {
        SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for SchedulerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sched#{}", self.0)
    }
}

/// Per-scheduler settings
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Dispatches between two event checks
    pub event_freq: u32,

    /// Sleep once idle spinning is exhausted
    pub idle_sleep: Duration,

    /// Freed together with the stream that runs it
    pub automatic: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            event_freq: 50,
            idle_sleep: Duration::from_micros(100),
            automatic: false,
        }
    }
}

impl SchedConfig {
    pub(crate) fn from_runtime(config: &RuntimeConfig, automatic: bool) -> Self {
        Self {
            event_freq: config.event_freq,
            idle_sleep: config.idle_sleep,
            automatic,
        }
    }
}

/// Scheduler lifecycle state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedState {
    /// Not yet initialized on a stream
    Created,
    /// `init` ran; ready to run
    Initialized,
    /// Inside `run`
    Running,
    /// `run` returned after a stop request
    Stopping,
    /// `finalize` ran
    Finalized,
}

/// A scheduling policy.
///
/// `run` is the scheduling loop: it must keep dispatching units (see
/// [`SchedContext::run_unit`]) until [`SchedContext::has_to_stop`] returns
/// true, and should call [`SchedContext::check_events`] periodically.
pub trait SchedulerDef: Send + 'static {
    /// Called once on the stream before the first `run`
    fn init(&mut self, sched: &SchedContext<'_>) -> Result<()> {
        let _ = sched;
        Ok(())
    }

    /// The scheduling loop
    fn run(&mut self, sched: &SchedContext<'_>);

    /// Called once after the last `run`
    fn finalize(&mut self, sched: &SchedContext<'_>) -> Result<()> {
        let _ = sched;
        Ok(())
    }

    /// Pool receiving units migrated to this scheduler's stream
    fn migration_pool(&self, sched: &SchedContext<'_>) -> Option<Pool> {
        let _ = sched;
        None
    }
}

/// Callback run on the stream whenever the scheduler checks for events
pub type EventHook = Arc<dyn Fn() + Send + Sync>;

/// Handle to a scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    id: SchedulerId,
    pools: Vec<Pool>,
    config: SchedConfig,

    /// The policy, also its private data
    def: Mutex<Box<dyn SchedulerDef>>,

    state: AtomicCell<SchedState>,
    stop_requested: AtomicBool,

    /// Rank of the stream this scheduler is bound to
    bound: AtomicCell<Option<usize>>,

    event_hook: RwLock<Option<EventHook>>,
    migration_pool: Mutex<Option<Pool>>,
    freed: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler running `def` over `pools` (in priority order)
    pub fn new(def: impl SchedulerDef, pools: Vec<Pool>, config: SchedConfig) -> Result<Self> {
        if let Some(pool) = pools.iter().find(|p| p.is_destroyed()) {
            return Err(Error::InvalidArgument(format!("{} is destroyed", pool.id())));
        }
        if config.event_freq == 0 {
            return Err(Error::InvalidArgument("event_freq must be at least 1".into()));
        }

        let id = SchedulerId::new();
        if pools.is_empty() {
            warn!(sched = %id, "scheduler has no pools and will only idle");
        }
        for pool in &pools {
            pool.retain_sched();
        }

        debug!(sched = %id, pools = pools.len(), "scheduler created");
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                id,
                pools,
                config,
                def: Mutex::new(Box::new(def)),
                state: AtomicCell::new(SchedState::Created),
                stop_requested: AtomicBool::new(false),
                bound: AtomicCell::new(None),
                event_hook: RwLock::new(None),
                migration_pool: Mutex::new(None),
                freed: AtomicBool::new(false),
            }),
        })
    }

    /// Work-stealing scheduler with default settings
    pub fn basic(pools: Vec<Pool>) -> Result<Self> {
        Self::new(BasicScheduler::default(), pools, SchedConfig::default())
    }

    /// Strict-priority scheduler with default settings
    pub fn priority(pools: Vec<Pool>) -> Result<Self> {
        Self::new(PriorityScheduler::default(), pools, SchedConfig::default())
    }

    /// Scheduler identifier
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    /// Pools, in the order given at creation
    pub fn pools(&self) -> &[Pool] {
        &self.inner.pools
    }

    /// Settings
    pub fn config(&self) -> &SchedConfig {
        &self.inner.config
    }

    /// Lifecycle state
    pub fn state(&self) -> SchedState {
        self.inner.state.load()
    }

    /// Rank of the stream running this scheduler
    pub fn bound_rank(&self) -> Option<usize> {
        self.inner.bound.load()
    }

    /// Ask the scheduler to leave `run` once its pools are empty
    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            debug!(sched = %self.id(), "stop requested");
        }
    }

    /// Whether a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    /// Install the callback run by [`SchedContext::check_events`]
    pub fn set_event_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.event_hook.write() = Some(Arc::new(hook));
    }

    /// Remove the event callback
    pub fn clear_event_hook(&self) {
        *self.inner.event_hook.write() = None;
    }

    /// Pool receiving migrated units, once the scheduler was initialized
    pub fn migration_pool(&self) -> Option<Pool> {
        self.inner.migration_pool.lock().clone()
    }

    /// Release the scheduler and its references on the pools.
    ///
    /// Fails while the scheduler is bound to a stream.
    pub fn free(&self) -> Result<()> {
        if let Some(rank) = self.bound_rank() {
            return Err(Error::InvalidState(format!(
                "{} is still bound to stream {}",
                self.id(),
                rank
            )));
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!("{} already freed", self.id())));
        }
        for pool in &self.inner.pools {
            pool.release_sched();
        }
        debug!(sched = %self.id(), "scheduler freed");
        Ok(())
    }

    /// Whether two handles refer to the same scheduler
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- crate-internal ----

    /// Reserve the scheduler for stream `rank`
    pub(crate) fn bind(&self, rank: usize) -> Result<()> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!("{} was freed", self.id())));
        }
        if self.state() == SchedState::Finalized {
            return Err(Error::InvalidState(format!("{} was finalized", self.id())));
        }
        if let Some(pool) = self.inner.pools.iter().find(|p| !p.can_bind(rank)) {
            return Err(Error::InvalidState(format!(
                "{} is bound to another stream",
                pool.id()
            )));
        }
        match self.inner.bound.compare_exchange(None, Some(rank)) {
            Ok(_) => Ok(()),
            Err(other) => Err(Error::InvalidState(format!(
                "{} is already bound to stream {:?}",
                self.id(),
                other
            ))),
        }
    }

    pub(crate) fn unbind(&self, rank: usize) {
        let _ = self.inner.bound.compare_exchange(Some(rank), None);
    }

    /// Run `init` once; later calls are no-ops
    pub(crate) fn initialize(&self, stream: &ExecutionStream) -> Result<()> {
        if self.state() != SchedState::Created {
            return Ok(());
        }
        let rank = stream.rank();
        for pool in &self.inner.pools {
            pool.bind_owner(rank)?;
        }

        let ctx = SchedContext::new(stream, self, None);
        let mut def = self.inner.def.lock();
        def.init(&ctx)?;
        *self.inner.migration_pool.lock() = def.migration_pool(&ctx);
        drop(def);

        self.inner.state.store(SchedState::Initialized);
        debug!(sched = %self.id(), rank, "scheduler initialized");
        Ok(())
    }

    /// One pass of the policy's `run` loop
    pub(crate) fn run(&self, stream: &ExecutionStream, until: Option<&dyn Fn() -> bool>) {
        match self.state() {
            SchedState::Initialized | SchedState::Stopping => {}
            other => fatal(&format!("scheduler run from state {:?}", other)),
        }
        self.inner.state.store(SchedState::Running);

        let ctx = SchedContext::new(stream, self, until);
        self.inner.def.lock().run(&ctx);

        let next = if self.is_stop_requested() {
            SchedState::Stopping
        } else {
            SchedState::Initialized
        };
        self.inner.state.store(next);
    }

    /// Run `finalize` once the scheduler is done on `stream`
    pub(crate) fn finalize(&self, stream: &ExecutionStream) -> Result<()> {
        let result = match self.state() {
            SchedState::Created | SchedState::Finalized => Ok(()),
            SchedState::Initialized | SchedState::Stopping => {
                let ctx = SchedContext::new(stream, self, None);
                self.inner.def.lock().finalize(&ctx)
            }
            SchedState::Running => fatal("scheduler finalized while running"),
        };

        for pool in &self.inner.pools {
            pool.release_owner(stream.rank());
        }
        self.inner.state.store(SchedState::Finalized);
        debug!(sched = %self.id(), rank = stream.rank(), "scheduler finalized");
        result
    }

    fn event_hook(&self) -> Option<EventHook> {
        self.inner.event_hook.read().clone()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("pools", &self.inner.pools.len())
            .field("bound", &self.bound_rank())
            .finish()
    }
}

/// What a [`SchedulerDef`] sees of its scheduler and stream
pub struct SchedContext<'a> {
    stream: &'a ExecutionStream,
    sched: &'a Scheduler,
    until: Option<&'a dyn Fn() -> bool>,
    backoff: Backoff,
}

impl<'a> SchedContext<'a> {
    fn new(
        stream: &'a ExecutionStream,
        sched: &'a Scheduler,
        until: Option<&'a dyn Fn() -> bool>,
    ) -> Self {
        Self {
            stream,
            sched,
            until,
            backoff: Backoff::new(),
        }
    }

    /// Pools of the scheduler, in configured order
    pub fn pools(&self) -> &[Pool] {
        self.sched.pools()
    }

    /// Rank of the stream running the scheduler
    pub fn rank(&self) -> usize {
        self.stream.rank()
    }

    /// Settings of the scheduler
    pub fn config(&self) -> &SchedConfig {
        self.sched.config()
    }

    /// The stream running the scheduler
    pub fn stream(&self) -> &ExecutionStream {
        self.stream
    }

    /// The scheduler itself
    pub fn scheduler(&self) -> &Scheduler {
        self.sched
    }

    /// Pop the next unit of `pool`
    pub fn pop(&self, pool: &Pool) -> Option<WorkUnit> {
        match pool.pop() {
            Ok(unit) => unit,
            Err(e) => {
                warn!(rank = self.rank(), pool = %pool.id(), error = %e, "pop failed");
                None
            }
        }
    }

    /// Steal a migratable unit from `pool`
    pub fn steal(&self, pool: &Pool) -> Option<WorkUnit> {
        match pool.steal() {
            Ok(unit) => unit,
            Err(e) => {
                warn!(rank = self.rank(), pool = %pool.id(), error = %e, "steal failed");
                None
            }
        }
    }

    /// Dispatch `unit` until it terminates, yields or blocks
    pub fn run_unit(&self, unit: WorkUnit) {
        self.backoff.reset();
        unit.dispatch(self.rank());
    }

    /// Whether the loop must return now.
    ///
    /// True once a stop was requested and every pool is empty, or when the
    /// stream needs its thread back.
    pub fn has_to_stop(&self) -> bool {
        if let Some(until) = self.until {
            if until() {
                return true;
            }
        }
        self.sched.is_stop_requested() && self.pools().iter().all(Pool::is_empty)
    }

    /// Run the scheduler's event hook, if any
    pub fn check_events(&self) {
        if let Some(hook) = self.sched.event_hook() {
            hook();
        }
    }

    /// Nothing to run: check events, then spin or sleep
    pub fn idle(&self) {
        self.check_events();
        if self.backoff.is_completed() {
            thread::sleep(self.config().idle_sleep);
        } else {
            self.backoff.snooze();
        }
    }
}
