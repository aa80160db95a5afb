//! Runtime lifecycle
//!
//! [`Runtime::init`] turns the calling thread into the primary execution
//! stream and sets up the shared state every other object hangs off: the
//! stream registry, the unit registry, key storage and the execution
//! context cache. [`Runtime::finalize`] tears it all down again.

use crate::config::RuntimeConfig;
use crate::pool::{Pool, PoolAccess, PoolKind};
use crate::sched::{BasicScheduler, SchedConfig, SchedState, Scheduler, SchedulerId};
use crate::sync::{Key, KeyId, KeySlot};
use crate::unit::{self, Context, ContextCache, UnitAttr, UnitId, UnitInner, WorkUnit};
use crate::xstream::{ExecutionStream, StreamState};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Units created by spawn
    pub units_spawned: u64,

    /// Successful revivals
    pub units_revived: u64,

    /// Entry closures that ran to completion (or panicked)
    pub units_terminated: u64,

    /// Execution contexts allocated
    pub contexts_created: u64,

    /// Spawns served from the context cache
    pub contexts_reused: u64,
}

#[derive(Default)]
struct StatCounters {
    units_spawned: AtomicU64,
    units_revived: AtomicU64,
    units_terminated: AtomicU64,
    contexts_created: AtomicU64,
    contexts_reused: AtomicU64,
}

/// Handle to an initialized runtime
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    id: u64,
    pub(crate) config: RuntimeConfig,
    primary: ExecutionStream,
    primary_thread: ThreadId,

    /// Secondary streams by rank
    streams: DashMap<usize, ExecutionStream>,
    next_rank: AtomicUsize,

    /// Units not yet freed
    units: DashMap<UnitId, Weak<UnitInner>>,

    /// Work-unit-local values, per unit
    pub(crate) keys: DashMap<UnitId, Mutex<FxHashMap<KeyId, KeySlot>>>,

    contexts: ContextCache,
    stats: StatCounters,
    finalized: AtomicBool,
}

impl Runtime {
    /// Initialize a runtime with default settings
    pub fn init() -> Result<Self> {
        Self::init_with(RuntimeConfig::default())
    }

    /// Initialize a runtime; the calling thread becomes the primary stream.
    ///
    /// A thread hosts at most one runtime (or stream) at a time.
    pub fn init_with(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        if unit::current().is_some() || ExecutionStream::thread_has_stream() {
            return Err(Error::InvalidState(
                "this thread already hosts an execution stream".into(),
            ));
        }

        let pool = Pool::new(PoolKind::Fifo, PoolAccess::Mpmc, true);
        let sched = Scheduler::new(
            BasicScheduler::default(),
            vec![pool],
            SchedConfig::from_runtime(&config, true),
        )?;
        sched.bind(0)?;

        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new_cyclic(|weak| RuntimeInner {
            id,
            contexts: ContextCache::new(config.context_cache),
            config,
            primary: ExecutionStream::new_primary(weak.clone(), sched),
            primary_thread: thread::current().id(),
            streams: DashMap::new(),
            next_rank: AtomicUsize::new(1),
            units: DashMap::new(),
            keys: DashMap::new(),
            stats: StatCounters::default(),
            finalized: AtomicBool::new(false),
        });
        inner.primary.install_current();

        info!(runtime = id, "runtime initialized");
        Ok(Self { inner })
    }

    /// Settings in use
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The primary stream (rank 0)
    pub fn primary(&self) -> ExecutionStream {
        self.inner.primary.clone()
    }

    /// First pool of the primary stream's scheduler
    pub fn main_pool(&self) -> Result<Pool> {
        self.inner
            .primary
            .scheduler()
            .pools()
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidState("the primary scheduler has no pool".into()))
    }

    /// Every live stream, by rank
    pub fn streams(&self) -> Vec<ExecutionStream> {
        let mut streams: Vec<_> = self.inner.streams.iter().map(|s| s.value().clone()).collect();
        streams.push(self.primary());
        streams.sort_by_key(ExecutionStream::rank);
        streams
    }

    /// Stream with the given rank
    pub fn stream(&self, rank: usize) -> Option<ExecutionStream> {
        self.inner.stream(rank)
    }

    /// Start a secondary stream running `sched`
    pub fn create_execution_stream(&self, sched: &Scheduler) -> Result<ExecutionStream> {
        self.inner.check_live()?;
        let rank = self.inner.next_rank.fetch_add(1, Ordering::AcqRel);
        let stream = ExecutionStream::spawn(&self.inner, rank, sched)?;
        self.inner.streams.insert(rank, stream.clone());
        debug!(rank, sched = %sched.id(), "execution stream created");
        Ok(stream)
    }

    /// Start a secondary stream with its own pool and an automatic basic scheduler
    pub fn create_execution_stream_basic(&self) -> Result<ExecutionStream> {
        let pool = Pool::new(PoolKind::Fifo, PoolAccess::Mpmc, true);
        let sched = Scheduler::new(
            BasicScheduler::default(),
            vec![pool],
            self.sched_config(true),
        )?;
        self.create_execution_stream(&sched).inspect_err(|_| {
            let _ = sched.free();
        })
    }

    /// Set up `n` work-stealing streams, the primary one included.
    ///
    /// Each stream gets its own pool and a basic scheduler that pops it
    /// first and steals from all the others. `n == 0` means one per CPU.
    /// Returns every stream, primary first.
    pub fn create_work_stealing_streams(&self, n: usize) -> Result<Vec<ExecutionStream>> {
        let n = if n == 0 { num_cpus::get() } else { n };
        let pools: Vec<Pool> = (0..n)
            .map(|_| Pool::new(PoolKind::Fifo, PoolAccess::Mpmc, true))
            .collect();

        let mut streams = Vec::with_capacity(n);
        for i in 0..n {
            let rotated = (0..n).map(|j| pools[(i + j) % n].clone()).collect();
            let sched = Scheduler::new(BasicScheduler::default(), rotated, self.sched_config(true))?;
            if i == 0 {
                self.inner.primary.set_main_scheduler(&sched)?;
                streams.push(self.primary());
            } else {
                streams.push(self.create_execution_stream(&sched)?);
            }
        }
        Ok(streams)
    }

    /// Spawn a stackful unit with default attributes
    pub fn spawn<F>(&self, pool: &Pool, f: F) -> Result<WorkUnit>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(pool, UnitAttr::default(), f)
    }

    /// Spawn a unit with explicit attributes
    pub fn spawn_with<F>(&self, pool: &Pool, attr: UnitAttr, f: F) -> Result<WorkUnit>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.check_live()?;
        unit::create(&self.inner, pool, attr, Box::new(f))
    }

    /// Spawn a tasklet
    pub fn spawn_tasklet<F>(&self, pool: &Pool, f: F) -> Result<WorkUnit>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(pool, UnitAttr::tasklet(), f)
    }

    /// Reuse a terminated stackful unit (and its context) for a new closure
    pub fn revive<F>(&self, pool: &Pool, unit: &WorkUnit, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.check_live()?;
        unit.revive(pool, Box::new(f))?;
        self.inner.stats.units_revived.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Create a work-unit-local key with an optional destructor
    pub fn create_key<T>(&self, destructor: Option<Arc<dyn Fn(T) + Send + Sync>>) -> Key<T>
    where
        T: Send + 'static,
    {
        Key::with_destructor_opt(destructor)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RuntimeStats {
        let s = &self.inner.stats;
        RuntimeStats {
            units_spawned: s.units_spawned.load(Ordering::Relaxed),
            units_revived: s.units_revived.load(Ordering::Relaxed),
            units_terminated: s.units_terminated.load(Ordering::Relaxed),
            contexts_created: s.contexts_created.load(Ordering::Relaxed),
            contexts_reused: s.contexts_reused.load(Ordering::Relaxed),
        }
    }

    /// Units spawned and not yet freed
    pub fn live_units(&self) -> Vec<WorkUnit> {
        self.inner.live_units()
    }

    /// Printable snapshot of streams, schedulers, pools and units
    pub fn info(&self) -> RuntimeInfo {
        let streams = self
            .streams()
            .into_iter()
            .map(|stream| {
                let sched = stream.scheduler();
                StreamInfo {
                    rank: stream.rank(),
                    primary: stream.is_primary(),
                    state: stream.state(),
                    scheduler: sched.id(),
                    sched_state: sched.state(),
                    pools: sched
                        .pools()
                        .iter()
                        .map(|p| PoolInfo {
                            id: p.id().as_u64(),
                            kind: p.kind(),
                            access: p.access(),
                            size: p.size(),
                        })
                        .collect(),
                }
            })
            .collect();

        RuntimeInfo {
            id: self.inner.id,
            streams,
            live_units: self.inner.live_units().len(),
            cached_contexts: self.inner.contexts.len(),
            stats: self.stats(),
        }
    }

    /// Shut the runtime down.
    ///
    /// Must be called on the thread that initialized it. Every secondary
    /// stream is joined and freed, then the primary scheduler drains its
    /// pools and is finalized.
    pub fn finalize(self) -> Result<()> {
        if thread::current().id() != self.inner.primary_thread || unit::current().is_some() {
            return Err(Error::InvalidState(
                "finalize must be called by the primary thread".into(),
            ));
        }
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("runtime already finalized".into()));
        }

        let mut secondaries: Vec<_> = self.inner.streams.iter().map(|s| s.value().clone()).collect();
        secondaries.sort_by_key(ExecutionStream::rank);
        for stream in secondaries {
            stream.join()?;
            stream.free()?;
        }

        let result = self.inner.primary.shutdown_primary();
        let abandoned = self.inner.abandon_stranded_units();
        if abandoned > 0 {
            warn!(runtime = self.inner.id, abandoned, "units left unfinished at finalize");
        }
        self.inner.primary.uninstall_current();
        info!(runtime = self.inner.id, stats = ?self.stats(), "runtime finalized");
        result
    }

    fn sched_config(&self, automatic: bool) -> SchedConfig {
        SchedConfig::from_runtime(&self.inner.config, automatic)
    }
}

impl RuntimeInner {
    fn check_live(&self) -> Result<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(Error::InvalidState("runtime already finalized".into()));
        }
        Ok(())
    }

    pub(crate) fn stream(&self, rank: usize) -> Option<ExecutionStream> {
        if rank == 0 {
            return Some(self.primary.clone());
        }
        self.streams.get(&rank).map(|s| s.value().clone())
    }

    pub(crate) fn remove_stream(&self, rank: usize) {
        self.streams.remove(&rank);
    }

    pub(crate) fn register_unit(&self, unit: &WorkUnit) {
        self.units.insert(unit.id(), unit.downgrade());
        self.stats.units_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unregister_unit(&self, id: UnitId) {
        self.units.remove(&id);
    }

    pub(crate) fn note_terminated(&self) {
        self.stats.units_terminated.fetch_add(1, Ordering::Relaxed);
    }

    fn live_units(&self) -> Vec<WorkUnit> {
        // Drop entries of units that were never freed but are gone
        self.units.retain(|_, unit| unit.strong_count() > 0);
        self.units
            .iter()
            .filter_map(|entry| WorkUnit::upgrade(entry.value()))
            .collect()
    }

    /// Terminate every unit no stream can finish any more
    fn abandon_stranded_units(&self) -> usize {
        self.live_units()
            .iter()
            .filter(|unit| unit.abandon())
            .count()
    }

    /// Context for a new stackful unit, from the cache when the size matches
    pub(crate) fn acquire_context(&self, stack_size: Option<usize>) -> Result<Context> {
        let size = stack_size.unwrap_or(self.config.stack_size);
        if size == self.config.stack_size {
            if let Some(context) = self.contexts.acquire() {
                self.stats.contexts_reused.fetch_add(1, Ordering::Relaxed);
                return Ok(context);
            }
        }
        let context = Context::spawn(&self.config.thread_name_prefix, size)?;
        self.stats.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(context)
    }

    pub(crate) fn release_context(&self, context: Context) {
        if context.stack_size() == self.config.stack_size {
            self.contexts.release(context);
        }
    }

    /// Run the destructors of every key value a unit set
    pub(crate) fn run_key_destructors(&self, unit: UnitId) {
        if let Some((_, slots)) = self.keys.remove(&unit) {
            for (_, slot) in slots.into_inner() {
                slot.destroy();
            }
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        warn!(runtime = self.id, "runtime dropped without finalize");
        for stream in self.streams.iter() {
            stream.value().request_stop();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.inner.finalized.load(Ordering::Acquire)
            && thread::current().id() == self.inner.primary_thread
        {
            // Let this thread host a new runtime
            self.inner.primary.uninstall_current();
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("streams", &(self.inner.streams.len() + 1))
            .field("units", &self.inner.units.len())
            .finish()
    }
}

/// Snapshot returned by [`Runtime::info`]
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Runtime identifier
    pub id: u64,
    /// Every live stream, by rank
    pub streams: Vec<StreamInfo>,
    /// Units spawned and not yet freed
    pub live_units: usize,
    /// Contexts parked in the cache
    pub cached_contexts: usize,
    /// Counters
    pub stats: RuntimeStats,
}

/// One stream of a [`RuntimeInfo`]
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream rank
    pub rank: usize,
    /// Whether it is the primary stream
    pub primary: bool,
    /// Stream state
    pub state: StreamState,
    /// Scheduler in charge
    pub scheduler: SchedulerId,
    /// Its lifecycle state
    pub sched_state: SchedState,
    /// Its pools, in order
    pub pools: Vec<PoolInfo>,
}

/// One pool of a [`StreamInfo`]
#[derive(Debug, Clone)]
pub struct PoolInfo {
    /// Raw pool id
    pub id: u64,
    /// Ordering
    pub kind: PoolKind,
    /// Access mode
    pub access: PoolAccess,
    /// Queued units
    pub size: usize,
}

impl fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runtime {}", self.id)?;
        for s in &self.streams {
            writeln!(
                f,
                "  stream {}{}: {:?}, {} {:?}",
                s.rank,
                if s.primary { " (primary)" } else { "" },
                s.state,
                s.scheduler,
                s.sched_state
            )?;
            for p in &s.pools {
                writeln!(
                    f,
                    "    pool#{} {:?}/{:?}: {} queued",
                    p.id, p.kind, p.access, p.size
                )?;
            }
        }
        writeln!(
            f,
            "  units: {} live, {} spawned, {} revived, {} terminated",
            self.live_units,
            self.stats.units_spawned,
            self.stats.units_revived,
            self.stats.units_terminated
        )?;
        write!(
            f,
            "  contexts: {} created, {} reused, {} cached",
            self.stats.contexts_created, self.stats.contexts_reused, self.cached_contexts
        )
    }
}
