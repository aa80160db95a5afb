//! Pools of ready work units
//!
//! A pool is a container of units that are ready to run. Schedulers pop from
//! the pools they own and steal from the others. Ordering is fixed at
//! creation (FIFO, LIFO or priority) and so is the access mode, which
//! restricts which execution streams may push or pop once a scheduler binds
//! the pool to a stream.

use crate::unit::{UnitState, WorkUnit};
use crate::xstream;
use crate::{Error, Result};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Unique identifier for a pool
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl PoolId {
    pub(crate) fn new() -> Self {
        PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Order in which a pool hands out its units
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// Oldest first
    Fifo,
    /// Newest first
    Lifo,
    /// Highest priority first, FIFO among equal priorities
    Priority,
}

/// Which execution streams may use a pool once it is bound
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolAccess {
    /// Only the owning stream may push and pop
    Private,
    /// Any stream may push, only the owner pops
    Mpsc,
    /// Any stream may push and pop
    Mpmc,
}

/// Handle to a pool of ready work units
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    id: PoolId,
    kind: PoolKind,
    access: PoolAccess,
    auto_free: bool,

    queue: Mutex<PoolQueue>,

    /// Rank of the stream whose scheduler consumes this pool (restricted access only)
    owner: AtomicCell<Option<usize>>,

    /// Schedulers referencing this pool
    sched_refs: AtomicUsize,

    destroyed: AtomicBool,
}

struct PoolQueue {
    units: Units,
    next_seq: u64,
}

enum Units {
    /// FIFO pushes to the back, LIFO to the front, both pop from the front
    Deque(VecDeque<WorkUnit>),
    /// Keyed by (descending priority, insertion sequence)
    Ranked(BTreeMap<(Reverse<i32>, u64), WorkUnit>),
}

impl Units {
    fn len(&self) -> usize {
        match self {
            Units::Deque(q) => q.len(),
            Units::Ranked(m) => m.len(),
        }
    }

    fn take_first(&mut self, accept: impl Fn(&WorkUnit) -> bool) -> Option<WorkUnit> {
        match self {
            Units::Deque(q) => {
                let index = q.iter().position(accept)?;
                q.remove(index)
            }
            Units::Ranked(m) => {
                let key = m.iter().find(|(_, u)| accept(u)).map(|(k, _)| *k)?;
                m.remove(&key)
            }
        }
    }

    fn remove(&mut self, unit: &WorkUnit) -> bool {
        self.take_first(|u| u.id() == unit.id()).is_some()
    }
}

impl Pool {
    /// Create an empty pool.
    ///
    /// An `auto_free` pool is destroyed when the last scheduler using it is
    /// freed.
    pub fn new(kind: PoolKind, access: PoolAccess, auto_free: bool) -> Self {
        let units = match kind {
            PoolKind::Fifo | PoolKind::Lifo => Units::Deque(VecDeque::new()),
            PoolKind::Priority => Units::Ranked(BTreeMap::new()),
        };
        let pool = Self {
            inner: Arc::new(PoolInner {
                id: PoolId::new(),
                kind,
                access,
                auto_free,
                queue: Mutex::new(PoolQueue { units, next_seq: 0 }),
                owner: AtomicCell::new(None),
                sched_refs: AtomicUsize::new(0),
                destroyed: AtomicBool::new(false),
            }),
        };
        debug!(pool = %pool.id(), ?kind, ?access, auto_free, "pool created");
        pool
    }

    /// Shorthand for a shared FIFO pool
    pub fn fifo() -> Self {
        Self::new(PoolKind::Fifo, PoolAccess::Mpmc, false)
    }

    /// Pool identifier
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Ordering of the pool
    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Access mode of the pool
    pub fn access(&self) -> PoolAccess {
        self.inner.access
    }

    /// Whether the pool is destroyed along with its last scheduler
    pub fn is_auto_free(&self) -> bool {
        self.inner.auto_free
    }

    /// Whether the pool has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Rank of the stream this pool is bound to, if any
    pub fn owner(&self) -> Option<usize> {
        self.inner.owner.load()
    }

    /// Number of units waiting in the pool
    pub fn size(&self) -> usize {
        self.inner.queue.lock().units.len()
    }

    /// Whether no unit is waiting
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Push a ready unit that is not queued anywhere.
    ///
    /// Units pushed by hand must have been removed from their previous pool
    /// (see [`Pool::remove`]); spawned units are queued automatically.
    pub fn push(&self, unit: &WorkUnit) -> Result<()> {
        self.check_producer()?;
        if unit.state() != UnitState::Ready {
            return Err(Error::InvalidState(format!(
                "{} is {:?}, only ready units can be pushed",
                unit.id(),
                unit.state()
            )));
        }
        if unit.pool().is_some() {
            return Err(Error::InvalidState(format!(
                "{} is already queued in a pool",
                unit.id()
            )));
        }
        self.enqueue(unit.clone())
    }

    /// Pop the next unit in pool order
    pub fn pop(&self) -> Result<Option<WorkUnit>> {
        self.check_live()?;
        self.check_consumer()?;
        Ok(self.take(|_| true))
    }

    /// Take a unit on behalf of another stream's scheduler.
    ///
    /// Returns `None` when the pool is empty, when it is bound to a different
    /// stream with restricted access, or when only non-migratable units are
    /// queued.
    pub fn steal(&self) -> Result<Option<WorkUnit>> {
        self.check_live()?;
        if self.check_consumer().is_err() {
            return Ok(None);
        }
        Ok(self.take(|u| u.is_migratable()))
    }

    /// Remove a specific unit; false if it was not queued here
    pub fn remove(&self, unit: &WorkUnit) -> bool {
        let mut queue = self.inner.queue.lock();
        let removed = queue.units.remove(unit);
        if removed {
            unit.set_pool(None);
        }
        removed
    }

    /// Destroy the pool.
    ///
    /// Fails while a scheduler still references it or while units are queued.
    pub fn destroy(&self) -> Result<()> {
        let refs = self.inner.sched_refs.load(Ordering::Acquire);
        if refs > 0 {
            return Err(Error::InvalidState(format!(
                "{} is still used by {} scheduler(s)",
                self.id(),
                refs
            )));
        }
        self.destroy_if_empty()
    }

    fn destroy_if_empty(&self) -> Result<()> {
        let queue = self.inner.queue.lock();
        let queued = queue.units.len();
        if queued > 0 {
            return Err(Error::InvalidState(format!(
                "{} still holds {} unit(s)",
                self.id(),
                queued
            )));
        }
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!("{} already destroyed", self.id())));
        }
        debug!(pool = %self.id(), "pool destroyed");
        Ok(())
    }

    /// Whether two handles refer to the same pool
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- crate-internal ----

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    /// Queue a unit without producer checks (spawn, requeue after yield/wake)
    pub(crate) fn enqueue(&self, unit: WorkUnit) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!("{} is destroyed", self.id())));
        }
        unit.set_pool(Some(self.downgrade()));
        let seq = queue.next_seq;
        queue.next_seq += 1;
        match (&mut queue.units, self.inner.kind) {
            (Units::Deque(q), PoolKind::Lifo) => q.push_front(unit),
            (Units::Deque(q), _) => q.push_back(unit),
            (Units::Ranked(m), _) => {
                m.insert((Reverse(unit.priority()), seq), unit);
            }
        }
        Ok(())
    }

    fn take(&self, accept: impl Fn(&WorkUnit) -> bool) -> Option<WorkUnit> {
        let mut queue = self.inner.queue.lock();
        let unit = queue.units.take_first(accept)?;
        unit.set_pool(None);
        Some(unit)
    }

    fn check_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::InvalidState(format!("{} is destroyed", self.id())));
        }
        Ok(())
    }

    pub(crate) fn check_producer(&self) -> Result<()> {
        self.check_live()?;
        if self.inner.access == PoolAccess::Private {
            self.check_owner("push to")?;
        }
        Ok(())
    }

    fn check_consumer(&self) -> Result<()> {
        if self.inner.access != PoolAccess::Mpmc {
            self.check_owner("pop from")?;
        }
        Ok(())
    }

    fn check_owner(&self, what: &str) -> Result<()> {
        if let Some(owner) = self.inner.owner.load() {
            let caller = xstream::current_rank();
            if caller != Some(owner) {
                return Err(Error::InvalidState(format!(
                    "cannot {} {} ({:?}) owned by stream {} from {}",
                    what,
                    self.id(),
                    self.inner.access,
                    owner,
                    match caller {
                        Some(rank) => format!("stream {}", rank),
                        None => "an external thread".to_string(),
                    }
                )));
            }
        }
        Ok(())
    }

    /// Whether a scheduler running on stream `rank` may consume this pool
    pub(crate) fn can_bind(&self, rank: usize) -> bool {
        self.inner.access == PoolAccess::Mpmc
            || self.inner.owner.load().map_or(true, |owner| owner == rank)
    }

    pub(crate) fn bind_owner(&self, rank: usize) -> Result<()> {
        if self.inner.access == PoolAccess::Mpmc {
            return Ok(());
        }
        match self.inner.owner.compare_exchange(None, Some(rank)) {
            Ok(_) => Ok(()),
            Err(Some(owner)) if owner == rank => Ok(()),
            Err(owner) => Err(Error::InvalidState(format!(
                "{} ({:?}) is already bound to stream {:?}",
                self.id(),
                self.inner.access,
                owner
            ))),
        }
    }

    pub(crate) fn release_owner(&self, rank: usize) {
        let _ = self.inner.owner.compare_exchange(Some(rank), None);
    }

    pub(crate) fn retain_sched(&self) {
        self.inner.sched_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one scheduler reference, destroying an auto-free pool on the last one
    pub(crate) fn release_sched(&self) {
        let prev = self.inner.sched_refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 && self.inner.auto_free && !self.is_destroyed() {
            if let Err(e) = self.destroy_if_empty() {
                warn!(pool = %self.id(), error = %e, "auto-free pool kept alive");
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("access", &self.inner.access)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitAttr;
    use crate::Runtime;

    fn order_of(pool: &Pool) -> Vec<usize> {
        let mut ids = Vec::new();
        while let Some(unit) = pool.pop().unwrap() {
            ids.push(unit.priority() as usize);
        }
        ids
    }

    #[test]
    fn test_pool_ids_unique() {
        let a = Pool::fifo();
        let b = Pool::fifo();
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_u64() < b.id().as_u64());
    }

    #[test]
    fn test_pool_orderings() {
        let rt = Runtime::init().unwrap();

        for (kind, expected) in [
            (PoolKind::Fifo, vec![1, 2, 3]),
            (PoolKind::Lifo, vec![3, 2, 1]),
            (PoolKind::Priority, vec![3, 2, 1]),
        ] {
            let pool = Pool::new(kind, PoolAccess::Mpmc, false);
            for p in 1..=3 {
                rt.spawn_with(&pool, UnitAttr::default().with_priority(p), || {})
                    .unwrap();
            }
            assert_eq!(pool.size(), 3);
            assert_eq!(order_of(&pool), expected, "{:?}", kind);
        }

        rt.finalize().unwrap();
    }

    #[test]
    fn test_priority_pool_fifo_among_equals() {
        let rt = Runtime::init().unwrap();
        let pool = Pool::new(PoolKind::Priority, PoolAccess::Mpmc, false);

        let first = rt
            .spawn_with(&pool, UnitAttr::default().with_priority(5), || {})
            .unwrap();
        let second = rt
            .spawn_with(&pool, UnitAttr::default().with_priority(5), || {})
            .unwrap();

        assert_eq!(pool.pop().unwrap().unwrap().id(), first.id());
        assert_eq!(pool.pop().unwrap().unwrap().id(), second.id());
        rt.finalize().unwrap();
    }

    #[test]
    fn test_push_requires_unqueued_ready_unit() {
        let rt = Runtime::init().unwrap();
        let pool = Pool::fifo();
        let other = Pool::fifo();

        let unit = rt.spawn(&pool, || {}).unwrap();
        // Still queued in `pool`
        assert!(matches!(other.push(&unit), Err(Error::InvalidState(_))));

        assert!(pool.remove(&unit));
        assert!(!pool.remove(&unit));
        other.push(&unit).unwrap();
        assert_eq!(other.size(), 1);
        assert!(unit.pool().unwrap().ptr_eq(&other));

        let popped = other.pop().unwrap().unwrap();
        assert_eq!(popped.id(), unit.id());
        assert!(unit.pool().is_none());
        rt.finalize().unwrap();
    }

    #[test]
    fn test_destroy_rules() {
        let rt = Runtime::init().unwrap();
        let pool = Pool::fifo();
        let unit = rt.spawn(&pool, || {}).unwrap();

        // Non-empty
        assert!(matches!(pool.destroy(), Err(Error::InvalidState(_))));

        pool.remove(&unit);
        pool.destroy().unwrap();
        assert!(pool.is_destroyed());
        assert!(matches!(pool.destroy(), Err(Error::InvalidState(_))));
        assert!(matches!(pool.pop(), Err(Error::InvalidState(_))));
        assert!(matches!(pool.push(&unit), Err(Error::InvalidState(_))));
        rt.finalize().unwrap();
    }

    #[test]
    fn test_restricted_pool_access() {
        let private = Pool::new(PoolKind::Fifo, PoolAccess::Private, false);
        let mpsc = Pool::new(PoolKind::Fifo, PoolAccess::Mpsc, false);
        let mpmc = Pool::fifo();

        private.bind_owner(7).unwrap();
        mpsc.bind_owner(7).unwrap();
        mpmc.bind_owner(7).unwrap();

        // The test thread is not stream 7
        assert!(matches!(private.check_producer(), Err(Error::InvalidState(_))));
        assert!(mpsc.check_producer().is_ok());
        assert!(matches!(mpsc.pop(), Err(Error::InvalidState(_))));
        assert_eq!(mpsc.steal().unwrap().map(|u| u.id()), None);
        assert!(mpmc.pop().unwrap().is_none());

        // A second stream cannot claim a bound restricted pool
        assert!(!private.can_bind(8));
        assert!(private.bind_owner(8).is_err());
        assert!(mpmc.can_bind(8));

        private.release_owner(7);
        assert!(private.can_bind(8));
        assert_eq!(private.owner(), None);
    }

    #[test]
    fn test_auto_free_on_last_scheduler() {
        let pool = Pool::new(PoolKind::Fifo, PoolAccess::Mpmc, true);
        pool.retain_sched();
        pool.retain_sched();

        pool.release_sched();
        assert!(!pool.is_destroyed());
        pool.release_sched();
        assert!(pool.is_destroyed());
    }
}
