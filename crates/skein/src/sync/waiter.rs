//! Blocking and waking whoever calls into a primitive

use crate::unit::{self, UnitId, UnitKind, WorkUnit};
use crate::xstream;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread, ThreadId};

/// Holder of a lock: a work unit or a plain thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A work unit (stackful or tasklet)
    Unit(UnitId),
    /// A thread that is not running a work unit
    Thread(ThreadId),
}

impl Owner {
    /// Identity of the caller
    pub fn current() -> Self {
        match unit::current() {
            Some(unit) => Owner::Unit(unit.id()),
            None => Owner::Thread(thread::current().id()),
        }
    }
}

/// Something that can block until woken
#[derive(Clone)]
pub(crate) enum Waiter {
    Unit(WorkUnit),
    Thread(Arc<ThreadSignal>),
}

pub(crate) struct ThreadSignal {
    notified: AtomicBool,
    thread: Thread,
}

impl Waiter {
    /// Waiter for the caller; tasklets cannot block
    pub(crate) fn current() -> Result<Self> {
        match unit::current() {
            Some(unit) if unit.kind() == UnitKind::Stackful => Ok(Waiter::Unit(unit)),
            Some(unit) => Err(Error::Unsupported(format!(
                "tasklet {} cannot block",
                unit.id()
            ))),
            None => Ok(Waiter::Thread(Arc::new(ThreadSignal {
                notified: AtomicBool::new(false),
                thread: thread::current(),
            }))),
        }
    }

    /// Block the caller until [`Waiter::wake`] is called.
    ///
    /// Must be called by the same caller that created the waiter.
    pub(crate) fn block(&self) {
        match self {
            Waiter::Unit(unit) => unit.block_current(),
            Waiter::Thread(signal) => signal.wait(),
        }
    }

    pub(crate) fn wake(&self) {
        match self {
            Waiter::Unit(unit) => unit.wake(),
            Waiter::Thread(signal) => signal.notify(),
        }
    }
}

impl ThreadSignal {
    fn wait(&self) {
        let notified = || self.notified.load(Ordering::Acquire);
        if xstream::help_primary_until(&notified) {
            return;
        }
        while !notified() {
            thread::park();
        }
    }

    fn notify(&self) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}
