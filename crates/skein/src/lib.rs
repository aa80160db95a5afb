//! Skein: a cooperative M:N user-level threading runtime
//!
//! This crate multiplexes many lightweight work units onto a handful of
//! execution streams (OS threads):
//! - Work units: stackful ULTs (suspendable, migratable) and stackless tasklets
//! - Pools of ready units with FIFO/LIFO/priority ordering
//! - Pluggable schedulers (work-stealing and priority built in)
//! - Execution streams, each running one scheduler at a time
//! - Synchronization primitives that suspend work units instead of threads
//!   (Mutex, RwLock, CondVar, Barrier, Future, Eventual, Key)
//!
//! ```ignore
//! let rt = skein::Runtime::init()?;
//! let pool = rt.main_pool()?;
//! let unit = rt.spawn(&pool, || println!("hello from a ULT"))?;
//! unit.free()?;
//! rt.finalize()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod pool;
pub mod runtime;
pub mod sched;
pub mod sync;
pub mod unit;
pub mod xstream;

pub use config::RuntimeConfig;
pub use pool::{Pool, PoolAccess, PoolId, PoolKind};
pub use runtime::{PoolInfo, Runtime, RuntimeInfo, RuntimeStats, StreamInfo};
pub use sched::{
    BasicScheduler, PriorityScheduler, SchedConfig, SchedContext, SchedState, Scheduler,
    SchedulerDef, SchedulerId, StealOrder,
};
pub use unit::{yield_now, UnitAttr, UnitId, UnitKind, UnitState, WorkUnit};
pub use xstream::{current_rank, ExecutionStream, StreamState};

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed argument or attribute (destroyed pool, bad stack size, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An execution context or native thread could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation on a freed/terminated/wrong-state handle
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation not available for this kind of work unit
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A bounded wait layered on top of the core primitives expired
    #[error("Operation timed out")]
    Timeout,
}

/// Runtime result
pub type Result<T> = std::result::Result<T, Error>;

/// Report a broken internal invariant and abort the process.
///
/// Continuing after corrupted scheduling bookkeeping risks running a unit
/// twice or losing it, so this is never recoverable.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!(message = msg, "fatal runtime invariant violation");
    eprintln!("skein: fatal: {}", msg);
    std::process::abort()
}
