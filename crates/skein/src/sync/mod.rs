//! Synchronization primitives for work-unit coordination
//!
//! Every primitive here blocks at the work-unit level: a stackful unit that
//! has to wait is suspended and its execution stream keeps running other
//! units. A plain thread that is not a work unit parks instead (the primary
//! thread drives its scheduler while it waits). A tasklet cannot be
//! suspended, so a tasklet that would have to wait gets
//! [`Error::Unsupported`](crate::Error::Unsupported).

mod barrier;
mod cond;
mod eventual;
mod future;
mod guard;
mod key;
mod latch;
mod mutex;
mod rwlock;
mod waiter;

pub use barrier::Barrier;
pub use cond::CondVar;
pub use eventual::Eventual;
pub use future::Future;
pub use guard::{MutexGuard, OwnedMutexGuard};
pub use key::{Key, KeyId};
pub use mutex::{Mutex, StaticMutex};
pub use rwlock::RwLock;
pub use waiter::Owner;

pub(crate) use key::KeySlot;
pub(crate) use latch::Latch;
pub(crate) use waiter::Waiter;
