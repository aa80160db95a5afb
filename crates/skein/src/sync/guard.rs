//! RAII guards for automatic mutex unlock

use crate::sync::Mutex;
use crate::Result;
use std::sync::Arc;

/// RAII guard for [`Mutex`] (auto-unlocks on drop)
///
/// Must be dropped by the work unit (or thread) that locked the mutex.
pub struct MutexGuard<'a> {
    /// Reference to the mutex
    mutex: &'a Mutex,
    /// Whether the guard has been manually unlocked
    unlocked: bool,
}

impl<'a> MutexGuard<'a> {
    /// The caller must own `mutex`
    pub(crate) fn new(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            unlocked: false,
        }
    }

    /// Manually unlock the mutex early (before drop)
    pub fn unlock(mut self) -> Result<()> {
        self.unlocked = true;
        self.mutex.unlock()
    }

    /// The guarded mutex, e.g. for [`CondVar::wait`](crate::sync::CondVar::wait)
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if !self.unlocked {
            // Ignore any errors on drop - we're already cleaning up
            let _ = self.mutex.unlock();
        }
    }
}

/// RAII guard for `Arc<Mutex>` (owned version)
///
/// Owns an `Arc` to the mutex, so it can be moved into a work unit's
/// closure independently of the original reference.
pub struct OwnedMutexGuard {
    /// Arc to the mutex
    mutex: Arc<Mutex>,
    /// Whether the guard has been manually unlocked
    unlocked: bool,
}

impl OwnedMutexGuard {
    /// Lock `mutex` and wrap it in a guard
    pub fn lock(mutex: Arc<Mutex>) -> Result<Self> {
        mutex.lock()?;
        Ok(Self {
            mutex,
            unlocked: false,
        })
    }

    /// Manually unlock the mutex early (before drop)
    pub fn unlock(mut self) -> Result<()> {
        self.unlocked = true;
        self.mutex.unlock()
    }

    /// Get a reference to the underlying mutex
    pub fn mutex(&self) -> &Arc<Mutex> {
        &self.mutex
    }
}

impl Drop for OwnedMutexGuard {
    fn drop(&mut self) {
        if !self.unlocked {
            let _ = self.mutex.unlock();
        }
    }
}
