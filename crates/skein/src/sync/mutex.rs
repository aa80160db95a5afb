//! Work-unit-aware mutex
//!
//! Unlike an OS-level mutex, waiting here suspends the calling work unit
//! while its execution stream keeps running others. Ownership is handed
//! directly to the first waiter on unlock (FIFO), so a released mutex can't
//! be barged by a newcomer.

use crate::sync::{MutexGuard, Owner, Waiter};
use crate::{Error, Result};
use crossbeam::atomic::AtomicCell;
use once_cell::sync::OnceCell;
use parking_lot::Mutex as ParkingLotMutex;
use std::collections::VecDeque;
use std::ops::Deref;

/// Mutual exclusion between work units (and plain threads)
pub struct Mutex {
    /// Current owner (None if unlocked)
    owner: AtomicCell<Option<Owner>>,

    /// FIFO wait queue of blocked callers
    wait_queue: ParkingLotMutex<VecDeque<(Owner, Waiter)>>,
}

impl Mutex {
    /// Create an unlocked mutex
    pub fn new() -> Self {
        Self {
            owner: AtomicCell::new(None),
            wait_queue: ParkingLotMutex::new(VecDeque::new()),
        }
    }

    /// Acquire the mutex, blocking the caller while another owner holds it.
    ///
    /// Locking a mutex the caller already owns is an error (not reentrant).
    pub fn lock(&self) -> Result<()> {
        let me = Owner::current();

        // Fast path
        if self.owner.compare_exchange(None, Some(me)).is_ok() {
            return Ok(());
        }

        let waiter = {
            let mut queue = self.wait_queue.lock();
            match self.owner.compare_exchange(None, Some(me)) {
                Ok(_) => return Ok(()),
                Err(Some(owner)) if owner == me => {
                    return Err(Error::InvalidState(format!(
                        "mutex already locked by {:?}",
                        me
                    )))
                }
                Err(_) => {}
            }
            let waiter = Waiter::current()?;
            queue.push_back((me, waiter.clone()));
            waiter
        };

        // Ownership is handed over by unlock before the wake-up
        waiter.block();
        Ok(())
    }

    /// Acquire the mutex if it is free; never blocks
    pub fn try_lock(&self) -> Result<bool> {
        let me = Owner::current();
        match self.owner.compare_exchange(None, Some(me)) {
            Ok(_) => Ok(true),
            Err(Some(owner)) if owner == me => Err(Error::InvalidState(format!(
                "mutex already locked by {:?}",
                me
            ))),
            Err(_) => Ok(false),
        }
    }

    /// Release the mutex, handing it to the next waiter if any
    pub fn unlock(&self) -> Result<()> {
        let me = Owner::current();
        let next = {
            let mut queue = self.wait_queue.lock();
            if self.owner.load() != Some(me) {
                return Err(Error::InvalidState(format!(
                    "unlock called by non-owner {:?}",
                    me
                )));
            }
            match queue.pop_front() {
                Some((owner, waiter)) => {
                    self.owner.store(Some(owner));
                    Some(waiter)
                }
                None => {
                    self.owner.store(None);
                    None
                }
            }
        };

        if let Some(waiter) = next {
            waiter.wake();
        }
        Ok(())
    }

    /// Lock and return a guard that unlocks on drop
    pub fn lock_guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Check current owner
    pub fn owner(&self) -> Option<Owner> {
        self.owner.load()
    }

    /// Check if the mutex is locked
    pub fn is_locked(&self) -> bool {
        self.owner.load().is_some()
    }

    /// Whether the caller holds the mutex
    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load() == Some(Owner::current())
    }

    /// Get number of waiting callers
    pub fn waiting_count(&self) -> usize {
        self.wait_queue.lock().len()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("owner", &self.owner())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

/// A [`Mutex`] usable as a `static`, set up on first use
///
/// ```ignore
/// static LOCK: StaticMutex = StaticMutex::new();
/// let _guard = LOCK.lock_guard()?;
/// ```
pub struct StaticMutex {
    cell: OnceCell<Mutex>,
}

impl StaticMutex {
    /// Create a static mutex; no work happens until first use
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Whether the mutex has been used yet
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl Deref for StaticMutex {
    type Target = Mutex;

    fn deref(&self) -> &Mutex {
        self.cell.get_or_init(Mutex::new)
    }
}

impl Default for StaticMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mutex_lock_unlock() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());

        mutex.lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.is_owned_by_current());
        assert_eq!(mutex.owner(), Some(Owner::current()));

        mutex.unlock().unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_mutex_relock_by_owner() {
        let mutex = Mutex::new();
        mutex.lock().unwrap();

        assert!(matches!(mutex.lock(), Err(Error::InvalidState(_))));
        assert!(matches!(mutex.try_lock(), Err(Error::InvalidState(_))));
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutex_unlock_by_non_owner() {
        let mutex = Arc::new(Mutex::new());
        assert!(matches!(mutex.unlock(), Err(Error::InvalidState(_))));

        mutex.lock().unwrap();
        let m = mutex.clone();
        let result = thread::spawn(move || m.unlock()).join().unwrap();
        assert!(matches!(result, Err(Error::InvalidState(_))));
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutex_try_lock_contended() {
        let mutex = Arc::new(Mutex::new());
        mutex.lock().unwrap();

        let m = mutex.clone();
        let acquired = thread::spawn(move || m.try_lock().unwrap()).join().unwrap();
        assert!(!acquired);
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutex_hands_off_in_fifo_order() {
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(ParkingLotMutex::new(Vec::new()));
        mutex.lock().unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let m = mutex.clone();
            let o = order.clone();
            handles.push(thread::spawn(move || {
                m.lock().unwrap();
                o.lock().push(i);
                m.unlock().unwrap();
            }));
            // Let each thread enqueue before the next one starts
            while mutex.waiting_count() < i + 1 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        mutex.unlock().unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_static_mutex_lazy() {
        static LOCK: StaticMutex = StaticMutex::new();

        // Other tests do not touch LOCK
        assert!(!LOCK.is_initialized());
        {
            let _guard = LOCK.lock_guard().unwrap();
            assert!(LOCK.is_locked());
        }
        assert!(LOCK.is_initialized());
        assert!(!LOCK.is_locked());
    }
}
