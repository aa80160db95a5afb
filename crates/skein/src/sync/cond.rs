//! Condition variable paired with a [`Mutex`]

use crate::sync::{Mutex, Owner, Waiter};
use crate::{Error, Result};
use parking_lot::Mutex as ParkingLotMutex;
use std::collections::VecDeque;

/// Condition variable whose waiters are work units (or plain threads)
pub struct CondVar {
    waiters: ParkingLotMutex<VecDeque<Waiter>>,
}

impl CondVar {
    /// Create a condition variable with no waiters
    pub fn new() -> Self {
        Self {
            waiters: ParkingLotMutex::new(VecDeque::new()),
        }
    }

    /// Atomically release `mutex` and wait for a signal, then relock it.
    ///
    /// The caller must own `mutex`. Wake-ups may be spurious from the
    /// caller's point of view (another waiter may consume the condition
    /// first), so re-check the predicate in a loop.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        let me = Owner::current();
        if mutex.owner() != Some(me) {
            return Err(Error::InvalidState(format!(
                "condition wait by {:?}, which does not own the mutex",
                me
            )));
        }
        let waiter = Waiter::current()?;
        self.waiters.lock().push_back(waiter.clone());

        // Registered before the unlock, so a signal in between is not lost
        mutex.unlock()?;
        waiter.block();
        mutex.lock()
    }

    /// Wake one waiter
    pub fn signal(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        let waiters: Vec<_> = self.waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Get number of waiting callers
    pub fn waiting_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_requires_ownership() {
        let cond = CondVar::new();
        let mutex = Mutex::new();
        assert!(matches!(cond.wait(&mutex), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_signal_without_waiters() {
        let cond = CondVar::new();
        cond.signal();
        cond.broadcast();
        assert_eq!(cond.waiting_count(), 0);
    }

    #[test]
    fn test_wait_signal_between_threads() {
        let mutex = Arc::new(Mutex::new());
        let cond = Arc::new(CondVar::new());
        let ready = Arc::new(AtomicBool::new(false));

        let (m, c, r) = (mutex.clone(), cond.clone(), ready.clone());
        let waiter = thread::spawn(move || {
            m.lock().unwrap();
            while !r.load(Ordering::SeqCst) {
                c.wait(&m).unwrap();
            }
            assert!(m.is_owned_by_current());
            m.unlock().unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        mutex.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
        cond.signal();
        mutex.unlock().unwrap();

        waiter.join().unwrap();
    }
}
