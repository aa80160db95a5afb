//! One-shot (resettable) event used for termination waits

use crate::sync::Waiter;
use crate::Result;
use parking_lot::Mutex;

pub(crate) struct Latch {
    state: Mutex<LatchState>,
}

struct LatchState {
    set: bool,
    waiters: Vec<Waiter>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                set: false,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Block until the latch is set; returns at once if it already is
    pub(crate) fn wait(&self) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock();
            if state.set {
                return Ok(());
            }
            let waiter = Waiter::current()?;
            state.waiters.push(waiter.clone());
            waiter
        };
        waiter.block();
        Ok(())
    }

    /// Set the latch and release every waiter
    pub(crate) fn set(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.set = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Clear a set latch if `rearm` succeeds; both happen under the latch lock
    pub(crate) fn reset_if(&self, rearm: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock();
        if !state.set || !rearm() {
            return false;
        }
        state.set = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_latch_set_releases_waiters() {
        let latch = Arc::new(Latch::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let l = latch.clone();
                thread::spawn(move || l.wait().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(!latch.is_set());
        latch.set();
        for h in handles {
            h.join().unwrap();
        }
        assert!(latch.is_set());

        // Already set
        latch.wait().unwrap();
        assert!(!latch.reset_if(|| false));
        assert!(latch.is_set());
        assert!(latch.reset_if(|| true));
        assert!(!latch.is_set());
    }

    #[test]
    fn test_reset_requires_set_latch() {
        let latch = Latch::new();
        let mut rearmed = false;
        assert!(!latch.reset_if(|| {
            rearmed = true;
            true
        }));
        assert!(!rearmed);
    }
}
