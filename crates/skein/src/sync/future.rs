//! Multi-producer future
//!
//! A future completes after a fixed number of `set` calls. The optional
//! callback receives every payload, in the order they were set, on the
//! producer that completes the future, before any waiter is released.

use crate::sync::Waiter;
use crate::{Error, Result};
use parking_lot::Mutex;

type Callback<T> = Box<dyn FnMut(Vec<T>) + Send>;

/// Completes once `slots` payloads have been set
pub struct Future<T> {
    state: Mutex<FutureState<T>>,
}

struct FutureState<T> {
    slots: usize,
    /// Sets accepted in the current cycle
    set_count: usize,
    payloads: Vec<T>,
    callback: Option<Callback<T>>,
    done: bool,
    waiters: Vec<Waiter>,
}

impl<T: Send + 'static> Future<T> {
    /// Create a future expecting `slots` payloads
    pub fn new(slots: usize) -> Result<Self> {
        Self::build(slots, None)
    }

    /// Create a future whose callback consumes the payloads on completion
    pub fn with_callback(slots: usize, callback: impl FnMut(Vec<T>) + Send + 'static) -> Result<Self> {
        Self::build(slots, Some(Box::new(callback)))
    }

    fn build(slots: usize, callback: Option<Callback<T>>) -> Result<Self> {
        if slots == 0 {
            return Err(Error::InvalidArgument(
                "a future needs at least one slot".into(),
            ));
        }
        Ok(Self {
            state: Mutex::new(FutureState {
                slots,
                set_count: 0,
                payloads: Vec::with_capacity(slots),
                callback,
                done: false,
                waiters: Vec::new(),
            }),
        })
    }

    /// Contribute one payload; the last one completes the future
    pub fn set(&self, payload: T) -> Result<()> {
        let (payloads, mut callback) = {
            let mut state = self.state.lock();
            if state.set_count == state.slots {
                return Err(Error::InvalidState(format!(
                    "future already received its {} payload(s)",
                    state.slots
                )));
            }
            state.set_count += 1;
            state.payloads.push(payload);
            if state.set_count < state.slots {
                return Ok(());
            }
            (std::mem::take(&mut state.payloads), state.callback.take())
        };

        // Completing producer: callback first, outside the lock
        if let Some(cb) = callback.as_mut() {
            cb(payloads);
        }

        let waiters = {
            let mut state = self.state.lock();
            state.callback = callback;
            state.done = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.wake();
        }
        Ok(())
    }

    /// Block until every payload has been set
    pub fn wait(&self) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock();
            if state.done {
                return Ok(());
            }
            let waiter = Waiter::current()?;
            state.waiters.push(waiter.clone());
            waiter
        };
        waiter.block();
        Ok(())
    }

    /// Whether the future completed; never blocks
    pub fn test(&self) -> bool {
        self.state.lock().done
    }

    /// Payloads received so far in the current cycle
    pub fn received(&self) -> usize {
        self.state.lock().set_count
    }

    /// Start a new cycle; fails while callers wait on an incomplete future
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.waiters.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} caller(s) are waiting on the future",
                state.waiters.len()
            )));
        }
        if state.set_count == state.slots && !state.done {
            return Err(Error::InvalidState("future is completing".into()));
        }
        state.payloads.clear();
        state.set_count = 0;
        state.done = false;
        Ok(())
    }
}
