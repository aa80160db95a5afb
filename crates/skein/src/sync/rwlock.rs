//! Work-unit-aware reader-writer lock
//!
//! Policy: a reader arriving while a writer holds the lock or waits for it
//! queues behind that writer, so writers cannot starve. When a writer
//! releases the lock, every queued reader is admitted at once; otherwise
//! the next queued writer gets it. A reader that already holds a read lock
//! may take it again without queueing.

use crate::sync::{Owner, Waiter};
use crate::{Error, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Shared/exclusive lock between work units (and plain threads)
pub struct RwLock {
    state: Mutex<RwState>,
}

#[derive(Default)]
struct RwState {
    /// Read locks held, per holder
    readers: FxHashMap<Owner, usize>,
    reader_count: usize,
    writer: Option<Owner>,
    waiting_readers: VecDeque<(Owner, Waiter)>,
    waiting_writers: VecDeque<(Owner, Waiter)>,
}

impl RwState {
    fn add_reader(&mut self, owner: Owner) {
        *self.readers.entry(owner).or_insert(0) += 1;
        self.reader_count += 1;
    }

    /// Pick who gets the lock after a release
    fn grant(&mut self, after_writer: bool) -> Vec<Waiter> {
        if !(after_writer && !self.waiting_readers.is_empty()) {
            if let Some((owner, waiter)) = self.waiting_writers.pop_front() {
                self.writer = Some(owner);
                return vec![waiter];
            }
        }
        let admitted: Vec<_> = self.waiting_readers.drain(..).collect();
        admitted
            .into_iter()
            .map(|(owner, waiter)| {
                self.add_reader(owner);
                waiter
            })
            .collect()
    }
}

impl RwLock {
    /// Create an unlocked reader-writer lock
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RwState::default()),
        }
    }

    /// Acquire a shared lock
    pub fn rdlock(&self) -> Result<()> {
        let me = Owner::current();
        let waiter = {
            let mut state = self.state.lock();
            if state.writer == Some(me) {
                return Err(Error::InvalidState(format!(
                    "{:?} already holds the write lock",
                    me
                )));
            }
            let free = state.writer.is_none() && state.waiting_writers.is_empty();
            if free || state.readers.contains_key(&me) {
                state.add_reader(me);
                return Ok(());
            }
            let waiter = Waiter::current()?;
            state.waiting_readers.push_back((me, waiter.clone()));
            waiter
        };
        waiter.block();
        Ok(())
    }

    /// Acquire the exclusive lock
    pub fn wrlock(&self) -> Result<()> {
        let me = Owner::current();
        let waiter = {
            let mut state = self.state.lock();
            if state.writer == Some(me) || state.readers.contains_key(&me) {
                return Err(Error::InvalidState(format!(
                    "{:?} already holds the lock",
                    me
                )));
            }
            if state.writer.is_none() && state.reader_count == 0 {
                state.writer = Some(me);
                return Ok(());
            }
            let waiter = Waiter::current()?;
            state.waiting_writers.push_back((me, waiter.clone()));
            waiter
        };
        waiter.block();
        Ok(())
    }

    /// Release the lock held by the caller (read or write)
    pub fn unlock(&self) -> Result<()> {
        let me = Owner::current();
        let wake = {
            let mut state = self.state.lock();
            if state.writer == Some(me) {
                state.writer = None;
                state.grant(true)
            } else if let Some(held) = state.readers.get_mut(&me) {
                *held -= 1;
                if *held == 0 {
                    state.readers.remove(&me);
                }
                state.reader_count -= 1;
                if state.reader_count == 0 {
                    state.grant(false)
                } else {
                    Vec::new()
                }
            } else {
                return Err(Error::InvalidState(format!(
                    "unlock called by {:?}, which holds no lock",
                    me
                )));
            }
        };

        for waiter in wake {
            waiter.wake();
        }
        Ok(())
    }

    /// Number of read locks currently held
    pub fn readers(&self) -> usize {
        self.state.lock().reader_count
    }

    /// Whether a writer holds the lock
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
