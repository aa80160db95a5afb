//! Reusable barrier

use crate::sync::Waiter;
use crate::{Error, Result};
use parking_lot::Mutex;

/// Blocks callers until `participants` of them have arrived
pub struct Barrier {
    state: Mutex<BarrierState>,
}

struct BarrierState {
    participants: usize,
    arrived: usize,
    /// Completed rounds
    generation: u64,
    waiters: Vec<Waiter>,
}

impl Barrier {
    /// Create a barrier for `participants` callers (at least one)
    pub fn new(participants: usize) -> Result<Self> {
        check_participants(participants)?;
        Ok(Self {
            state: Mutex::new(BarrierState {
                participants,
                arrived: 0,
                generation: 0,
                waiters: Vec::new(),
            }),
        })
    }

    /// Wait for the other participants of this round.
    ///
    /// The last arrival releases everybody and starts the next round.
    pub fn wait(&self) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock();
            if state.arrived + 1 == state.participants {
                state.arrived = 0;
                state.generation += 1;
                let waiters = std::mem::take(&mut state.waiters);
                drop(state);
                for waiter in waiters {
                    waiter.wake();
                }
                return Ok(());
            }
            let waiter = Waiter::current()?;
            state.arrived += 1;
            state.waiters.push(waiter.clone());
            waiter
        };
        waiter.block();
        Ok(())
    }

    /// Change the participant count; nobody may be waiting
    pub fn reinit(&self, participants: usize) -> Result<()> {
        check_participants(participants)?;
        let mut state = self.state.lock();
        if state.arrived > 0 {
            return Err(Error::InvalidState(format!(
                "{} caller(s) are waiting on the barrier",
                state.arrived
            )));
        }
        state.participants = participants;
        Ok(())
    }

    /// Callers needed per round
    pub fn participants(&self) -> usize {
        self.state.lock().participants
    }

    /// Callers waiting in the current round
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// Completed rounds
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

fn check_participants(participants: usize) -> Result<()> {
    if participants == 0 {
        return Err(Error::InvalidArgument(
            "a barrier needs at least one participant".into(),
        ));
    }
    Ok(())
}
