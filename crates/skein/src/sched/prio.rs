//! Strict-priority scheduler

use crate::sched::{SchedContext, SchedulerDef};

/// Always takes the next unit from the first non-empty pool.
///
/// Pools are visited in configured order on every dispatch, so a later pool
/// only runs while every earlier one is empty.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    dispatched: u64,
}

impl SchedulerDef for PriorityScheduler {
    fn run(&mut self, sched: &SchedContext<'_>) {
        let event_freq = u64::from(sched.config().event_freq.max(1));
        while !sched.has_to_stop() {
            let next = sched.pools().iter().find_map(|pool| sched.pop(pool));
            match next {
                Some(unit) => {
                    sched.run_unit(unit);
                    self.dispatched += 1;
                    if self.dispatched % event_freq == 0 {
                        sched.check_events();
                    }
                }
                None => sched.idle(),
            }
        }
    }
}
