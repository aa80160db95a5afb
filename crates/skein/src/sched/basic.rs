//! Work-stealing scheduler

use crate::sched::{SchedContext, SchedulerDef};
use crate::unit::WorkUnit;
use rand::Rng;

/// Which victim pool a [`BasicScheduler`] tries first when stealing
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StealOrder {
    /// Start one pool further on every steal attempt
    #[default]
    RoundRobin,
    /// Always start at the second pool
    Fixed,
    /// Start at a random victim
    Random,
}

/// Pops its own pool (the first one) and steals from the others
#[derive(Debug, Default)]
pub struct BasicScheduler {
    order: StealOrder,
    next_victim: usize,
    dispatched: u64,
}

impl BasicScheduler {
    /// Create a scheduler stealing in `order`
    pub fn new(order: StealOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Steal order in use
    pub fn order(&self) -> StealOrder {
        self.order
    }

    fn next_unit(&mut self, sched: &SchedContext<'_>) -> Option<WorkUnit> {
        let (own, victims) = sched.pools().split_first()?;
        if let Some(unit) = sched.pop(own) {
            return Some(unit);
        }
        if victims.is_empty() {
            return None;
        }

        let start = match self.order {
            StealOrder::Fixed => 0,
            StealOrder::RoundRobin => {
                let start = self.next_victim % victims.len();
                self.next_victim = self.next_victim.wrapping_add(1);
                start
            }
            StealOrder::Random => rand::thread_rng().gen_range(0..victims.len()),
        };
        (0..victims.len())
            .map(|i| &victims[(start + i) % victims.len()])
            .find_map(|pool| sched.steal(pool))
    }
}

impl SchedulerDef for BasicScheduler {
    fn run(&mut self, sched: &SchedContext<'_>) {
        let event_freq = u64::from(sched.config().event_freq.max(1));
        while !sched.has_to_stop() {
            match self.next_unit(sched) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        assert_eq!(BasicScheduler::default().order(), StealOrder::RoundRobin);
        assert_eq!(BasicScheduler::new(StealOrder::Fixed).order(), StealOrder::Fixed);
    }
}
