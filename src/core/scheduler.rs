//! Scheduling seam for deferred lock dispatch
//!
//! The engine never owns threads. It only asks the thread it runs on to
//! wake it up later for a given stripe, and to forget such a wake-up. The
//! [`LocalScheduler`] is a tick-driven implementation used by
//! [`StripeWorker`](crate::core::worker::StripeWorker) and in tests; an
//! embedding event loop can provide its own.

use crate::core::stripe::StripeId;
use std::collections::BTreeMap;

/// Identifies a scheduled wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TriggerId(u64);

/// The two primitives the lock manager consumes from its host scheduler.
pub trait Scheduler {
    /// Schedule a wake-up for `stripe` after `ticks` scheduling passes.
    ///
    /// `ticks` is at least 1: a wake-up never fires in the pass that
    /// scheduled it.
    fn schedule_in(&mut self, stripe: StripeId, ticks: u64) -> TriggerId;

    /// Cancel a wake-up. Cancelling an already fired trigger is a no-op.
    fn cancel(&mut self, trigger: TriggerId);
}

/// Single-threaded tick scheduler.
#[derive(Debug, Default)]
pub struct LocalScheduler {
    tick: u64,
    next_id: u64,
    pending: BTreeMap<TriggerId, (u64, StripeId)>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current scheduling pass.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of armed triggers.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_armed(&self, trigger: TriggerId) -> bool {
        self.pending.contains_key(&trigger)
    }

    /// Start the next pass and return the triggers due in it, in the order
    /// they were scheduled.
    pub fn advance(&mut self) -> Vec<(TriggerId, StripeId)> {
        self.tick += 1;
        let tick = self.tick;
        let due: Vec<TriggerId> = self
            .pending
            .iter()
            .filter(|(_, (at, _))| *at <= tick)
            .map(|(id, _)| *id)
            .collect();

        due.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, stripe)| (id, stripe)))
            .collect()
    }
}

impl Scheduler for LocalScheduler {
    fn schedule_in(&mut self, stripe: StripeId, ticks: u64) -> TriggerId {
        let id = TriggerId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id, (self.tick + ticks.max(1), stripe));
        id
    }

    fn cancel(&mut self, trigger: TriggerId) {
        self.pending.remove(&trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_fires_in_current_pass() {
        let mut sched = LocalScheduler::new();
        let t = sched.schedule_in(StripeId(0), 0);
        assert!(sched.is_armed(t));

        let fired = sched.advance();
        assert_eq!(fired, vec![(t, StripeId(0))]);
        assert!(!sched.is_armed(t));
        assert!(sched.advance().is_empty());
    }

    #[test]
    fn test_delay_and_order() {
        let mut sched = LocalScheduler::new();
        let late = sched.schedule_in(StripeId(1), 2);
        let a = sched.schedule_in(StripeId(2), 1);
        let b = sched.schedule_in(StripeId(3), 1);

        assert_eq!(sched.advance(), vec![(a, StripeId(2)), (b, StripeId(3))]);
        assert_eq!(sched.advance(), vec![(late, StripeId(1))]);
        assert_eq!(sched.tick(), 2);
    }

    #[test]
    fn test_cancel() {
        let mut sched = LocalScheduler::new();
        let t = sched.schedule_in(StripeId(0), 1);
        sched.cancel(t);
        assert_eq!(sched.pending(), 0);
        assert!(sched.advance().is_empty());
        // Cancelling again is harmless.
        sched.cancel(t);
    }
}
