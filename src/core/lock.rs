//! Per-stripe wait queues for write admission
//!
//! When a request cannot take a stripe mutex it is parked in that stripe's
//! FIFO queue and a one-shot trigger is armed on the owning thread's
//! scheduler. When the trigger fires (or when another request on the same
//! thread gets the stripe mutex) the queue is drained: every parked request
//! whose own continuation mutex is free is woken with
//! [`StripeEvent::LockReady`], the rest go back on the queue.
//!
//! The queue state belongs to one worker thread ([`LockTable`] is not
//! shared), so it is only ever touched through `&mut`. Draining swaps the
//! queue out first; anything parked while the drain runs lands in the fresh
//! queue and waits for the next pass.
//!
//! Invariant after every enqueue and every drain: the queue is empty exactly
//! when no trigger is armed. Breaking it either strands parked requests or
//! leaves a trigger firing for nothing.

use crate::core::scheduler::{Scheduler, TriggerId};
use crate::core::stripe::{StripeId, StripeState, StripeStats};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Signal delivered to a continuation.
pub enum StripeEvent<'a> {
    /// The request was parked and the stripe is worth retrying now.
    LockReady,
    /// The stripe mutex is held on the caller's behalf for the duration of
    /// the call.
    LockHeld(&'a mut StripeState),
}

impl StripeEvent<'_> {
    pub fn is_lock_held(&self) -> bool {
        matches!(self, StripeEvent::LockHeld(_))
    }
}

impl fmt::Debug for StripeEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StripeEvent::LockReady => f.write_str("LockReady"),
            StripeEvent::LockHeld(_) => f.write_str("LockHeld"),
        }
    }
}

type Handler = Box<dyn FnMut(StripeEvent<'_>) + Send>;

/// A requester's callback together with the mutex that serializes it.
///
/// The mutex is distinct from the stripe mutex. While the owner holds it
/// (see [`Continuation::hold`]) the continuation cannot be dispatched and
/// stays queued.
pub struct Continuation {
    handler: Mutex<Handler>,
}

/// Keeps a continuation busy; dropping it releases the continuation.
pub struct ContinuationGuard<'a> {
    _guard: MutexGuard<'a, Handler>,
}

impl Continuation {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: FnMut(StripeEvent<'_>) + Send + 'static,
    {
        Arc::new(Continuation {
            handler: Mutex::new(Box::new(handler)),
        })
    }

    /// Invoke the continuation only if its mutex is free.
    pub fn try_handle_event(&self, event: StripeEvent<'_>) -> bool {
        match self.handler.try_lock() {
            Some(mut handler) => {
                (*handler)(event);
                true
            }
            None => false,
        }
    }

    /// Hold the continuation's mutex.
    pub fn hold(&self) -> ContinuationGuard<'_> {
        ContinuationGuard {
            _guard: self.handler.lock(),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("busy", &self.handler.is_locked())
            .finish()
    }
}

#[derive(Debug)]
struct QueueEntry {
    continuation: Arc<Continuation>,
    cancelled: AtomicBool,
    dispatched: AtomicBool,
}

/// Handle to a parked request, returned with `Wait`.
#[derive(Debug, Clone)]
pub struct LockWaiter {
    entry: Arc<QueueEntry>,
}

impl LockWaiter {
    /// Withdraw the request. A cancelled entry is dropped at the next drain
    /// without its continuation being invoked.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }

    /// True once the continuation has been woken from the queue.
    pub fn is_dispatched(&self) -> bool {
        self.entry.dispatched.load(Ordering::Acquire)
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub cancelled: usize,
    pub requeued: usize,
}

/// Queue and trigger for one stripe on one thread.
#[derive(Debug, Default)]
struct LockData {
    queue: VecDeque<Arc<QueueEntry>>,
    trigger: Option<TriggerId>,
    /// Counters of the stripe, once something was parked on it
    stats: Option<Arc<StripeStats>>,
}

impl LockData {
    fn enqueue<S: Scheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        stripe: StripeId,
        continuation: Arc<Continuation>,
        delay: u64,
    ) -> LockWaiter {
        let entry = Arc::new(QueueEntry {
            continuation,
            cancelled: AtomicBool::new(false),
            dispatched: AtomicBool::new(false),
        });
        self.queue.push_back(Arc::clone(&entry));
        self.update_trigger(scheduler, stripe, delay);
        LockWaiter { entry }
    }

    /// Arm the trigger iff something is waiting.
    fn update_trigger<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S, stripe: StripeId, delay: u64) {
        if self.queue.is_empty() {
            if let Some(trigger) = self.trigger.take() {
                scheduler.cancel(trigger);
            }
        } else if self.trigger.is_none() {
            self.trigger = Some(scheduler.schedule_in(stripe, delay));
        }
    }

    fn dispatch<S: Scheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        stripe: StripeId,
        delay: u64,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let local = std::mem::take(&mut self.queue);

        for entry in local {
            if entry.cancelled.load(Ordering::Acquire) {
                summary.cancelled += 1;
                continue;
            }
            if entry.continuation.try_handle_event(StripeEvent::LockReady) {
                entry.dispatched.store(true, Ordering::Release);
                summary.dispatched += 1;
            } else {
                // Owner is busy with it; retry on a later pass.
                self.queue.push_back(entry);
                summary.requeued += 1;
            }
        }

        self.update_trigger(scheduler, stripe, delay);
        summary
    }
}

/// Lock queues of every stripe, as seen by one worker thread.
///
/// Indexed by stripe id. Sized up front from the ids allocated at mount;
/// ids allocated later are accommodated through `&mut self`, which only the
/// owning worker has.
#[derive(Debug)]
pub struct LockTable {
    slots: Vec<LockData>,
    dispatch_delay: u64,
}

impl LockTable {
    /// `capacity` is the number of stripe ids to pre-size for.
    pub fn new(capacity: usize, dispatch_delay: u64) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, LockData::default);
        LockTable {
            slots,
            dispatch_delay: dispatch_delay.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&mut self, stripe: StripeId) -> &mut LockData {
        if stripe.index() >= self.slots.len() {
            self.slots.resize_with(stripe.index() + 1, LockData::default);
        }
        &mut self.slots[stripe.index()]
    }

    /// Park `continuation` on `stripe` and make sure a trigger is armed.
    pub fn enqueue<S: Scheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        stripe: StripeId,
        continuation: Arc<Continuation>,
    ) -> LockWaiter {
        let delay = self.dispatch_delay;
        let waiter = self.slot(stripe).enqueue(scheduler, stripe, continuation, delay);
        trace!(%stripe, queued = self.queue_len(stripe), "parked request on stripe");
        waiter
    }

    /// Report drains of `stripe` to `stats`, whichever path runs them.
    pub fn track(&mut self, stripe: StripeId, stats: &Arc<StripeStats>) {
        let slot = self.slot(stripe);
        if slot.stats.is_none() {
            slot.stats = Some(Arc::clone(stats));
        }
    }

    /// Drain the queue of `stripe`.
    pub fn dispatch<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S, stripe: StripeId) -> DispatchSummary {
        let delay = self.dispatch_delay;
        let slot = self.slot(stripe);
        if slot.queue.is_empty() && slot.trigger.is_none() {
            return DispatchSummary::default();
        }
        let summary = slot.dispatch(scheduler, stripe, delay);
        if let Some(stats) = &slot.stats {
            if summary.dispatched > 0 || summary.cancelled > 0 {
                stats.record_dispatch(summary.dispatched as u64, summary.cancelled as u64);
            }
        }
        trace!(
            %stripe,
            dispatched = summary.dispatched,
            cancelled = summary.cancelled,
            requeued = summary.requeued,
            "drained stripe queue"
        );
        summary
    }

    /// A trigger fired. Stale triggers (already replaced or cancelled) are
    /// ignored.
    pub fn on_trigger<S: Scheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        stripe: StripeId,
        trigger: TriggerId,
    ) -> Option<DispatchSummary> {
        let slot = self.slot(stripe);
        if slot.trigger != Some(trigger) {
            return None;
        }
        slot.trigger = None;
        Some(self.dispatch(scheduler, stripe))
    }

    pub fn queue_len(&self, stripe: StripeId) -> usize {
        self.slots.get(stripe.index()).map_or(0, |s| s.queue.len())
    }

    pub fn trigger(&self, stripe: StripeId) -> Option<TriggerId> {
        self.slots.get(stripe.index()).and_then(|s| s.trigger)
    }

    /// Check the queue/trigger invariant for `stripe`.
    pub fn trigger_consistent(&self, stripe: StripeId) -> bool {
        self.slots
            .get(stripe.index())
            .map_or(true, |s| s.queue.is_empty() == s.trigger.is_none())
    }
}
