//! Cooperative write-lock acquisition for one scheduler thread
//!
//! A [`StripeWorker`] never blocks on a stripe mutex. It tries the lock; on
//! contention the request is parked on the stripe's queue and resumed from a
//! later scheduling pass. Whoever does get the lock drains the queue before
//! doing its own work, so parked writers are not starved by new arrivals on
//! the same thread.

use crate::config::CacheConfig;
use crate::core::key::CacheKey;
use crate::core::lock::{Continuation, DispatchSummary, LockTable, LockWaiter, StripeEvent};
use crate::core::open_dir::OpenEntryHandle;
use crate::core::scheduler::{LocalScheduler, Scheduler, TriggerId};
use crate::core::stripe::{Stripe, StripeId};
use crate::error::{CacheError, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Kind of write a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// New object write
    Write,
    /// Rewrite of an existing object's metadata
    Update,
    /// Removal
    Remove,
}

impl WriteOp {
    /// Updates and removals free or reuse space, so they skip the backlog
    /// check.
    pub fn bypasses_backlog(self) -> bool {
        matches!(self, WriteOp::Update | WriteOp::Remove)
    }
}

/// A write request travelling through lock acquisition.
#[derive(Debug)]
pub struct WriteRequest {
    first_key: CacheKey,
    op: WriteOp,
    open_entry: Option<OpenEntryHandle>,
    continuation: Arc<Continuation>,
}

impl WriteRequest {
    pub fn new(first_key: CacheKey, op: WriteOp, continuation: Arc<Continuation>) -> Self {
        WriteRequest {
            first_key,
            op,
            open_entry: None,
            continuation,
        }
    }

    pub fn first_key(&self) -> &CacheKey {
        &self.first_key
    }

    pub fn op(&self) -> WriteOp {
        self.op
    }

    pub fn continuation(&self) -> &Arc<Continuation> {
        &self.continuation
    }

    /// The open entry registered for this request, once admitted.
    pub fn open_entry(&self) -> Option<&OpenEntryHandle> {
        self.open_entry.as_ref()
    }

    pub fn take_open_entry(&mut self) -> Option<OpenEntryHandle> {
        self.open_entry.take()
    }
}

/// Completion of a lock-taking operation.
#[derive(Debug)]
pub enum OpOutcome {
    /// The operation ran to completion.
    Done,
    /// The stripe was busy; the continuation will be woken with
    /// [`StripeEvent::LockReady`] unless the handle is cancelled first.
    Wait(LockWaiter),
}

impl OpOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, OpOutcome::Done)
    }

    pub fn waiter(&self) -> Option<&LockWaiter> {
        match self {
            OpOutcome::Done => None,
            OpOutcome::Wait(waiter) => Some(waiter),
        }
    }
}

/// Per-thread lock manager.
pub struct StripeWorker<S: Scheduler = LocalScheduler> {
    config: Arc<CacheConfig>,
    locks: LockTable,
    scheduler: S,
}

impl StripeWorker<LocalScheduler> {
    /// Worker driven by its own [`LocalScheduler`].
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self::with_scheduler(config, LocalScheduler::new())
    }

    /// Run one scheduling pass: fire the triggers due now.
    ///
    /// Returns how many continuations were woken.
    pub fn run_once(&mut self) -> usize {
        let due = self.scheduler.advance();
        due.into_iter()
            .filter_map(|(trigger, stripe)| self.on_trigger(stripe, trigger))
            .map(|summary| summary.dispatched)
            .sum()
    }

    /// Run passes until no trigger is armed, bounded by `max_passes`.
    ///
    /// Returns the number of passes run.
    pub fn run_until_idle(&mut self, max_passes: usize) -> usize {
        let mut passes = 0;
        while self.scheduler.pending() > 0 && passes < max_passes {
            self.run_once();
            passes += 1;
        }
        passes
    }
}

impl<S: Scheduler> StripeWorker<S> {
    /// Worker bound to a host scheduler.
    ///
    /// The lock table is sized for every stripe id allocated so far, so
    /// create workers after mounting.
    pub fn with_scheduler(config: Arc<CacheConfig>, scheduler: S) -> Self {
        let locks = LockTable::new(Stripe::ids_allocated(), config.dispatch_delay_ticks);
        StripeWorker {
            config,
            locks,
            scheduler,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Requests parked on `stripe` by this worker.
    pub fn queue_len(&self, stripe: StripeId) -> usize {
        self.locks.queue_len(stripe)
    }

    pub fn trigger(&self, stripe: StripeId) -> Option<TriggerId> {
        self.locks.trigger(stripe)
    }

    /// True when the queue of `stripe` is empty exactly when no trigger is
    /// armed for it.
    pub fn trigger_consistent(&self, stripe: StripeId) -> bool {
        self.locks.trigger_consistent(stripe)
    }

    /// Admit a write to `stripe`.
    ///
    /// On success the request holds an open entry for its first key.
    /// New writes are refused with [`CacheError::WriteBacklogExceeded`]
    /// while the stripe's aggregation backlog is above the configured
    /// threshold.
    pub fn open_write(&mut self, stripe: &Stripe, request: &mut WriteRequest) -> Result<OpOutcome> {
        let Some(mut state) = stripe.try_lock() else {
            return Ok(self.park(stripe, &request.continuation));
        };

        self.drain(stripe);

        let threshold = self.config.agg_write_backlog;
        if !request.op.bypasses_backlog() && state.agg_todo_size > threshold {
            stripe.stats().record_backlog_failure();
            warn!(
                stripe = %stripe.id(),
                backlog = state.agg_todo_size,
                threshold,
                "write backlog exceeded, rejecting write"
            );
            return Err(CacheError::WriteBacklogExceeded {
                stripe: stripe.id().index(),
                backlog: state.agg_todo_size,
                threshold,
            });
        }

        if request.open_entry.is_some() {
            error!(
                stripe = %stripe.id(),
                key = %request.first_key,
                "duplicate open entry"
            );
            if cfg!(debug_assertions) {
                panic!(
                    "duplicate open entry for key {} on stripe {}",
                    request.first_key,
                    stripe.id()
                );
            }
            return Err(CacheError::DuplicateOpenEntry {
                stripe: stripe.id().index(),
                key: request.first_key,
            });
        }

        let entry = state.open_dir.open_entry(&request.first_key, true);
        if let Some(entry) = entry.as_ref() {
            if entry.over_writer_limit() {
                debug!(
                    stripe = %stripe.id(),
                    key = %request.first_key,
                    active = entry.num_active(),
                    max_writers = entry.max_writers(),
                    "open entry above writer limit"
                );
            }
        }
        request.open_entry = entry;
        stripe.stats().record_write_opened();
        Ok(OpOutcome::Done)
    }

    /// Run `continuation` with the stripe mutex held.
    ///
    /// On contention, or while the continuation is busy on another thread,
    /// the continuation is parked and will later receive
    /// [`StripeEvent::LockReady`], at which point the caller retries.
    pub fn with_lock(&mut self, stripe: &Stripe, continuation: &Arc<Continuation>) -> OpOutcome {
        let Some(mut state) = stripe.try_lock() else {
            return self.park(stripe, continuation);
        };
        self.drain(stripe);
        if continuation.try_handle_event(StripeEvent::LockHeld(&mut state)) {
            return OpOutcome::Done;
        }
        // The continuation is busy elsewhere; never wait on it under the
        // stripe mutex.
        drop(state);
        self.park(stripe, continuation)
    }

    /// Release the open entry held by `request`.
    pub fn close_write(&mut self, stripe: &Stripe, request: &mut WriteRequest) -> OpOutcome {
        let Some(mut state) = stripe.try_lock() else {
            return self.park(stripe, &request.continuation);
        };
        self.drain(stripe);
        if let Some(entry) = request.open_entry.take() {
            if state.open_dir.close_entry(&entry) {
                debug!(stripe = %stripe.id(), key = %request.first_key, "open entry closed");
            }
        }
        OpOutcome::Done
    }

    /// A trigger fired for `stripe`. Hosts with their own scheduler call
    /// this from their event loop.
    pub fn on_trigger(&mut self, stripe: StripeId, trigger: TriggerId) -> Option<DispatchSummary> {
        self.locks.on_trigger(&mut self.scheduler, stripe, trigger)
    }

    fn park(&mut self, stripe: &Stripe, continuation: &Arc<Continuation>) -> OpOutcome {
        stripe.stats().record_lock_wait();
        self.locks.track(stripe.id(), &stripe.stats_handle());
        let waiter = self
            .locks
            .enqueue(&mut self.scheduler, stripe.id(), Arc::clone(continuation));
        debug!(
            stripe = %stripe.id(),
            queued = self.locks.queue_len(stripe.id()),
            "stripe busy, request parked"
        );
        OpOutcome::Wait(waiter)
    }

    fn drain(&mut self, stripe: &Stripe) {
        self.locks.dispatch(&mut self.scheduler, stripe.id());
    }
}
