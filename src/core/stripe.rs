//! Stripe runtime state
//!
//! A [`Stripe`] is created for every usable stripe when its span is mounted
//! and lives until shutdown. Its id comes from a process-wide counter and is
//! never reused, which lets per-thread lock tables index by id.

use crate::core::open_dir::OpenDir;
use crate::core::span::StripeSpanDescriptor;
use crate::core::stripe_meta::{StripeGeometry, StripeMeta};
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Last id handed to a stripe instance.
static LAST_ID: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));

/// Process-unique stripe identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StripeId(pub usize);

impl StripeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a mounted stripe lives on disk.
#[derive(Debug, Clone, Serialize)]
pub struct StripeOrigin {
    pub span: PathBuf,
    /// Index in the span's stripe directory
    pub index: usize,
    pub descriptor: StripeSpanDescriptor,
    pub geometry: StripeGeometry,
}

/// Mutable stripe state, only reachable through the stripe mutex.
#[derive(Debug)]
pub struct StripeState {
    pub write_pos: i64,
    pub last_write_pos: i64,
    pub agg_pos: i64,
    /// Bytes waiting for the aggregation writer
    pub agg_todo_size: u64,
    pub generation: u32,
    pub phase: u32,
    pub cycle: u32,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub open_dir: OpenDir,
}

impl StripeState {
    fn from_meta(meta: &StripeMeta, max_writers: u16) -> Self {
        StripeState {
            write_pos: meta.write_pos,
            last_write_pos: meta.last_write_pos,
            agg_pos: meta.agg_pos,
            agg_todo_size: 0,
            generation: meta.generation,
            phase: meta.phase,
            cycle: meta.cycle,
            sync_serial: meta.sync_serial,
            write_serial: meta.write_serial,
            open_dir: OpenDir::new(max_writers),
        }
    }

    /// Descriptor reflecting the current state, for the next sync.
    pub fn to_meta(&self, base: &StripeMeta) -> StripeMeta {
        StripeMeta {
            write_pos: self.write_pos,
            last_write_pos: self.last_write_pos,
            agg_pos: self.agg_pos,
            generation: self.generation,
            phase: self.phase,
            cycle: self.cycle,
            sync_serial: self.sync_serial,
            write_serial: self.write_serial,
            ..base.clone()
        }
    }
}

/// Diagnostic counters for one stripe.
#[derive(Debug, Default)]
pub struct StripeStats {
    write_backlog_failures: CachePadded<AtomicU64>,
    lock_waits: CachePadded<AtomicU64>,
    writes_opened: AtomicU64,
    dispatched: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time copy of [`StripeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StripeStatsSnapshot {
    pub write_backlog_failures: u64,
    pub lock_waits: u64,
    pub writes_opened: u64,
    pub dispatched: u64,
    pub cancelled: u64,
}

impl StripeStats {
    pub(crate) fn record_backlog_failure(&self) {
        self.write_backlog_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_opened(&self) {
        self.writes_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, dispatched: u64, cancelled: u64) {
        self.dispatched.fetch_add(dispatched, Ordering::Relaxed);
        self.cancelled.fetch_add(cancelled, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StripeStatsSnapshot {
        StripeStatsSnapshot {
            write_backlog_failures: self.write_backlog_failures.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            writes_opened: self.writes_opened.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// A mounted stripe.
#[derive(Debug)]
pub struct Stripe {
    id: StripeId,
    origin: Option<StripeOrigin>,
    meta: StripeMeta,
    state: Mutex<StripeState>,
    stats: Arc<StripeStats>,
}

impl Stripe {
    /// Create the runtime state for a stripe described by `meta`,
    /// allocating a fresh id.
    pub fn new(meta: StripeMeta, max_writers: u16) -> Self {
        let id = StripeId(LAST_ID.fetch_add(1, Ordering::AcqRel));
        let state = StripeState::from_meta(&meta, max_writers);
        Stripe {
            id,
            origin: None,
            meta,
            state: Mutex::new(state),
            stats: Arc::default(),
        }
    }

    pub fn with_origin(mut self, origin: StripeOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Number of stripe ids allocated so far in this process.
    ///
    /// Every existing stripe has an id below this value.
    pub fn ids_allocated() -> usize {
        LAST_ID.load(Ordering::Acquire)
    }

    pub fn id(&self) -> StripeId {
        self.id
    }

    pub fn origin(&self) -> Option<&StripeOrigin> {
        self.origin.as_ref()
    }

    /// Descriptor the stripe was mounted from.
    pub fn meta(&self) -> &StripeMeta {
        &self.meta
    }

    /// Attempt the stripe mutex without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, StripeState>> {
        self.state.try_lock()
    }

    /// Block until the stripe mutex is held.
    ///
    /// For owners outside the cooperative workers (the aggregation writer,
    /// sync, tests). Workers use [`Stripe::try_lock`].
    pub fn lock(&self) -> MutexGuard<'_, StripeState> {
        self.state.lock()
    }

    pub fn stats(&self) -> &StripeStats {
        &self.stats
    }

    /// Shared counters, for queues that outlive a borrow of the stripe.
    pub(crate) fn stats_handle(&self) -> Arc<StripeStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = Stripe::new(StripeMeta::new(1), 1);
        let b = Stripe::new(StripeMeta::new(1), 1);
        assert!(b.id() > a.id());
        assert!(Stripe::ids_allocated() > b.id().index());
    }

    #[test]
    fn test_state_from_meta() {
        let mut meta = StripeMeta::new(2);
        meta.write_pos = 4096;
        meta.sync_serial = 9;
        let stripe = Stripe::new(meta.clone(), 1);

        let state = stripe.lock();
        assert_eq!(state.write_pos, 4096);
        assert_eq!(state.sync_serial, 9);
        assert_eq!(state.agg_todo_size, 0);
        assert!(state.open_dir.is_empty());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let stripe = Stripe::new(StripeMeta::new(1), 1);
        let guard = stripe.lock();
        assert!(stripe.try_lock().is_none());
        drop(guard);
        assert!(stripe.try_lock().is_some());
    }

    #[test]
    fn test_to_meta_keeps_freelist() {
        let meta = StripeMeta::new(3);
        let stripe = Stripe::new(meta.clone(), 1);
        let mut state = stripe.lock();
        state.write_pos = 8192;
        state.sync_serial += 1;

        let next = state.to_meta(stripe.meta());
        assert_eq!(next.write_pos, 8192);
        assert_eq!(next.sync_serial, meta.sync_serial + 1);
        assert_eq!(next.freelist, meta.freelist);
        assert_eq!(next.generation, meta.generation);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = StripeStats::default();
        stats.record_backlog_failure();
        stats.record_lock_wait();
        stats.record_dispatch(3, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.write_backlog_failures, 1);
        assert_eq!(snap.lock_waits, 1);
        assert_eq!(snap.dispatched, 3);
        assert_eq!(snap.cancelled, 1);
    }
}
