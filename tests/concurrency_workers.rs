//! Several cooperative workers contending for shared stripes

use span_cache::core::key::CacheKey;
use span_cache::core::lock::{Continuation, StripeEvent};
use span_cache::core::mount::{format_span, CacheMount};
use span_cache::core::stripe::Stripe;
use span_cache::core::stripe_meta::StripeMeta;
use span_cache::core::worker::{OpOutcome, StripeWorker, WriteOp, WriteRequest};
use span_cache::CacheConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_workers_share_stripes() {
    const THREADS: usize = 4;
    const WRITES: usize = 200;

    let span = NamedTempFile::new().unwrap();
    format_span(span.path(), &[(1, 64), (2, 64)]).unwrap();
    let mount = Arc::new(CacheMount::mount(
        &[span.path()],
        Arc::new(CacheConfig::default()),
    ));
    assert_eq!(mount.stripes().count(), 2);

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let mount = Arc::clone(&mount);
            std::thread::spawn(move || {
                let mut worker = mount.worker();
                let stripes: Vec<_> = mount.stripes().cloned().collect();

                for i in 0..WRITES {
                    let stripe = &stripes[i % stripes.len()];
                    let key = CacheKey::hash(format!("/t{}/obj{}", thread_id, i).as_bytes());
                    let mut request = WriteRequest::new(key, WriteOp::Write, Continuation::new(|_| {}));

                    loop {
                        match worker.open_write(stripe, &mut request).unwrap() {
                            OpOutcome::Done => break,
                            OpOutcome::Wait(waiter) => {
                                while !waiter.is_dispatched() {
                                    worker.run_once();
                                    std::thread::yield_now();
                                }
                            }
                        }
                    }
                    worker.close_write(stripe, &mut request);
                    while request.open_entry().is_some() {
                        // Stripe was busy; the close is retried once woken.
                        worker.run_once();
                        worker.close_write(stripe, &mut request);
                    }
                    assert!(worker.trigger_consistent(stripe.id()));
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let opened: u64 = mount
        .stripes()
        .map(|s| s.stats().snapshot().writes_opened)
        .sum();
    assert_eq!(opened, (THREADS * WRITES) as u64);
    for stripe in mount.stripes() {
        assert!(stripe.lock().open_dir.is_empty());
    }
}

#[test]
fn test_with_lock_serializes_state_updates() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    let span = NamedTempFile::new().unwrap();
    format_span(span.path(), &[(1, 64)]).unwrap();
    let mount = Arc::new(CacheMount::mount(
        &[span.path()],
        Arc::new(CacheConfig::default()),
    ));
    let applied = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mount = Arc::clone(&mount);
            let applied = Arc::clone(&applied);
            std::thread::spawn(move || {
                let mut worker = mount.worker();
                let stripe = Arc::clone(mount.stripes().next().unwrap());
                let cont = Continuation::new(move |event| {
                    if let StripeEvent::LockHeld(state) = event {
                        state.agg_todo_size += 1;
                        applied.fetch_add(1, Ordering::Relaxed);
                    }
                });

                for _ in 0..ROUNDS {
                    while let OpOutcome::Wait(waiter) = worker.with_lock(&stripe, &cont) {
                        while !waiter.is_dispatched() {
                            worker.run_once();
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let stripe = mount.stripes().next().unwrap();
    assert_eq!(stripe.lock().agg_todo_size, (THREADS * ROUNDS) as u64);
    assert_eq!(applied.load(Ordering::Relaxed), (THREADS * ROUNDS) as u64);
}

#[test]
fn test_busy_continuation_does_not_hold_stripe() {
    let stripe = Arc::new(Stripe::new(StripeMeta::new(1), 1));
    let cont = Continuation::new(|_| {});
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let cont = Arc::clone(&cont);
        std::thread::spawn(move || {
            let _busy = cont.hold();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
    };
    held_rx.recv().unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    {
        let stripe = Arc::clone(&stripe);
        let cont = Arc::clone(&cont);
        std::thread::spawn(move || {
            let mut worker = StripeWorker::new(Arc::new(CacheConfig::default()));
            let outcome = worker.with_lock(&stripe, &cont);
            result_tx.send((worker, outcome)).unwrap();
        });
    }

    let (mut worker, outcome) = result_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("with_lock waited on a busy continuation");
    let waiter = outcome.waiter().cloned().unwrap();
    assert!(stripe.try_lock().is_some());

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    worker.run_until_idle(4);
    assert!(waiter.is_dispatched());
}
