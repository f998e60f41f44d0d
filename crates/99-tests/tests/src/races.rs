//! Terminal and cancellation races across threads.

use std::sync::{Arc, Barrier};
use std::thread;

use flow_core::source::{create, just};
use flow_core::testing::{manual, test_consumer, CollectingSink};
use flow_core::{
    hooks, Cancellable, ConcatMap, DeferredScalarHandle, Emitter, FlowError, Source, SourceExt,
};
use parking_lot::Mutex;
use rand::Rng;

fn spin(iterations: u32) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}

/// Runs `a` and `b` on two threads released together, each after a random spin.
fn race<A, B>(rng: &mut impl Rng, a: A, b: B)
where
    A: FnOnce() + Send + 'static,
    B: FnOnce() + Send + 'static,
{
    let barrier = Arc::new(Barrier::new(2));
    let (spin_a, spin_b) = (rng.gen_range(0..64), rng.gen_range(0..64));
    let left = {
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            spin(spin_a);
            a();
        })
    };
    barrier.wait();
    spin(spin_b);
    b();
    left.join().expect("racing thread panicked");
}

/// Upstream and inner errors racing into one concat stage: one terminal, one report.
#[test]
fn concat_error_race() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let sink = Arc::new(CollectingSink::default());
        let (upstream, upstream_producer) = manual::<u32>();
        let (inner, inner_producer) = manual::<u32>();
        let (consumer, probe) = test_consumer::<u32>();
        ConcatMap::new(upstream, move |_| Ok(inner.clone()))
            .with_sink(sink.clone())
            .subscribe(Box::new(consumer));

        upstream_producer.next(Some(1));
        assert!(inner_producer.has_subscriber());
        inner_producer.next(Some(10));

        race(
            &mut rng,
            move || upstream_producer.error(FlowError::msg("upstream")),
            move || inner_producer.error(FlowError::msg("inner")),
        );

        assert_eq!(probe.values(), vec![Some(10)]);
        assert_eq!(probe.errors().len(), 1);
        assert_eq!(probe.completions(), 0);
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert_ne!(reports[0].to_string(), probe.errors()[0].to_string());
    }
}

/// An emitter error racing a cancel is seen exactly once, by the consumer or by the sink.
#[test]
fn emitter_error_cancel_race() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let sink = Arc::new(CollectingSink::default());
        let (consumer, probe) = test_consumer::<u8>();
        let emitter = Emitter::attach_with_sink(Box::new(consumer), sink.clone());
        let canceller = probe.clone();
        race(
            &mut rng,
            move || emitter.error(FlowError::msg("boom")),
            move || canceller.cancel(),
        );
        assert_eq!(probe.errors().len() + sink.len(), 1);
        assert_eq!(probe.completions(), 0);
    }
}

/// A deferred completion racing a cancel never breaks the protocol.
#[test]
fn deferred_scalar_complete_cancel_race() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let (consumer, probe) = test_consumer::<u64>();
        let handle = DeferredScalarHandle::new(Box::new(consumer));
        handle.start();
        let completer = handle.clone();
        race(
            &mut rng,
            move || completer.complete(Some(7)),
            move || handle.cancel(),
        );
        let values = probe.values();
        assert!(values.len() <= 1);
        assert!(probe.completions() <= values.len());
        assert!(probe.errors().is_empty());
    }
}

/// Items from concurrent producers all arrive, each producer's in its own order.
#[test]
fn concurrent_producers_into_concat() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 500;
    let (consumer, probe) = test_consumer::<u32>();
    let emitters: Arc<Mutex<Option<Emitter<u32>>>> = Arc::default();
    let store = emitters.clone();
    create::<u32, _>(move |emitter| {
        *store.lock() = Some(emitter);
        Ok(())
    })
    .concat_map(|v| Ok(just(v)))
    .subscribe(Box::new(consumer));
    let emitter = emitters.lock().clone().expect("subscribed");

    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let emitter = emitter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    emitter.next(Some(t * PER_THREAD + i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("producer panicked");
    }
    emitter.complete();

    let values: Vec<u32> = probe.values().into_iter().flatten().collect();
    assert_eq!(values.len(), (THREADS * PER_THREAD) as usize);
    assert_eq!(probe.completions(), 1);
    for t in 0..THREADS {
        let own: Vec<u32> = values
            .iter()
            .copied()
            .filter(|v| v / PER_THREAD == t)
            .collect();
        assert_eq!(own, (t * PER_THREAD..(t + 1) * PER_THREAD).collect::<Vec<_>>());
    }
}

/// Errors nobody can receive reach the process-wide sink.
#[test]
fn late_error_reaches_global_sink() {
    const MARKER: &str = "late error after completion";
    let sink = Arc::new(CollectingSink::default());
    let previous = hooks::set_undeliverable_sink(sink.clone());

    let (consumer, probe) = test_consumer::<u8>();
    create::<u8, _>(|emitter| {
        emitter.complete();
        emitter.error(FlowError::msg(MARKER));
        Ok(())
    })
    .subscribe(Box::new(consumer));

    match previous {
        Some(previous) => {
            hooks::set_undeliverable_sink(previous);
        }
        None => hooks::reset(),
    }
    probe.assert_empty();
    let reports: Vec<_> = sink
        .take()
        .into_iter()
        .filter(|error| error.to_string() == MARKER)
        .collect();
    assert_eq!(reports.len(), 1);
}

#[test]
#[ignore]
fn slow_concat_error_race_many() {
    let mut rng = rand::thread_rng();
    for _ in 0..20_000 {
        let sink = Arc::new(CollectingSink::default());
        let (upstream, upstream_producer) = manual::<u32>();
        let (inner, inner_producer) = manual::<u32>();
        let (consumer, probe) = test_consumer::<u32>();
        ConcatMap::new(upstream, move |_| Ok(inner.clone()))
            .with_sink(sink.clone())
            .subscribe(Box::new(consumer));
        upstream_producer.next(None);
        race(
            &mut rng,
            move || upstream_producer.error(FlowError::msg("upstream")),
            move || inner_producer.error(FlowError::msg("inner")),
        );
        assert_eq!(probe.errors().len() + sink.len(), 2);
    }
}
