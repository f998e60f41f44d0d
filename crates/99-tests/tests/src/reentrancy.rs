//! Downstreams that feed their own upstream from inside `on_next`.

use std::sync::Arc;
use std::thread;

use flow_core::source::{create, from_vec, just};
use flow_core::testing::test_consumer;
use flow_core::{Emitter, SharedSource, Source, SourceExt};
use parking_lot::Mutex;

type EmitterSlot<T> = Arc<Mutex<Option<Emitter<T>>>>;

fn subject<T: Send + 'static>() -> (SharedSource<T>, EmitterSlot<T>) {
    let slot: EmitterSlot<T> = Arc::default();
    let store = slot.clone();
    let source = create(move |emitter| {
        *store.lock() = Some(emitter);
        Ok(())
    });
    (source, slot)
}

fn emitter_of<T: Send + 'static>(slot: &EmitterSlot<T>) -> Emitter<T> {
    slot.lock().clone().expect("subject was subscribed")
}

/// Answers 1 with an absent item, the absent item with 3, then counts to `last`.
fn feedback(slot: EmitterSlot<i32>, last: i32) -> impl FnMut(&Option<i32>) + Send + 'static {
    move |item| {
        let Some(emitter) = slot.lock().clone() else {
            return;
        };
        match *item {
            Some(1) => emitter.next(None),
            None => emitter.next(Some(3)),
            Some(v) if v < last => emitter.next(Some(v + 1)),
            Some(_) => emitter.complete(),
        }
    }
}

fn expected_feedback(last: i32) -> Vec<Option<i32>> {
    let mut expected = vec![Some(1), None];
    expected.extend((3..=last).map(Some));
    expected
}

fn run_feedback<F>(mapper: F) -> Vec<Option<i32>>
where
    F: Fn(Option<i32>) -> flow_core::FlowResult<SharedSource<i32>> + Send + Sync + 'static,
{
    let (upstream, slot) = subject::<i32>();
    let (consumer, probe) = test_consumer::<i32>();
    let consumer = consumer.with_on_next(feedback(slot.clone(), 10));
    upstream.concat_map(mapper).subscribe(Box::new(consumer));
    emitter_of(&slot).next(Some(1));
    probe.assert_result(&expected_feedback(10));
    probe.values()
}

#[test]
fn concat_feedback_with_scalar_inners() {
    let values = run_feedback(|v| Ok(just(v)));
    assert_eq!(values.len(), 10);
}

#[test]
fn concat_feedback_with_hidden_inners() {
    run_feedback(|v| Ok(just(v).hide()));
}

#[test]
fn concat_feedback_with_fusable_inners() {
    run_feedback(|v| Ok(from_vec(vec![v])));
}

/// Ten thousand reentrant pushes finish on a small stack, in order.
#[test]
fn reentrant_pushes_do_not_grow_the_stack() {
    const N: i32 = 10_000;
    let worker = thread::Builder::new()
        .name("small-stack".into())
        .stack_size(512 * 1024)
        .spawn(|| {
            let (upstream, slot) = subject::<i32>();
            let (consumer, probe) = test_consumer::<i32>();
            let pusher = slot.clone();
            let consumer = consumer.with_on_next(move |item| {
                let Some(emitter) = pusher.lock().clone() else {
                    return;
                };
                match *item {
                    Some(v) if v < N => emitter.next(Some(v + 1)),
                    _ => emitter.complete(),
                }
            });
            upstream
                .concat_map(|v| Ok(just(v).hide()))
                .subscribe(Box::new(consumer));
            emitter_of(&slot).next(Some(1));
            probe
        })
        .expect("spawn small-stack worker");
    let probe = worker.join().expect("worker panicked");
    let expected: Vec<Option<i32>> = (1..=N).map(Some).collect();
    probe.assert_result(&expected);
}

#[test]
#[ignore]
fn slow_reentrant_pushes_million() {
    const N: i32 = 1_000_000;
    let (upstream, slot) = subject::<i32>();
    let (consumer, probe) = test_consumer::<i32>();
    let pusher = slot.clone();
    let consumer = consumer.with_on_next(move |item| {
        let Some(emitter) = pusher.lock().clone() else {
            return;
        };
        match *item {
            Some(v) if v < N => emitter.next(Some(v + 1)),
            _ => emitter.complete(),
        }
    });
    upstream
        .concat_map(|v| Ok(from_vec(vec![v])))
        .subscribe(Box::new(consumer));
    emitter_of(&slot).next(Some(1));
    assert_eq!(probe.values().len(), N as usize);
    assert_eq!(probe.completions(), 1);
}
