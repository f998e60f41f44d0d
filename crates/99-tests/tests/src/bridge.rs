//! Blocking bridge across threads, inside delivery, and under interruption.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flow_core::source::{create, empty, fail, from_vec, just};
use flow_core::testing::test_consumer;
use flow_core::{BlockingFirst, Emitter, FlowError, FlowResult, SharedSource, Source, SourceExt};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("sensor {0} offline")]
struct SensorOffline(u8);

type EmitterSlot<T> = Arc<Mutex<Option<Emitter<T>>>>;

/// Source that emits `items` from a freshly spawned thread after a short delay.
fn delayed(items: Vec<Option<u32>>, slot: EmitterSlot<u32>) -> SharedSource<u32> {
    create(move |emitter: Emitter<u32>| {
        *slot.lock() = Some(emitter.clone());
        let items = items.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for item in items {
                emitter.next(item);
            }
            emitter.complete();
        });
        Ok(())
    })
}

/// Source that subscribes and then never signals.
fn never(slot: EmitterSlot<u32>) -> SharedSource<u32> {
    create(move |emitter: Emitter<u32>| {
        *slot.lock() = Some(emitter);
        Ok(())
    })
}

#[test]
fn first_item_from_another_thread() {
    let slot: EmitterSlot<u32> = Arc::default();
    let source = delayed(vec![Some(7), Some(8), Some(9)], slot.clone());
    assert_eq!(source.blocking_first().unwrap(), Some(7));
    let emitter = slot.lock().clone().expect("subscribed");
    assert!(emitter.is_cancelled());
}

#[test]
fn last_item_from_another_thread() {
    let source = delayed((1..=5).map(Some).collect(), Arc::default());
    assert_eq!(source.blocking_last().unwrap(), Some(5));

    let source = delayed(vec![Some(1), None], Arc::default());
    assert_eq!(source.blocking_last().unwrap(), None);
}

#[test]
fn empty_and_absent_outcomes() {
    let err = empty::<u32>().blocking_first().unwrap_err();
    assert!(matches!(err, FlowError::NoSuchElement));
    assert!(err.is_usage());

    assert_eq!(just::<u32>(None).blocking_first().unwrap(), None);
    assert_eq!(from_vec(vec![None, Some(2)]).blocking_first().unwrap(), None);
}

#[test]
fn source_error_is_rethrown() {
    let err = fail::<u32>(FlowError::failed(SensorOffline(3)))
        .blocking_last()
        .unwrap_err();
    assert!(err.is::<SensorOffline>());
    assert_eq!(err.downcast_ref::<SensorOffline>().map(|e| e.0), Some(3));
    assert_eq!(err.to_string(), "sensor 3 offline");
    assert!(!err.is_usage());
}

#[test]
fn bridge_value_lifecycle() {
    let bridge = BlockingFirst::<u32>::new();
    assert!(matches!(bridge.get_value(), Err(FlowError::NoSuchElement)));
    assert_eq!(bridge.count(), 1);

    bridge.subscribe_to(&*delayed(vec![Some(4)], Arc::default()));
    assert!(bridge.blocking_get().unwrap());
    assert_eq!(bridge.count(), 0);
    assert_eq!(bridge.get_value().unwrap(), Some(4));
    assert_eq!(bridge.get_value().unwrap(), Some(4));
}

/// Waiting inside `on_next` fails fast instead of deadlocking the delivering thread.
#[test]
fn blocking_inside_delivery_is_refused() {
    let outcome: Arc<Mutex<Option<FlowResult<Option<u32>>>>> = Arc::default();
    let record = outcome.clone();
    let (consumer, probe) = test_consumer::<u32>();
    let consumer = consumer.with_on_next(move |_| {
        let stalled = never(Arc::default());
        *record.lock() = Some(stalled.blocking_first());
    });
    from_vec(vec![Some(1)]).subscribe(Box::new(consumer));

    probe.assert_result(&[Some(1)]);
    let outcome = outcome.lock().take().expect("hook ran");
    let err = outcome.unwrap_err();
    assert!(matches!(err, FlowError::BlockingForbidden { .. }));
    assert!(err.is_usage());
}

/// A settled bridge is readable from inside delivery; only waiting is refused.
#[test]
fn settled_bridge_inside_delivery() {
    let outcome: Arc<Mutex<Option<FlowResult<Option<u32>>>>> = Arc::default();
    let record = outcome.clone();
    let (consumer, _probe) = test_consumer::<u32>();
    let consumer = consumer.with_on_next(move |item| {
        *record.lock() = Some(just(item.map(|v| v + 1)).blocking_first());
    });
    just(Some(1)).subscribe(Box::new(consumer));
    let outcome = outcome.lock().take().expect("hook ran");
    assert_eq!(outcome.unwrap(), Some(2));
}

#[test]
fn interrupt_cancels_upstream() {
    let slot: EmitterSlot<u32> = Arc::default();
    let bridge = BlockingFirst::<u32>::new();
    bridge.subscribe_to(&*never(slot.clone()));

    let interrupter = bridge.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        assert!(interrupter.interrupt());
    });
    let err = bridge.blocking_get().unwrap_err();
    worker.join().expect("interrupter panicked");

    assert!(matches!(err, FlowError::Interrupted));
    assert!(bridge.is_cancelled());
    let emitter = slot.lock().clone().expect("subscribed");
    assert!(emitter.is_cancelled());
    assert!(bridge.blocking_get().is_err());
}

#[test]
#[ignore]
fn slow_many_cross_thread_waits() {
    for round in 0..2_000u32 {
        let source = create(move |emitter: Emitter<u32>| {
            thread::spawn(move || {
                emitter.next(Some(round));
                emitter.complete();
            });
            Ok(())
        });
        assert_eq!(source.blocking_first().unwrap(), Some(round));
    }
}
