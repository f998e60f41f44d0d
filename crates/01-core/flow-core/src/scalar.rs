//! Single-value subscriptions and the scalar shortcut.
//!
//! [`ScalarHandle`] is the subscription of a producer whose one item is known
//! at subscription time. [`DeferredScalarHandle`] covers producers whose one
//! item arrives later. [`try_scalar_x_map_subscribe`] skips the intermediate
//! stage entirely when a mapping stage sits on top of a scalar producer.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::blocking::DeliveryScope;
use crate::fusion::{FusedQueue, FusionMask, FusionMode};
use crate::handle::{complete_immediately, error_immediately};
use crate::hooks::{self, Diagnostics};
use crate::null::{self, Wrapped};
use crate::protocol::{BoxConsumer, Cancellable, Consumer, Subscription};
use crate::source::{SharedSource, Source};
use crate::{FlowError, FlowResult};

const FRESH: u32 = 0;
const FUSED: u32 = 1;
const EMITTING: u32 = 2;
const DONE: u32 = 3;
const CANCELLED: u32 = 4;

/// Subscription for a producer with exactly zero or one known item.
///
/// `run` and `cancel` race for the single transition out of `FRESH`; exactly
/// one of them takes effect. Cancelling while `run` is emitting suppresses
/// the completion signal but not the item already being delivered.
pub struct ScalarHandle<T> {
    state: AtomicU32,
    // Taken only by the winner of the transition out of FRESH/FUSED.
    value: Mutex<Option<Wrapped<T>>>,
}

impl<T: Send + 'static> ScalarHandle<T> {
    /// Handle for one item; `None` is delivered as an absent item.
    pub fn new(item: Option<T>) -> Self {
        Self::from_wrapped(Some(null::wrap(item)))
    }

    /// Handle that only completes.
    pub fn empty() -> Self {
        Self::from_wrapped(None)
    }

    /// `None` means "no item", `Some(Wrapped::Null)` means "one absent item".
    pub fn from_wrapped(value: Option<Wrapped<T>>) -> Self {
        Self {
            state: AtomicU32::new(FRESH),
            value: Mutex::new(value),
        }
    }

    /// Delivers the item (if any) and completion. Returns `false` if the
    /// handle was already run, fused or cancelled.
    pub fn run<C: Consumer<T> + ?Sized>(&self, consumer: &mut C) -> bool {
        if self
            .state
            .compare_exchange(FRESH, EMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _scope = DeliveryScope::enter();
        let value = self.value.lock().take();
        if let Some(wrapped) = value {
            consumer.on_next(null::unwrap(wrapped));
        }
        if self
            .state
            .compare_exchange(EMITTING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            consumer.on_complete();
        } else {
            debug!("scalar cancelled during emission; completion suppressed");
        }
        true
    }

    /// `true` only when this call prevented `run` from delivering anything.
    pub fn try_cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                FRESH | FUSED => {
                    match self.state.compare_exchange(
                        current,
                        CANCELLED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let _ = self.value.lock().take();
                            return true;
                        }
                        Err(actual) => current = actual,
                    }
                }
                EMITTING => {
                    match self.state.compare_exchange(
                        EMITTING,
                        CANCELLED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(actual) => current = actual,
                    }
                }
                DONE => {
                    // Nothing left to stop; only record the request.
                    let _ = self.state.compare_exchange(
                        DONE,
                        CANCELLED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return false;
                }
                _ => return false,
            }
        }
    }
}

impl<T: Send + 'static> Cancellable for ScalarHandle<T> {
    fn cancel(&self) {
        self.try_cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl<T: Send + 'static> FusedQueue<T> for ScalarHandle<T> {
    fn request_fusion(&self, requested: FusionMask) -> FusionMode {
        if requested.grant(FusionMask::SYNC | FusionMask::BOUNDARY) != FusionMode::Sync {
            return FusionMode::None;
        }
        match self
            .state
            .compare_exchange(FRESH, FUSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => FusionMode::Sync,
            Err(_) => FusionMode::None,
        }
    }

    fn poll(&self) -> FlowResult<Option<Wrapped<T>>> {
        if self
            .state
            .compare_exchange(FUSED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(self.value.lock().take());
        }
        Ok(None)
    }

    fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) != FUSED
    }

    fn clear(&self) {
        if self
            .state
            .compare_exchange(FUSED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.value.lock().take();
        }
    }
}

/// Subscribes `consumer` to a fresh [`ScalarHandle`] and runs it.
pub(crate) fn emit_scalar<T: Send + 'static>(
    value: Option<Wrapped<T>>,
    mut consumer: BoxConsumer<T>,
) {
    let handle = Arc::new(ScalarHandle::from_wrapped(value));
    consumer.on_subscribe(Subscription::fused(handle.clone()));
    handle.run(&mut *consumer);
}

const IDLE: u32 = 0;
const FUSED_EMPTY: u32 = 1;
const FUSED_READY: u32 = 2;
const FUSED_CONSUMED: u32 = 3;
const TERMINATED: u32 = 4;
const DEFERRED_CANCELLED: u32 = 5;

/// Subscription for a producer whose single item is computed after subscription.
///
/// Owns its downstream. Call [`start`](Self::start) once, then exactly one of
/// [`complete`](Self::complete), [`complete_empty`](Self::complete_empty) or
/// [`error`](Self::error); never from inside the downstream's `on_subscribe`.
pub struct DeferredScalarHandle<T> {
    state: AtomicU32,
    value: Mutex<Option<Wrapped<T>>>,
    downstream: Mutex<Option<BoxConsumer<T>>>,
    sink: Option<Diagnostics>,
}

impl<T: Send + 'static> DeferredScalarHandle<T> {
    pub fn new(downstream: BoxConsumer<T>) -> Arc<Self> {
        Arc::new(Self::build(downstream, None))
    }

    /// Reports late errors to `sink` instead of the global hook.
    pub fn with_sink(downstream: BoxConsumer<T>, sink: Diagnostics) -> Arc<Self> {
        Arc::new(Self::build(downstream, Some(sink)))
    }

    fn build(downstream: BoxConsumer<T>, sink: Option<Diagnostics>) -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            value: Mutex::new(None),
            downstream: Mutex::new(Some(downstream)),
            sink,
        }
    }

    /// Delivers `on_subscribe` to the downstream.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.downstream.lock();
        if let Some(consumer) = guard.as_mut() {
            consumer.on_subscribe(Subscription::fused(self.clone()));
        }
        if self.state.load(Ordering::Acquire) == DEFERRED_CANCELLED {
            // Break the handle <-> consumer cycle the cancel could not break.
            guard.take();
        }
    }

    /// Delivers one item (absent items included) followed by completion.
    pub fn complete(&self, item: Option<T>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                FUSED_EMPTY => {
                    *self.value.lock() = Some(null::wrap(item));
                    match self.state.compare_exchange(
                        FUSED_EMPTY,
                        FUSED_READY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.signal_ready();
                            return;
                        }
                        Err(_) => {
                            let _ = self.value.lock().take();
                            return;
                        }
                    }
                }
                IDLE => match self.state.compare_exchange(
                    IDLE,
                    TERMINATED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.deliver(|consumer, state| {
                            consumer.on_next(item);
                            if state.load(Ordering::Acquire) != DEFERRED_CANCELLED {
                                consumer.on_complete();
                            }
                        });
                        return;
                    }
                    Err(actual) => current = actual,
                },
                _ => return,
            }
        }
    }

    /// Completes without an item.
    pub fn complete_empty(&self) {
        if self.terminate() {
            self.deliver(|consumer, _| consumer.on_complete());
        }
    }

    /// Fails the downstream; reported as undeliverable after termination or cancellation.
    pub fn error(&self, error: FlowError) {
        if self.terminate() {
            self.deliver(|consumer, _| consumer.on_error(error));
        } else {
            hooks::report_to(self.sink.as_ref(), error);
        }
    }

    fn terminate(&self) -> bool {
        [IDLE, FUSED_EMPTY].into_iter().any(|from| {
            self.state
                .compare_exchange(from, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn signal_ready(&self) {
        self.deliver(|consumer, state| {
            consumer.on_available();
            if state.load(Ordering::Acquire) != DEFERRED_CANCELLED {
                consumer.on_complete();
            }
        });
    }

    fn deliver(&self, f: impl FnOnce(&mut BoxConsumer<T>, &AtomicU32)) {
        let taken = self.downstream.lock().take();
        if let Some(mut consumer) = taken {
            let _scope = DeliveryScope::enter();
            f(&mut consumer, &self.state);
        }
    }
}

impl<T: Send + 'static> Cancellable for DeferredScalarHandle<T> {
    fn cancel(&self) {
        if self.state.swap(DEFERRED_CANCELLED, Ordering::AcqRel) == DEFERRED_CANCELLED {
            return;
        }
        let _ = self.value.lock().take();
        // Fails while `start` or a delivery holds the consumer; they drop it.
        let taken = self.downstream.try_lock().and_then(|mut guard| guard.take());
        drop(taken);
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == DEFERRED_CANCELLED
    }
}

impl<T: Send + 'static> FusedQueue<T> for DeferredScalarHandle<T> {
    fn request_fusion(&self, requested: FusionMask) -> FusionMode {
        if requested.grant(FusionMask::ASYNC | FusionMask::BOUNDARY) != FusionMode::Async {
            return FusionMode::None;
        }
        match self
            .state
            .compare_exchange(IDLE, FUSED_EMPTY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => FusionMode::Async,
            Err(_) => FusionMode::None,
        }
    }

    fn poll(&self) -> FlowResult<Option<Wrapped<T>>> {
        if self
            .state
            .compare_exchange(FUSED_READY, FUSED_CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(self.value.lock().take());
        }
        Ok(None)
    }

    fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) != FUSED_READY
    }

    fn clear(&self) {
        if self
            .state
            .compare_exchange(FUSED_READY, FUSED_CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.value.lock().take();
        }
    }
}

/// Subscribes to `source` honouring its scalar capability.
pub(crate) fn subscribe_scalar_aware<U: Send + 'static>(
    source: &dyn Source<U>,
    mut consumer: BoxConsumer<U>,
) {
    let Some(scalar) = source.as_scalar() else {
        source.subscribe(consumer);
        return;
    };
    match scalar.scalar_value() {
        Err(err) => error_immediately(&mut consumer, err),
        Ok(None) => complete_immediately(&mut consumer),
        Ok(Some(value)) => emit_scalar(Some(value), consumer),
    }
}

/// Scalar shortcut for a mapping stage.
///
/// When `source` is scalar its value is computed now, `mapper` is applied
/// eagerly and `consumer` is subscribed directly to the mapped source
/// (short-circuiting again if that one is scalar). Returns `None` when the
/// shortcut was taken, or hands `consumer` back when `source` is not scalar.
pub fn try_scalar_x_map_subscribe<T, U, F>(
    source: &dyn Source<T>,
    consumer: BoxConsumer<U>,
    mapper: F,
) -> Option<BoxConsumer<U>>
where
    U: Send + 'static,
    F: FnOnce(Option<T>) -> FlowResult<SharedSource<U>>,
{
    let Some(scalar) = source.as_scalar() else {
        return Some(consumer);
    };
    debug!("scalar source; mapping eagerly");
    let mut consumer = consumer;
    match scalar.scalar_value() {
        Err(err) => error_immediately(&mut consumer, err),
        Ok(None) => complete_immediately(&mut consumer),
        Ok(Some(value)) => match mapper(null::unwrap(value)) {
            Err(err) => error_immediately(&mut consumer, err),
            Ok(mapped) => subscribe_scalar_aware(&*mapped, consumer),
        },
    }
    None
}

/// Source that maps one known value to a source when subscribed.
pub struct ScalarXMap<T, U> {
    value: Option<T>,
    mapper: Arc<dyn Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync>,
}

impl<T, U> Source<U> for ScalarXMap<T, U>
where
    T: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, mut consumer: BoxConsumer<U>) {
        match (self.mapper)(self.value.clone()) {
            Err(err) => error_immediately(&mut consumer, err),
            Ok(mapped) => subscribe_scalar_aware(&*mapped, consumer),
        }
    }
}

pub fn scalar_x_map<T, U, F>(value: Option<T>, mapper: F) -> SharedSource<U>
where
    T: Clone + Send + Sync + 'static,
    U: Send + 'static,
    F: Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync + 'static,
{
    Arc::new(ScalarXMap {
        value,
        mapper: Arc::new(mapper),
    })
}
