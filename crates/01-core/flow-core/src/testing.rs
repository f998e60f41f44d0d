//! Recording consumers and sinks for tests.
//!
//! [`test_consumer`] returns a consumer to subscribe with and a [`TestProbe`]
//! that observes what it received. The probe can be cloned into callbacks
//! and cancels the recorded subscription on request.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fusion::{FusionMask, FusionMode};
use crate::handle::BooleanHandle;
use crate::hooks::UndeliverableSink;
use crate::null;
use crate::protocol::{BoxConsumer, Cancellable, Consumer, Notification, Subscription};
use crate::source::{SharedSource, Source};
use crate::FlowError;

type OnNext<T> = Box<dyn FnMut(&Option<T>) + Send>;

struct Recorded<T> {
    events: Mutex<Vec<Notification<T>>>,
    subscription: Mutex<Option<Subscription<T>>>,
    subscriptions: AtomicUsize,
    fusion: Mutex<FusionMode>,
}

/// Consumer that records every signal into its [`TestProbe`].
pub struct TestConsumer<T> {
    recorded: Arc<Recorded<T>>,
    fusion: FusionMask,
    cancel_on_subscribe: bool,
    on_next: Option<OnNext<T>>,
}

/// Read side of a [`TestConsumer`].
pub struct TestProbe<T> {
    recorded: Arc<Recorded<T>>,
}

pub fn test_consumer<T>() -> (TestConsumer<T>, TestProbe<T>) {
    let recorded = Arc::new(Recorded {
        events: Mutex::new(Vec::new()),
        subscription: Mutex::new(None),
        subscriptions: AtomicUsize::new(0),
        fusion: Mutex::new(FusionMode::None),
    });
    let consumer = TestConsumer {
        recorded: Arc::clone(&recorded),
        fusion: FusionMask::NONE,
        cancel_on_subscribe: false,
        on_next: None,
    };
    (consumer, TestProbe { recorded })
}

impl<T> TestConsumer<T> {
    /// Requests `mask` from fusable subscriptions.
    pub fn with_fusion(mut self, mask: FusionMask) -> Self {
        self.fusion = mask;
        self
    }

    /// Runs `hook` after each item is recorded.
    pub fn with_on_next<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Option<T>) + Send + 'static,
    {
        self.on_next = Some(Box::new(hook));
        self
    }

    pub fn cancel_on_subscribe(mut self) -> Self {
        self.cancel_on_subscribe = true;
        self
    }
}

impl<T: Clone + Send + 'static> TestConsumer<T> {
    fn record(&self, event: Notification<T>) {
        self.recorded.events.lock().push(event);
    }

    fn record_next(&mut self, item: Option<T>) {
        self.record(Notification::Next(item.clone()));
        if let Some(hook) = self.on_next.as_mut() {
            hook(&item);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.recorded
            .subscription
            .lock()
            .as_ref()
            .is_some_and(Subscription::is_cancelled)
    }

    /// Polls the fused queue until it is empty. Returns `false` on failure.
    fn drain_queue(&mut self) -> Option<bool> {
        let queue = self.recorded.subscription.lock().as_ref()?.queue()?.clone();
        loop {
            if self.is_cancelled() {
                queue.clear();
                return Some(true);
            }
            match queue.poll() {
                Ok(Some(item)) => self.record_next(null::unwrap(item)),
                Ok(None) => return Some(true),
                Err(error) => {
                    queue.cancel();
                    self.record(Notification::Error(error));
                    return Some(false);
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Consumer<T> for TestConsumer<T> {
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        self.recorded.subscriptions.fetch_add(1, Ordering::AcqRel);
        let mode = match subscription.queue() {
            Some(queue) if !self.fusion.is_empty() => queue.request_fusion(self.fusion),
            _ => FusionMode::None,
        };
        *self.recorded.fusion.lock() = mode;
        *self.recorded.subscription.lock() = Some(subscription.clone());

        if self.cancel_on_subscribe {
            subscription.cancel();
            return;
        }
        // A SYNC queue holds everything the producer will ever emit.
        if mode == FusionMode::Sync && self.drain_queue() == Some(true) && !self.is_cancelled() {
            self.record(Notification::Complete);
        }
    }

    fn on_next(&mut self, item: Option<T>) {
        self.record_next(item);
    }

    fn on_error(&mut self, error: FlowError) {
        self.record(Notification::Error(error));
    }

    fn on_complete(&mut self) {
        self.record(Notification::Complete);
    }

    fn on_available(&mut self) {
        self.drain_queue();
    }
}

impl<T> Clone for TestProbe<T> {
    fn clone(&self) -> Self {
        Self {
            recorded: Arc::clone(&self.recorded),
        }
    }
}

impl<T> TestProbe<T> {
    pub fn completions(&self) -> usize {
        self.recorded
            .events
            .lock()
            .iter()
            .filter(|event| event.is_complete())
            .count()
    }

    pub fn errors(&self) -> Vec<FlowError> {
        self.recorded
            .events
            .lock()
            .iter()
            .filter_map(|event| event.error().cloned())
            .collect()
    }

    /// Number of `on_subscribe` calls seen.
    pub fn subscriptions(&self) -> usize {
        self.recorded.subscriptions.load(Ordering::Acquire)
    }

    /// Mode granted by the last fusion request, `None` when none was made.
    pub fn fusion_mode(&self) -> FusionMode {
        *self.recorded.fusion.lock()
    }

    /// Cancels the recorded subscription. Safe to call from inside a callback.
    pub fn cancel(&self) {
        let subscription = self.recorded.subscription.lock().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.recorded
            .subscription
            .lock()
            .as_ref()
            .is_some_and(Subscription::is_cancelled)
    }

    #[track_caller]
    pub fn assert_not_terminated(&self) {
        let terminals = self
            .recorded
            .events
            .lock()
            .iter()
            .filter(|event| event.is_terminal())
            .count();
        assert_eq!(terminals, 0, "unexpected terminal signal");
    }

    /// Exactly one error carrying `message`, and no completion.
    #[track_caller]
    pub fn assert_error(&self, message: &str) {
        let errors = self.errors();
        assert_eq!(errors.len(), 1, "expected one error, got {errors:?}");
        assert_eq!(errors[0].to_string(), message);
        assert_eq!(self.completions(), 0, "completed after an error");
    }
}

impl<T: Clone> TestProbe<T> {
    pub fn events(&self) -> Vec<Notification<T>> {
        self.recorded.events.lock().clone()
    }

    pub fn values(&self) -> Vec<Option<T>> {
        self.recorded
            .events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Notification::Next(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T: Clone + PartialEq + fmt::Debug> TestProbe<T> {
    /// Subscribed once, received `expected`, then completed once without error.
    #[track_caller]
    pub fn assert_result(&self, expected: &[Option<T>]) {
        assert_eq!(self.subscriptions(), 1, "expected exactly one on_subscribe");
        assert_eq!(self.values(), expected);
        assert!(self.errors().is_empty(), "unexpected errors: {:?}", self.errors());
        assert_eq!(self.completions(), 1, "expected exactly one completion");
        let events = self.recorded.events.lock();
        assert!(
            events.last().is_some_and(Notification::is_complete),
            "completion was not the last signal"
        );
    }

    /// Received `expected`, then failed with `message`.
    #[track_caller]
    pub fn assert_failure(&self, expected: &[Option<T>], message: &str) {
        assert_eq!(self.values(), expected);
        self.assert_error(message);
    }

    /// Subscribed and completed with no items.
    #[track_caller]
    pub fn assert_empty(&self) {
        self.assert_result(&[]);
    }
}

/// Sink that keeps every undeliverable error for inspection.
#[derive(Default)]
pub struct CollectingSink {
    errors: Mutex<Vec<FlowError>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<FlowError> {
        std::mem::take(&mut *self.errors.lock())
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl UndeliverableSink for CollectingSink {
    fn report_undeliverable(&self, error: FlowError) {
        self.errors.lock().push(error);
    }
}

type Slot<T> = Arc<Mutex<Option<BoxConsumer<T>>>>;

struct ManualSource<T> {
    slot: Slot<T>,
    handle: Arc<BooleanHandle>,
}

impl<T: Send + 'static> Source<T> for ManualSource<T> {
    fn subscribe(&self, mut consumer: BoxConsumer<T>) {
        let handle: Arc<BooleanHandle> = Arc::clone(&self.handle);
        consumer.on_subscribe(Subscription::plain(handle));
        *self.slot.lock() = Some(consumer);
    }
}

/// Drives the consumer of a [`manual`] source by hand.
///
/// Calls go straight to the consumer and ignore cancellation, like a
/// producer racing a cancel. Not reentrant: the consumer must not call back
/// into the same producer.
pub struct ManualProducer<T> {
    slot: Slot<T>,
    handle: Arc<BooleanHandle>,
}

/// Source whose single subscriber is driven through the returned producer.
pub fn manual<T: Send + 'static>() -> (SharedSource<T>, ManualProducer<T>) {
    let slot: Slot<T> = Arc::new(Mutex::new(None));
    let handle = Arc::new(BooleanHandle::new());
    let source = Arc::new(ManualSource {
        slot: Arc::clone(&slot),
        handle: Arc::clone(&handle),
    });
    (source, ManualProducer { slot, handle })
}

impl<T> ManualProducer<T> {
    fn with_consumer(&self, f: impl FnOnce(&mut BoxConsumer<T>)) {
        let mut slot = self.slot.lock();
        if let Some(consumer) = slot.as_mut() {
            f(consumer);
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn next(&self, item: Option<T>) {
        self.with_consumer(|consumer| consumer.on_next(item));
    }

    pub fn error(&self, error: FlowError) {
        self.with_consumer(|consumer| consumer.on_error(error));
    }

    pub fn complete(&self) {
        self.with_consumer(|consumer| consumer.on_complete());
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<T> Clone for ManualProducer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            handle: Arc::clone(&self.handle),
        }
    }
}
