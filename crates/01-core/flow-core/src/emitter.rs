//! Serialized producer side of a subscription.
//!
//! An [`Emitter`] may be cloned and used from any number of threads, and
//! from inside the consumer's own callbacks. Signals are queued and delivered
//! by whichever caller owns the [`Drain`], so the consumer always sees a
//! well-formed, non-overlapping sequence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::blocking::DeliveryScope;
use crate::drain::Drain;
use crate::hooks::{self, Diagnostics};
use crate::protocol::{BoxConsumer, Cancellable, Notification, Subscription};
use crate::FlowError;

const ACTIVE: u32 = 0;
const DONE: u32 = 1;
const CANCELLED: u32 = 2;

/// Producer handle bound to one consumer.
pub struct Emitter<T> {
    inner: Arc<EmitterState<T>>,
}

struct EmitterState<T> {
    state: AtomicU32,
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
    terminal: Mutex<Option<Notification<T>>>,
    // Locked only by the drain owner.
    delivery: Mutex<Delivery<T>>,
    drain: Drain,
    sink: Option<Diagnostics>,
}

struct Delivery<T> {
    consumer: Option<BoxConsumer<T>>,
    subscription: Option<Subscription<T>>,
}

impl<T: Send + 'static> Emitter<T> {
    /// Binds an emitter to `consumer` and delivers its `on_subscribe`.
    pub fn attach(consumer: BoxConsumer<T>) -> Self {
        Self::build(consumer, None)
    }

    /// Like [`attach`](Self::attach), reporting undeliverable errors to `sink`.
    pub fn attach_with_sink(consumer: BoxConsumer<T>, sink: Diagnostics) -> Self {
        Self::build(consumer, Some(sink))
    }

    fn build(consumer: BoxConsumer<T>, sink: Option<Diagnostics>) -> Self {
        let (tx, rx) = unbounded();
        let inner = Arc::new(EmitterState {
            state: AtomicU32::new(ACTIVE),
            tx,
            rx,
            terminal: Mutex::new(None),
            delivery: Mutex::new(Delivery {
                consumer: Some(consumer),
                subscription: None,
            }),
            drain: Drain::new(),
            sink,
        });
        let handle: Arc<EmitterState<T>> = Arc::clone(&inner);
        inner.delivery.lock().subscription = Some(Subscription::plain(handle));
        inner.schedule();
        Self { inner }
    }

    /// Emits one item. Dropped once the emitter terminated or was cancelled.
    pub fn next(&self, item: Option<T>) {
        if self.inner.state.load(Ordering::Acquire) != ACTIVE {
            trace!("item after terminal or cancel dropped");
            return;
        }
        let _ = self.inner.tx.send(item);
        self.inner.schedule();
    }

    /// Terminates with `error`, or reports it as undeliverable when the
    /// emitter already terminated or was cancelled.
    pub fn error(&self, error: FlowError) {
        if let Err(error) = self.try_error(error) {
            hooks::report_to(self.inner.sink.as_ref(), error);
        }
    }

    /// Terminates with `error`, handing it back if no longer deliverable.
    pub fn try_error(&self, error: FlowError) -> Result<(), FlowError> {
        if !self.inner.finish() {
            return Err(error);
        }
        *self.inner.terminal.lock() = Some(Notification::Error(error));
        self.inner.schedule();
        Ok(())
    }

    pub fn complete(&self) {
        if self.inner.finish() {
            *self.inner.terminal.lock() = Some(Notification::Complete);
            self.inner.schedule();
        }
    }

    /// `true` after a cancel and after the terminal signal was delivered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> EmitterState<T> {
    fn finish(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn schedule(&self) {
        self.drain.run(|| self.pass());
    }

    fn pass(&self) {
        let _scope = DeliveryScope::enter();
        let mut guard = self.delivery.lock();
        let delivery = &mut *guard;

        if let Some(subscription) = delivery.subscription.take() {
            if let Some(consumer) = delivery.consumer.as_mut() {
                consumer.on_subscribe(subscription);
            }
        }

        loop {
            if self.state.load(Ordering::Acquire) == CANCELLED {
                let dropped = delivery.consumer.take();
                drop(guard);
                drop(dropped);
                self.discard();
                return;
            }
            let Some(consumer) = delivery.consumer.as_mut() else {
                return;
            };
            if let Ok(item) = self.rx.try_recv() {
                consumer.on_next(item);
                continue;
            }
            let terminal = self.terminal.lock().take();
            let Some(terminal) = terminal else {
                return;
            };
            if !self.rx.is_empty() {
                // Items queued before the terminal signal go first.
                *self.terminal.lock() = Some(terminal);
                continue;
            }
            // Delivered terminals leave the emitter disposed.
            self.state.store(CANCELLED, Ordering::Release);
            if let Some(mut consumer) = delivery.consumer.take() {
                terminal.accept(&mut consumer);
            }
            return;
        }
    }

    fn discard(&self) {
        while self.rx.try_recv().is_ok() {}
        let pending = self.terminal.lock().take();
        if let Some(Notification::Error(error)) = pending {
            debug!("error raced a cancellation; reporting as undeliverable");
            hooks::report_to(self.sink.as_ref(), error);
        }
    }
}

impl<T: Send + 'static> Cancellable for EmitterState<T> {
    fn cancel(&self) {
        if self.state.swap(CANCELLED, Ordering::AcqRel) != CANCELLED {
            self.schedule();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}
