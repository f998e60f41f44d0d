//! Consumer protocol, subscription handles and notifications.
//!
//! A producer drives a [`Consumer`] through
//! `on_subscribe (on_next)* (on_error | on_complete)?`. `on_subscribe` comes
//! first and at most once; at most one terminal signal follows; nothing is
//! delivered after a terminal signal or after the producer has observed
//! cancellation. Cancellation is best-effort: an item whose delivery started
//! before `cancel` returned may still arrive, but the sequence never breaks
//! the grammar above.

use std::fmt;
use std::sync::Arc;

use crate::fusion::FusedQueue;
use crate::FlowError;

/// Cancellation side of a subscription, shared by producer and consumer.
pub trait Cancellable: Send + Sync {
    /// Requests cancellation. Idempotent; only the first call has an effect.
    fn cancel(&self);

    /// Eventually reflects the most recent `cancel`.
    fn is_cancelled(&self) -> bool;
}

/// Shared cancellation handle.
pub type Handle = Arc<dyn Cancellable>;

/// Fused queue view of a subscription.
pub type QueueRef<T> = Arc<dyn FusedQueue<T>>;

/// Receiving side of the protocol.
pub trait Consumer<T>: Send {
    fn on_subscribe(&mut self, subscription: Subscription<T>);

    /// Delivers one item; `None` is an absent item, not end-of-stream.
    fn on_next(&mut self, item: Option<T>);

    fn on_error(&mut self, error: FlowError);

    fn on_complete(&mut self);

    /// ASYNC fusion wake-up: items are ready to be polled from the fused queue.
    fn on_available(&mut self) {}
}

/// Owned, type-erased consumer as accepted by [`Source::subscribe`](crate::Source::subscribe).
pub type BoxConsumer<T> = Box<dyn Consumer<T>>;

impl<T, C: Consumer<T> + ?Sized> Consumer<T> for Box<C> {
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, item: Option<T>) {
        (**self).on_next(item)
    }

    fn on_error(&mut self, error: FlowError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }

    fn on_available(&mut self) {
        (**self).on_available()
    }
}

/// What a consumer receives in `on_subscribe`.
///
/// Always carries a cancellation [`Handle`]. Producers that can hand over a
/// pollable queue also expose it through [`Subscription::queue`]; that is the
/// only way a consumer learns that fusion is on offer.
pub struct Subscription<T> {
    handle: Handle,
    queue: Option<QueueRef<T>>,
}

impl<T> Subscription<T> {
    pub fn plain(handle: Handle) -> Self {
        Self {
            handle,
            queue: None,
        }
    }

    /// Subscription backed by a queue that supports fusion negotiation.
    pub fn fused<Q>(queue: Arc<Q>) -> Self
    where
        Q: FusedQueue<T> + 'static,
    {
        let handle: Handle = queue.clone();
        Self {
            handle,
            queue: Some(queue),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn into_handle(self) -> Handle {
        self.handle
    }

    pub fn queue(&self) -> Option<&QueueRef<T>> {
        self.queue.as_ref()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            queue: self.queue.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .field("fusable", &self.queue.is_some())
            .finish()
    }
}

/// A protocol signal captured as a value.
#[derive(Clone, Debug)]
pub enum Notification<T> {
    Next(Option<T>),
    Error(FlowError),
    Complete,
}

impl<T> Notification<T> {
    pub fn is_next(&self) -> bool {
        matches!(self, Notification::Next(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Notification::Error(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Notification::Complete)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_next()
    }

    /// The item of a `Next` notification; `None` for absent items and terminals.
    pub fn value(&self) -> Option<&T> {
        match self {
            Notification::Next(item) => item.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FlowError> {
        match self {
            Notification::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Replays this signal into `consumer`. Returns `true` for terminal signals.
    pub fn accept<C: Consumer<T> + ?Sized>(self, consumer: &mut C) -> bool {
        match self {
            Notification::Next(item) => {
                consumer.on_next(item);
                false
            }
            Notification::Error(error) => {
                consumer.on_error(error);
                true
            }
            Notification::Complete => {
                consumer.on_complete();
                true
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Notification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Next(Some(value)) => write!(f, "OnNext[{value:?}]"),
            Notification::Next(None) => f.write_str("OnNext[null]"),
            Notification::Error(error) => write!(f, "OnError[{error}]"),
            Notification::Complete => f.write_str("OnComplete"),
        }
    }
}
