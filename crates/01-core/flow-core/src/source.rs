//! Producers and the scalar capability.
//!
//! A [`Source`] accepts consumers through `subscribe`. Producers that know
//! their single item (or its absence) ahead of subscription also return a
//! [`ScalarSource`] from [`Source::as_scalar`]; stages query that capability
//! instead of inspecting concrete types.
//!
//! The producers in this module are the minimal set the stages and the
//! blocking bridge are exercised against:
//!
//! - [`just`], [`empty`]: scalar
//! - [`fail`]: terminates with an error
//! - [`from_callable`]: scalar, computed per subscription
//! - [`from_vec`]: finite sequence, SYNC-fusable
//! - [`create`]: items pushed through a serialized [`Emitter`]
//! - [`hide`]: masks the scalar capability and fusion of another source

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::blocking::{self, DeliveryScope};
use crate::concat::{ConcatMap, ErrorMode};
use crate::emitter::Emitter;
use crate::fusion::{FusedQueue, FusionMask, FusionMode};
use crate::handle::{complete_immediately, error_immediately};
use crate::null::{self, Wrapped};
use crate::protocol::{BoxConsumer, Cancellable, Consumer, Subscription};
use crate::scalar::{emit_scalar, DeferredScalarHandle};
use crate::{FlowError, FlowResult};

pub trait Source<T>: Send + Sync {
    fn subscribe(&self, consumer: BoxConsumer<T>);

    /// The scalar capability, if this producer has one.
    fn as_scalar(&self) -> Option<&dyn ScalarSource<T>> {
        None
    }
}

/// Producer whose outcome is computable without subscribing.
pub trait ScalarSource<T>: Send + Sync {
    /// `Ok(None)`: no item. `Ok(Some(w))`: exactly one item, possibly absent.
    fn scalar_value(&self) -> FlowResult<Option<Wrapped<T>>>;
}

pub type SharedSource<T> = Arc<dyn Source<T>>;

impl<T, S: Source<T> + ?Sized> Source<T> for Arc<S> {
    fn subscribe(&self, consumer: BoxConsumer<T>) {
        (**self).subscribe(consumer)
    }

    fn as_scalar(&self) -> Option<&dyn ScalarSource<T>> {
        (**self).as_scalar()
    }
}

/// Combinators available on every source.
pub trait SourceExt<T: Send + 'static>: Source<T> + Sized + 'static {
    fn shared(self) -> SharedSource<T> {
        Arc::new(self)
    }

    fn hide(self) -> SharedSource<T> {
        hide(self.shared())
    }

    /// Maps every item to an inner source and concatenates the results.
    fn concat_map<U, F>(self, mapper: F) -> SharedSource<U>
    where
        U: Send + 'static,
        F: Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync + 'static,
    {
        Arc::new(ConcatMap::new(self.shared(), mapper))
    }

    /// [`concat_map`](Self::concat_map) with errors held back per `mode`.
    fn concat_map_with<U, F>(self, mode: ErrorMode, mapper: F) -> SharedSource<U>
    where
        U: Send + 'static,
        F: Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync + 'static,
    {
        Arc::new(ConcatMap::new(self.shared(), mapper).with_error_mode(mode))
    }

    fn blocking_first(&self) -> FlowResult<Option<T>> {
        blocking::blocking_first(self)
    }

    fn blocking_last(&self) -> FlowResult<Option<T>> {
        blocking::blocking_last(self)
    }
}

impl<T: Send + 'static, S: Source<T> + 'static> SourceExt<T> for S {}

struct Just<T> {
    item: Option<T>,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for Just<T> {
    fn subscribe(&self, consumer: BoxConsumer<T>) {
        emit_scalar(Some(null::wrap(self.item.clone())), consumer);
    }

    fn as_scalar(&self) -> Option<&dyn ScalarSource<T>> {
        Some(self)
    }
}

impl<T: Clone + Send + Sync + 'static> ScalarSource<T> for Just<T> {
    fn scalar_value(&self) -> FlowResult<Option<Wrapped<T>>> {
        Ok(Some(null::wrap(self.item.clone())))
    }
}

/// One item, then completion. `None` is emitted as an absent item.
pub fn just<T: Clone + Send + Sync + 'static>(item: Option<T>) -> SharedSource<T> {
    Arc::new(Just { item })
}

struct Empty;

impl<T> Source<T> for Empty {
    fn subscribe(&self, mut consumer: BoxConsumer<T>) {
        complete_immediately(&mut consumer);
    }

    fn as_scalar(&self) -> Option<&dyn ScalarSource<T>> {
        Some(self)
    }
}

impl<T> ScalarSource<T> for Empty {
    fn scalar_value(&self) -> FlowResult<Option<Wrapped<T>>> {
        Ok(None)
    }
}

pub fn empty<T: 'static>() -> SharedSource<T> {
    Arc::new(Empty)
}

struct Fail {
    error: FlowError,
}

impl<T> Source<T> for Fail {
    fn subscribe(&self, mut consumer: BoxConsumer<T>) {
        error_immediately(&mut consumer, self.error.clone());
    }
}

/// Terminates every subscriber with `error`.
pub fn fail<T: 'static>(error: FlowError) -> SharedSource<T> {
    Arc::new(Fail { error })
}

struct FromCallable<F> {
    callable: F,
}

impl<T, F> Source<T> for FromCallable<F>
where
    T: Send + 'static,
    F: Fn() -> FlowResult<Option<T>> + Send + Sync,
{
    fn subscribe(&self, consumer: BoxConsumer<T>) {
        let handle = DeferredScalarHandle::new(consumer);
        handle.start();
        if handle.is_cancelled() {
            return;
        }
        match (self.callable)() {
            Ok(item) => handle.complete(item),
            Err(err) => handle.error(err),
        }
    }

    fn as_scalar(&self) -> Option<&dyn ScalarSource<T>> {
        Some(self)
    }
}

impl<T, F> ScalarSource<T> for FromCallable<F>
where
    T: Send + 'static,
    F: Fn() -> FlowResult<Option<T>> + Send + Sync,
{
    fn scalar_value(&self) -> FlowResult<Option<Wrapped<T>>> {
        (self.callable)().map(|item| Some(null::wrap(item)))
    }
}

/// One item computed by `callable` for each subscriber.
pub fn from_callable<T, F>(callable: F) -> SharedSource<T>
where
    T: Send + 'static,
    F: Fn() -> FlowResult<Option<T>> + Send + Sync + 'static,
{
    Arc::new(FromCallable { callable })
}

struct FromVec<T> {
    items: Vec<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for FromVec<T> {
    fn subscribe(&self, mut consumer: BoxConsumer<T>) {
        let queue = Arc::new(VecQueue::new(self.items.clone()));
        consumer.on_subscribe(Subscription::fused(queue.clone()));
        if queue.fused.load(Ordering::Acquire) {
            return;
        }
        queue.emit(&mut *consumer);
    }
}

/// Subscription of [`from_vec`]; doubles as its SYNC-fused queue.
struct VecQueue<T> {
    items: Mutex<std::vec::IntoIter<Option<T>>>,
    fused: AtomicBool,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> VecQueue<T> {
    fn new(items: Vec<Option<T>>) -> Self {
        Self {
            items: Mutex::new(items.into_iter()),
            fused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn emit(&self, consumer: &mut dyn Consumer<T>) {
        let _scope = DeliveryScope::enter();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                debug!("sequence cancelled mid-emission");
                return;
            }
            let next = self.items.lock().next();
            match next {
                Some(item) => consumer.on_next(item),
                None => break,
            }
        }
        if !self.cancelled.load(Ordering::Acquire) {
            consumer.on_complete();
        }
    }
}

impl<T: Send + 'static> Cancellable for VecQueue<T> {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> FusedQueue<T> for VecQueue<T> {
    fn request_fusion(&self, requested: FusionMask) -> FusionMode {
        let mode = requested.grant(FusionMask::SYNC | FusionMask::BOUNDARY);
        if mode == FusionMode::Sync {
            self.fused.store(true, Ordering::Release);
        }
        mode
    }

    fn poll(&self) -> FlowResult<Option<Wrapped<T>>> {
        Ok(self.items.lock().next().map(null::wrap))
    }

    fn is_empty(&self) -> bool {
        self.items.lock().len() == 0
    }

    fn clear(&self) {
        let mut items = self.items.lock();
        *items = Vec::new().into_iter();
    }
}

/// Emits `items` in order, then completes.
pub fn from_vec<T: Clone + Send + Sync + 'static>(items: Vec<Option<T>>) -> SharedSource<T> {
    Arc::new(FromVec { items })
}

struct Create<F> {
    producer: F,
}

impl<T, F> Source<T> for Create<F>
where
    T: Send + 'static,
    F: Fn(Emitter<T>) -> FlowResult<()> + Send + Sync,
{
    fn subscribe(&self, consumer: BoxConsumer<T>) {
        let emitter = Emitter::attach(consumer);
        if let Err(err) = (self.producer)(emitter.clone()) {
            emitter.error(err);
        }
    }
}

/// Runs `producer` for every subscriber with an [`Emitter`] bound to it.
///
/// The emitter may be moved to other threads; a returned error is signalled
/// like [`Emitter::error`].
pub fn create<T, F>(producer: F) -> SharedSource<T>
where
    T: Send + 'static,
    F: Fn(Emitter<T>) -> FlowResult<()> + Send + Sync + 'static,
{
    Arc::new(Create { producer })
}

struct Hide<T> {
    source: SharedSource<T>,
}

impl<T: Send + 'static> Source<T> for Hide<T> {
    fn subscribe(&self, consumer: BoxConsumer<T>) {
        self.source.subscribe(Box::new(HideConsumer { downstream: consumer }));
    }
}

struct HideConsumer<T> {
    downstream: BoxConsumer<T>,
}

impl<T> Consumer<T> for HideConsumer<T> {
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        self.downstream
            .on_subscribe(Subscription::plain(subscription.into_handle()));
    }

    fn on_next(&mut self, item: Option<T>) {
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

/// Same items as `source`, without its scalar capability or fusion.
pub fn hide<T: Send + 'static>(source: SharedSource<T>) -> SharedSource<T> {
    Arc::new(Hide { source })
}
