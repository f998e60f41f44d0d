//! Concatenating map stage.
//!
//! [`ConcatMap`] maps every upstream item to an inner source and relays the
//! inner sources one after another. Upstream items and inner items are both
//! queued and only the owner of the stage's drain loop talks to the
//! downstream, so a downstream that pushes new upstream items from its own
//! `on_next` turns into extra loop iterations rather than deeper recursion.
//!
//! Scalar upstreams take the [`try_scalar_x_map_subscribe`] shortcut and
//! scalar inner sources are emitted inline without subscribing to them.
//!
//! [`ErrorMode`] decides when upstream and inner errors reach the
//! downstream. Mapper failures and failing fused polls always terminate
//! at once. Only the first error is delivered; later ones are undeliverable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::blocking::DeliveryScope;
use crate::drain::Drain;
use crate::fusion::{FusionMask, FusionMode};
use crate::handle::{DeferredHandle, SequentialHandle};
use crate::hooks::{self, Diagnostics};
use crate::null;
use crate::protocol::{BoxConsumer, Cancellable, Consumer, Notification, QueueRef, Subscription};
use crate::scalar::try_scalar_x_map_subscribe;
use crate::source::{SharedSource, Source};
use crate::{FlowError, FlowResult};

type Mapper<T, U> = Arc<dyn Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync>;

/// When a [`ConcatMap`] delivers upstream and inner errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorMode {
    /// Cancel everything and fail as soon as any error arrives.
    #[default]
    Immediate,
    /// Let the running inner source finish, then fail.
    Boundary,
    /// Keep concatenating and fail once upstream is exhausted.
    End,
}

/// Source produced by [`SourceExt::concat_map`](crate::SourceExt::concat_map).
pub struct ConcatMap<T, U> {
    source: SharedSource<T>,
    mapper: Mapper<T, U>,
    mode: ErrorMode,
    sink: Option<Diagnostics>,
}

impl<T, U> ConcatMap<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new<F>(source: SharedSource<T>, mapper: F) -> Self
    where
        F: Fn(Option<T>) -> FlowResult<SharedSource<U>> + Send + Sync + 'static,
    {
        Self {
            source,
            mapper: Arc::new(mapper),
            mode: ErrorMode::Immediate,
            sink: None,
        }
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.mode = mode;
        self
    }

    /// Routes undeliverable errors to `sink` instead of the global hook.
    pub fn with_sink(mut self, sink: Diagnostics) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl<T, U> Source<U> for ConcatMap<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, consumer: BoxConsumer<U>) {
        let Some(consumer) = try_scalar_x_map_subscribe(&*self.source, consumer, &*self.mapper)
        else {
            return;
        };
        let stage = ConcatStage::new(
            consumer,
            Arc::clone(&self.mapper),
            self.mode,
            self.sink.clone(),
        );
        stage.schedule();
        self.source.subscribe(Box::new(UpstreamConsumer {
            stage: Arc::clone(&stage),
            finished: false,
        }));
    }
}

/// Where an error came from; decides how a delaying stage reacts to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Upstream,
    /// A subscribed inner source.
    Inner,
    /// A scalar inner source evaluated inline by the drain loop.
    Scalar,
}

struct ConcatStage<T, U> {
    this: Weak<ConcatStage<T, U>>,
    // Locked only by the drain owner.
    downstream: Mutex<Option<BoxConsumer<U>>>,
    subscription: Mutex<Option<Subscription<U>>>,
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
    fused: OnceLock<QueueRef<T>>,
    inner_tx: Sender<Option<U>>,
    inner_rx: Receiver<Option<U>>,
    mapper: Mapper<T, U>,
    mode: ErrorMode,
    upstream: DeferredHandle,
    inner: SequentialHandle,
    active: AtomicBool,
    inner_done: AtomicBool,
    done: AtomicBool,
    cancelled: AtomicBool,
    // Set when the latched error must be delivered without waiting.
    aborted: AtomicBool,
    terminated: AtomicBool,
    // First error wins; guarded together with `terminated`.
    error: Mutex<Option<FlowError>>,
    drain: Drain,
    sink: Option<Diagnostics>,
}

impl<T, U> ConcatStage<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn new(
        consumer: BoxConsumer<U>,
        mapper: Mapper<T, U>,
        mode: ErrorMode,
        sink: Option<Diagnostics>,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let (inner_tx, inner_rx) = unbounded();
        let stage = Arc::new_cyclic(|this| ConcatStage {
            this: this.clone(),
            downstream: Mutex::new(Some(consumer)),
            subscription: Mutex::new(None),
            tx,
            rx,
            fused: OnceLock::new(),
            inner_tx,
            inner_rx,
            mapper,
            mode,
            upstream: DeferredHandle::new(),
            inner: SequentialHandle::new(),
            active: AtomicBool::new(false),
            inner_done: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            error: Mutex::new(None),
            drain: Drain::new(),
            sink,
        });
        let handle: Arc<ConcatStage<T, U>> = Arc::clone(&stage);
        *stage.subscription.lock() = Some(Subscription::plain(handle));
        stage
    }

    fn schedule(&self) {
        self.drain.run(|| self.pass());
    }

    fn pass(&self) {
        let _scope = DeliveryScope::enter();
        let pending = self.subscription.lock().take();
        if let Some(subscription) = pending {
            self.with_downstream(|consumer| consumer.on_subscribe(subscription));
        }

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.discard();
                return;
            }
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            if self.aborted.load(Ordering::Acquire) {
                self.upstream.cancel();
                self.inner.cancel();
                self.fail_downstream();
                return;
            }
            if self.active.load(Ordering::Acquire) {
                let inner_done = self.inner_done.load(Ordering::Acquire);
                if let Ok(item) = self.inner_rx.try_recv() {
                    self.emit(item);
                    continue;
                }
                if !inner_done {
                    return;
                }
                self.inner.clear();
                self.inner_done.store(false, Ordering::Release);
                self.active.store(false, Ordering::Release);
                continue;
            }

            // Between two inner sources.
            if self.mode == ErrorMode::Boundary && self.error.lock().is_some() {
                self.upstream.cancel();
                self.fail_downstream();
                return;
            }

            let done = self.done.load(Ordering::Acquire);
            let next = match self.poll_upstream() {
                Ok(next) => next,
                Err(error) => {
                    self.abort(error);
                    continue;
                }
            };
            let Some(item) = next else {
                if done {
                    let terminal = match self.terminate() {
                        Some(error) => Notification::Error(error),
                        None => Notification::Complete,
                    };
                    self.deliver_terminal(terminal);
                }
                return;
            };

            let inner = match (self.mapper)(item) {
                Ok(inner) => inner,
                Err(error) => {
                    self.abort(error);
                    continue;
                }
            };
            if let Some(scalar) = inner.as_scalar() {
                match scalar.scalar_value() {
                    Ok(Some(value)) => self.emit(null::unwrap(value)),
                    Ok(None) => {}
                    Err(error) => self.fail(error, Origin::Scalar),
                }
                continue;
            }

            let Some(this) = self.this.upgrade() else {
                return;
            };
            self.active.store(true, Ordering::Release);
            trace!("subscribing to next inner source");
            inner.subscribe(Box::new(InnerConsumer {
                stage: this,
                finished: false,
            }));
        }
    }

    fn poll_upstream(&self) -> FlowResult<Option<Option<T>>> {
        match self.fused.get() {
            Some(queue) => Ok(queue.poll()?.map(null::unwrap)),
            None => Ok(self.rx.try_recv().ok()),
        }
    }

    fn with_downstream(&self, f: impl FnOnce(&mut BoxConsumer<U>)) {
        let mut downstream = self.downstream.lock();
        if let Some(consumer) = downstream.as_mut() {
            f(consumer);
        }
    }

    fn emit(&self, item: Option<U>) {
        self.with_downstream(|consumer| consumer.on_next(item));
    }

    /// Marks the stage terminated and hands back the latched error, if any.
    fn terminate(&self) -> Option<FlowError> {
        let mut error = self.error.lock();
        self.terminated.store(true, Ordering::Release);
        error.take()
    }

    fn fail_downstream(&self) {
        self.discard_queue();
        if let Some(error) = self.terminate() {
            self.deliver_terminal(Notification::Error(error));
        }
    }

    fn deliver_terminal(&self, terminal: Notification<U>) {
        let taken = self.downstream.lock().take();
        if let Some(mut consumer) = taken {
            terminal.accept(&mut consumer);
        }
    }

    /// Latches `error` if it is the first; returns it back otherwise.
    fn latch(&self, error: FlowError) -> Option<FlowError> {
        let mut slot = self.error.lock();
        if slot.is_some()
            || self.terminated.load(Ordering::Acquire)
            || self.cancelled.load(Ordering::Acquire)
        {
            return Some(error);
        }
        *slot = Some(error);
        None
    }

    fn report(&self, error: FlowError) {
        debug!("concat stage already failed or cancelled; reporting undeliverable error");
        hooks::report_to(self.sink.as_ref(), error);
    }

    /// Fails the stage at once regardless of the error mode.
    fn abort(&self, error: FlowError) {
        if let Some(error) = self.latch(error) {
            self.report(error);
            if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
                return;
            }
        }
        self.aborted.store(true, Ordering::Release);
        self.upstream.cancel();
        self.inner.cancel();
        self.schedule();
    }

    /// Routes an upstream or inner error according to the error mode.
    fn fail(&self, error: FlowError, origin: Origin) {
        if self.mode == ErrorMode::Immediate {
            self.abort(error);
            return;
        }
        if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            self.report(error);
            return;
        }
        if let Some(error) = self.latch(error) {
            self.report(error);
        }
        if origin != Origin::Upstream && self.mode == ErrorMode::Boundary {
            self.upstream.cancel();
        }
        match origin {
            Origin::Upstream => self.done.store(true, Ordering::Release),
            Origin::Inner => self.inner_done.store(true, Ordering::Release),
            Origin::Scalar => {}
        }
        self.schedule();
    }

    fn discard_queue(&self) {
        while self.rx.try_recv().is_ok() {}
        while self.inner_rx.try_recv().is_ok() {}
        if let Some(queue) = self.fused.get() {
            queue.clear();
        }
    }

    fn discard(&self) {
        self.discard_queue();
        let dropped = self.downstream.lock().take();
        drop(dropped);
    }
}

impl<T, U> Cancellable for ConcatStage<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        self.inner.cancel();
        self.schedule();
    }

    /// Also `true` once the terminal signal is on its way downstream.
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }
}

struct UpstreamConsumer<T, U> {
    stage: Arc<ConcatStage<T, U>>,
    finished: bool,
}

impl<T, U> Consumer<T> for UpstreamConsumer<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        if let Some(queue) = subscription.queue() {
            match queue.request_fusion(FusionMask::ANY) {
                FusionMode::Sync => {
                    let _ = self.stage.fused.set(Arc::clone(queue));
                    self.stage.upstream.attach(subscription.into_handle());
                    self.finished = true;
                    self.stage.done.store(true, Ordering::Release);
                    self.stage.schedule();
                    return;
                }
                FusionMode::Async => {
                    let _ = self.stage.fused.set(Arc::clone(queue));
                    self.stage.upstream.attach(subscription.into_handle());
                    return;
                }
                _ => {}
            }
        }
        self.stage.upstream.attach(subscription.into_handle());
    }

    fn on_next(&mut self, item: Option<T>) {
        if self.finished {
            trace!("upstream item after its terminal signal dropped");
            return;
        }
        let _ = self.stage.tx.send(item);
        self.stage.schedule();
    }

    fn on_error(&mut self, error: FlowError) {
        if std::mem::replace(&mut self.finished, true) {
            self.stage.report(error);
            return;
        }
        self.stage.fail(error, Origin::Upstream);
    }

    fn on_complete(&mut self) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        self.stage.done.store(true, Ordering::Release);
        self.stage.schedule();
    }

    fn on_available(&mut self) {
        self.stage.schedule();
    }
}

struct InnerConsumer<T, U> {
    stage: Arc<ConcatStage<T, U>>,
    finished: bool,
}

impl<T, U> Consumer<U> for InnerConsumer<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription<U>) {
        self.stage.inner.replace(subscription.into_handle());
    }

    fn on_next(&mut self, item: Option<U>) {
        if self.finished {
            trace!("inner item after its terminal signal dropped");
            return;
        }
        let _ = self.stage.inner_tx.send(item);
        self.stage.schedule();
    }

    fn on_error(&mut self, error: FlowError) {
        if std::mem::replace(&mut self.finished, true) {
            self.stage.report(error);
            return;
        }
        self.stage.fail(error, Origin::Inner);
    }

    fn on_complete(&mut self) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        self.stage.inner_done.store(true, Ordering::Release);
        self.stage.schedule();
    }
}
