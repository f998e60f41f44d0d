//! Blocking bridge from a pipeline to a waiting caller.
//!
//! A [`BlockingBridge`] is a terminal consumer paired with a one-shot
//! [`Latch`]. The policy type decides which items matter: [`First`] keeps the
//! first item and cancels upstream, [`Last`] keeps overwriting until the
//! source terminates. Waiting is refused on threads that are currently
//! delivering pipeline signals (see [`DeliveryScope`]), since the signal that
//! would release the wait could only arrive on that same thread.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use log::debug;
use parking_lot::Mutex;

use crate::handle::DeferredHandle;
use crate::hooks;
use crate::null::{self, Wrapped};
use crate::protocol::{BoxConsumer, Cancellable, Consumer, Subscription};
use crate::source::Source;
use crate::wait::{wait_u32, wake_all, WaitResult};
use crate::{FlowError, FlowResult};

const PENDING: u32 = 0;
const RELEASED: u32 = 1;
const INTERRUPTED: u32 = 2;

/// Count-down-from-one latch.
pub struct Latch {
    state: AtomicU32,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(PENDING),
        }
    }

    /// Opens the latch; later calls and calls after an interrupt are no-ops.
    pub fn release(&self) {
        if self
            .state
            .compare_exchange(PENDING, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            wake_all(&self.state);
        }
    }

    /// Aborts pending and future waits with [`FlowError::Interrupted`].
    /// Returns `false` if the latch had already been released.
    pub fn interrupt(&self) -> bool {
        let interrupted = self
            .state
            .compare_exchange(PENDING, INTERRUPTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if interrupted {
            wake_all(&self.state);
        }
        interrupted
    }

    pub fn wait(&self) -> FlowResult<()> {
        let mut wakeups = 0u32;
        loop {
            match self.state.load(Ordering::Acquire) {
                RELEASED => {
                    if wakeups > 1 {
                        debug!("latch released after {wakeups} wake-ups");
                    }
                    return Ok(());
                }
                INTERRUPTED => return Err(FlowError::Interrupted),
                _ => match wait_u32(&self.state, PENDING) {
                    WaitResult::Woken => wakeups = wakeups.saturating_add(1),
                    WaitResult::Retry => std::hint::spin_loop(),
                },
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) == RELEASED
    }

    /// 1 until released, 0 afterwards.
    pub fn count(&self) -> u32 {
        u32::from(!self.is_released())
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}

thread_local! {
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as delivering pipeline signals while alive.
///
/// Every in-tree delivery path holds one of these; nesting is allowed.
#[must_use = "the scope ends when the guard is dropped"]
pub struct DeliveryScope {
    _not_send: PhantomData<*const ()>,
}

impl DeliveryScope {
    pub fn enter() -> Self {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is inside a [`DeliveryScope`].
pub fn in_delivery() -> bool {
    DELIVERY_DEPTH.with(Cell::get) > 0
}

/// Fails with [`FlowError::BlockingForbidden`] when blocking here could deadlock.
pub fn verify_non_blocking() -> FlowResult<()> {
    if hooks::config().fail_on_blocking_in_delivery && in_delivery() {
        let current = thread::current();
        return Err(FlowError::BlockingForbidden {
            thread: current.name().unwrap_or("<unnamed>").to_string(),
        });
    }
    Ok(())
}

/// State shared by a bridge and its consumer.
pub struct BridgeCore<T> {
    latch: Latch,
    value: Mutex<Option<Wrapped<T>>>,
    error: Mutex<Option<FlowError>>,
    upstream: DeferredHandle,
}

impl<T: Send + 'static> BridgeCore<T> {
    fn new() -> Self {
        Self {
            latch: Latch::new(),
            value: Mutex::new(None),
            error: Mutex::new(None),
            upstream: DeferredHandle::new(),
        }
    }

    pub fn release(&self) {
        self.latch.release();
    }

    pub fn cancel_upstream(&self) {
        self.upstream.cancel();
    }

    /// Stores `item` unless a value is already held. Returns whether it was stored.
    pub fn store_if_empty(&self, item: Option<T>) -> bool {
        let mut value = self.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(null::wrap(item));
        true
    }

    pub fn store(&self, item: Option<T>) {
        *self.value.lock() = Some(null::wrap(item));
    }

    pub fn has_value(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn clear_value(&self) {
        let _ = self.value.lock().take();
    }

    pub fn set_error(&self, error: FlowError) {
        *self.error.lock() = Some(error);
    }
}

/// Decides how a bridge reacts to items and errors. Completion always releases.
pub trait BridgePolicy: Send + Sync + 'static {
    fn on_next<T: Send + 'static>(core: &BridgeCore<T>, item: Option<T>);

    fn on_error<T: Send + 'static>(core: &BridgeCore<T>, error: FlowError);
}

/// Keep the first item, cancel upstream, release.
#[derive(Debug)]
pub struct First;

impl BridgePolicy for First {
    fn on_next<T: Send + 'static>(core: &BridgeCore<T>, item: Option<T>) {
        if core.store_if_empty(item) {
            core.cancel_upstream();
            core.release();
        }
    }

    fn on_error<T: Send + 'static>(core: &BridgeCore<T>, error: FlowError) {
        if !core.has_value() {
            core.set_error(error);
        }
        core.release();
    }
}

/// Keep the latest item; release on termination.
#[derive(Debug)]
pub struct Last;

impl BridgePolicy for Last {
    fn on_next<T: Send + 'static>(core: &BridgeCore<T>, item: Option<T>) {
        core.store(item);
    }

    fn on_error<T: Send + 'static>(core: &BridgeCore<T>, error: FlowError) {
        core.clear_value();
        core.set_error(error);
        core.release();
    }
}

struct BridgeConsumer<T, P> {
    core: Arc<BridgeCore<T>>,
    _policy: PhantomData<fn() -> P>,
}

impl<T: Send + 'static, P: BridgePolicy> Consumer<T> for BridgeConsumer<T, P> {
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        self.core.upstream.attach(subscription.into_handle());
    }

    fn on_next(&mut self, item: Option<T>) {
        P::on_next(&self.core, item);
    }

    fn on_error(&mut self, error: FlowError) {
        P::on_error(&self.core, error);
    }

    fn on_complete(&mut self) {
        self.core.release();
    }
}

/// Terminal consumer that lets a caller wait for a pipeline's outcome.
pub struct BlockingBridge<T, P> {
    core: Arc<BridgeCore<T>>,
    _policy: PhantomData<fn() -> P>,
}

pub type BlockingFirst<T> = BlockingBridge<T, First>;
pub type BlockingLast<T> = BlockingBridge<T, Last>;

impl<T: Send + 'static, P: BridgePolicy> BlockingBridge<T, P> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(BridgeCore::new()),
            _policy: PhantomData,
        }
    }

    /// The consumer side, to be subscribed to exactly one source.
    pub fn consumer(&self) -> BoxConsumer<T> {
        Box::new(BridgeConsumer::<T, P> {
            core: Arc::clone(&self.core),
            _policy: PhantomData,
        })
    }

    pub fn subscribe_to(&self, source: &dyn Source<T>) {
        source.subscribe(self.consumer());
    }

    /// Waits for the source to settle. `Ok(true)` when a value is held,
    /// `Ok(false)` for a source that completed empty, `Err` for the source's
    /// error, a forbidden wait or an interrupt (which also cancels upstream).
    pub fn blocking_get(&self) -> FlowResult<bool> {
        if self.core.latch.count() != 0 {
            verify_non_blocking()?;
            if let Err(err) = self.core.latch.wait() {
                debug!("blocking wait interrupted; cancelling upstream");
                self.cancel();
                return Err(err);
            }
        }
        if let Some(err) = self.core.error.lock().clone() {
            return Err(err);
        }
        Ok(self.core.has_value())
    }

    /// The held value, the stored error, or `NoSuchElement` when neither exists.
    pub fn get_value(&self) -> FlowResult<Option<T>>
    where
        T: Clone,
    {
        if let Some(value) = self.core.value.lock().as_ref() {
            return Ok(value.as_option().cloned());
        }
        self.missing()
    }

    /// Like [`get_value`](Self::get_value) but moves the value out.
    pub fn take_value(&self) -> FlowResult<Option<T>> {
        if let Some(value) = self.core.value.lock().take() {
            return Ok(null::unwrap(value));
        }
        self.missing()
    }

    fn missing(&self) -> FlowResult<Option<T>> {
        match self.core.error.lock().clone() {
            Some(err) => Err(err),
            None => Err(FlowError::NoSuchElement),
        }
    }

    pub fn cancel(&self) {
        self.core.cancel_upstream();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.upstream.is_cancelled()
    }

    /// Interrupts a pending or future `blocking_get`.
    pub fn interrupt(&self) -> bool {
        self.core.latch.interrupt()
    }

    pub fn count(&self) -> u32 {
        self.core.latch.count()
    }
}

impl<T: Send + 'static, P: BridgePolicy> Default for BlockingBridge<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P> Clone for BlockingBridge<T, P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _policy: PhantomData,
        }
    }
}

/// Subscribes to `source` and waits for its first item.
pub fn blocking_first<T: Send + 'static>(source: &dyn Source<T>) -> FlowResult<Option<T>> {
    settle(BlockingFirst::new(), source)
}

/// Subscribes to `source` and waits for its last item.
pub fn blocking_last<T: Send + 'static>(source: &dyn Source<T>) -> FlowResult<Option<T>> {
    settle(BlockingLast::new(), source)
}

fn settle<T: Send + 'static, P: BridgePolicy>(
    bridge: BlockingBridge<T, P>,
    source: &dyn Source<T>,
) -> FlowResult<Option<T>> {
    bridge.subscribe_to(source);
    if bridge.blocking_get()? {
        bridge.take_value()
    } else {
        Err(FlowError::NoSuchElement)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    //! Latch wake-ups and the first/last bridge policies.

    use super::*;
    use crate::source::{create, empty, fail, from_vec, just, SourceExt};
    use crate::testing::test_consumer;
    use std::sync::mpsc;
    use std::time::Duration;

    /// A waiter parked on the latch resumes after release.
    #[test]
    fn latch_release_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        assert_eq!(latch.count(), 1);
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(10));
        latch.release();
        waiter.join().unwrap().unwrap();
        assert_eq!(latch.count(), 0);
        assert!(!latch.interrupt());
    }

    /// Interrupt wins over a later release.
    #[test]
    fn latch_interrupt() {
        let latch = Latch::new();
        assert!(latch.interrupt());
        latch.release();
        assert!(matches!(latch.wait(), Err(FlowError::Interrupted)));
        assert_eq!(latch.count(), 1);
    }

    /// First keeps the first item and cancels upstream.
    #[test]
    fn first_of_many() {
        let bridge = BlockingFirst::new();
        bridge.subscribe_to(&*from_vec(vec![Some(1), Some(2), Some(3)]));
        assert!(bridge.blocking_get().unwrap());
        assert_eq!(bridge.get_value().unwrap(), Some(1));
        assert!(bridge.is_cancelled());
    }

    /// Last keeps overwriting until completion.
    #[test]
    fn last_of_many() {
        let bridge = BlockingLast::new();
        bridge.subscribe_to(&*from_vec(vec![Some(1), None, Some(3)]));
        assert!(bridge.blocking_get().unwrap());
        assert_eq!(bridge.get_value().unwrap(), Some(3));
        assert_eq!(blocking_last(&*from_vec(vec![Some(1), None])).unwrap(), None);
    }

    /// An absent item is a value, not "no value".
    #[test]
    fn absent_item_is_a_value() {
        let bridge = BlockingFirst::<u8>::new();
        bridge.subscribe_to(&*just(None));
        assert!(bridge.blocking_get().unwrap());
        assert_eq!(bridge.get_value().unwrap(), None);
    }

    /// Empty sources report `false` and a missing value.
    #[test]
    fn empty_source() {
        let bridge = BlockingFirst::<u8>::new();
        bridge.subscribe_to(&*empty());
        assert!(!bridge.blocking_get().unwrap());
        assert!(matches!(bridge.get_value(), Err(FlowError::NoSuchElement)));
        assert!(matches!(
            blocking_first(&*empty::<u8>()),
            Err(FlowError::NoSuchElement)
        ));
    }

    /// Source errors are re-raised by every accessor.
    #[test]
    fn error_is_reraised() {
        let bridge = BlockingLast::<u8>::new();
        bridge.subscribe_to(&*fail(FlowError::msg("upstream")));
        let err = bridge.blocking_get().unwrap_err();
        assert_eq!(err.to_string(), "upstream");
        assert_eq!(bridge.get_value().unwrap_err().to_string(), "upstream");
    }

    /// Last drops the held value when the source fails afterwards.
    #[test]
    fn last_error_after_items() {
        let source = create::<i32, _>(|emitter| {
            emitter.next(Some(1));
            emitter.error(FlowError::msg("late"));
            Ok(())
        });
        assert_eq!(
            source.blocking_last().unwrap_err().to_string(),
            "late"
        );
        assert_eq!(source.blocking_first().unwrap(), Some(1));
    }

    /// Values produced on another thread release the waiting caller.
    #[test]
    fn cross_thread_delivery() {
        let source = create(|emitter| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                emitter.next(Some("from worker"));
                emitter.complete();
            });
            Ok(())
        });
        assert_eq!(source.blocking_first().unwrap(), Some("from worker"));
    }

    /// Cancelling before subscription cancels upstream on attach.
    #[test]
    fn cancel_before_attach() {
        let bridge = BlockingLast::<u8>::new();
        bridge.cancel();
        let (tx, rx) = mpsc::channel();
        let source = create(move |emitter| {
            tx.send(emitter.is_cancelled()).unwrap();
            Ok(())
        });
        bridge.subscribe_to(&*source);
        assert!(rx.recv().unwrap());
    }

    /// Interrupting the wait cancels upstream and surfaces `Interrupted`.
    #[test]
    fn interrupt_cancels_upstream() {
        let (tx, rx) = mpsc::channel();
        let source = create(move |emitter| {
            tx.send(emitter).unwrap();
            Ok(())
        });
        let bridge = BlockingFirst::<u8>::new();
        bridge.subscribe_to(&*source);
        let emitter = rx.recv().unwrap();

        let interrupter = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                bridge.interrupt();
            })
        };
        assert!(matches!(bridge.blocking_get(), Err(FlowError::Interrupted)));
        interrupter.join().unwrap();
        assert!(bridge.is_cancelled());
        assert!(emitter.is_cancelled());
    }

    /// Waiting from inside a delivery callback fails fast.
    #[test]
    fn blocking_inside_delivery_is_forbidden() {
        let outcome = Arc::new(Mutex::new(None));
        let record = outcome.clone();
        let (consumer, probe) = test_consumer::<u8>();
        let consumer = consumer.with_on_next(move |_| {
            let never = create(|_emitter| Ok(()));
            let bridge = BlockingFirst::<u8>::new();
            bridge.subscribe_to(&*never);
            *record.lock() = Some(bridge.blocking_get());
        });
        just(Some(1)).subscribe(Box::new(consumer));

        probe.assert_result(&[Some(1)]);
        let outcome = outcome.lock().take().unwrap();
        assert!(matches!(outcome, Err(FlowError::BlockingForbidden { .. })));
        assert!(outcome.unwrap_err().is_usage());
        assert!(!in_delivery());
    }

    /// An already released bridge never consults the delivery guard.
    #[test]
    fn released_bridge_does_not_block() {
        let _scope = DeliveryScope::enter();
        let bridge = BlockingFirst::new();
        bridge.subscribe_to(&*just(Some(2)));
        assert!(bridge.blocking_get().unwrap());
        assert_eq!(bridge.count(), 0);
    }
}
