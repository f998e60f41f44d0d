//! Cancellation cells.
//!
//! - [`BooleanHandle`]: a bare flag for producers with nothing upstream.
//! - [`DeferredHandle`]: set-once slot for an upstream handle that may arrive
//!   after the downstream already cancelled.
//! - [`SequentialHandle`]: replaceable slot for stages that subscribe to one
//!   inner source after another.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::hooks::{self, Diagnostics};
use crate::protocol::{Cancellable, Consumer, Handle, Subscription};
use crate::FlowError;

/// Plain atomic cancellation flag.
pub struct BooleanHandle {
    cancelled: AtomicBool,
}

impl BooleanHandle {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    /// Sets the flag; `true` only for the call that flipped it.
    pub fn try_cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }
}

impl Default for BooleanHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for BooleanHandle {
    fn cancel(&self) {
        self.try_cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BooleanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BooleanHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

const EMPTY: u32 = 0;
const ATTACHING: u32 = 1;
const ATTACHED: u32 = 2;
const CANCELLED: u32 = 3;

/// Holds an upstream handle that is attached at most once.
///
/// `cancel` may run before, during or after `attach`; in every interleaving
/// the attached handle ends up cancelled exactly when this cell is.
pub struct DeferredHandle {
    state: AtomicU32,
    // Written only by the thread that moved `state` to ATTACHING.
    slot: Mutex<Option<Handle>>,
    sink: Option<Diagnostics>,
}

impl DeferredHandle {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY),
            slot: Mutex::new(None),
            sink: None,
        }
    }

    /// Reports double attaches to `sink` instead of the global hook.
    pub fn with_sink(sink: Diagnostics) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Attaches the upstream handle. Returns `false` if the cell was already
    /// cancelled or attached; `handle` is cancelled in both cases.
    pub fn attach(&self, handle: Handle) -> bool {
        match self
            .state
            .compare_exchange(EMPTY, ATTACHING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                *self.slot.lock() = Some(handle);
                if self
                    .state
                    .compare_exchange(ATTACHING, ATTACHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                // Cancelled while attaching; the canceller left the slot to us.
                let taken = self.slot.lock().take();
                if let Some(handle) = taken {
                    handle.cancel();
                }
                false
            }
            Err(CANCELLED) => {
                debug!("attach after cancel; cancelling incoming handle");
                handle.cancel();
                false
            }
            Err(_) => {
                handle.cancel();
                hooks::report_to(
                    self.sink.as_ref(),
                    FlowError::ProtocolViolation("subscription already attached"),
                );
                false
            }
        }
    }

    /// Cancels the cell and any attached handle; `true` only for the first call.
    pub fn try_cancel(&self) -> bool {
        match self.state.swap(CANCELLED, Ordering::AcqRel) {
            CANCELLED => false,
            ATTACHED => {
                let taken = self.slot.lock().take();
                if let Some(handle) = taken {
                    handle.cancel();
                }
                true
            }
            _ => true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state.load(Ordering::Acquire) == ATTACHED
    }
}

impl Default for DeferredHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for DeferredHandle {
    fn cancel(&self) {
        self.try_cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            ATTACHING => "attaching",
            ATTACHED => "attached",
            _ => "cancelled",
        };
        f.debug_struct("DeferredHandle").field("state", &state).finish()
    }
}

/// Replaceable inner handle; cancelling it cancels the current and every future one.
pub struct SequentialHandle {
    cancelled: AtomicBool,
    current: Mutex<Option<Handle>>,
}

impl SequentialHandle {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// Swaps in `next`. After cancellation `next` is cancelled instead and
    /// `false` is returned. The previous handle is dropped, not cancelled.
    pub fn replace(&self, next: Handle) -> bool {
        let rejected = {
            let mut current = self.current.lock();
            if self.cancelled.load(Ordering::Acquire) {
                Some(next)
            } else {
                *current = Some(next);
                None
            }
        };
        match rejected {
            Some(next) => {
                next.cancel();
                false
            }
            None => true,
        }
    }

    /// Drops the current handle without cancelling it.
    pub fn clear(&self) {
        let _ = self.current.lock().take();
    }
}

impl Default for SequentialHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for SequentialHandle {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let taken = self.current.lock().take();
        if let Some(handle) = taken {
            handle.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct AlreadyCancelled;

impl Cancellable for AlreadyCancelled {
    fn cancel(&self) {}

    fn is_cancelled(&self) -> bool {
        true
    }
}

/// A handle that reports itself cancelled; for producers that finish inside `subscribe`.
pub fn cancelled() -> Handle {
    Arc::new(AlreadyCancelled)
}

/// `on_subscribe` with a cancelled handle followed by `on_complete`.
pub fn complete_immediately<T, C: Consumer<T> + ?Sized>(consumer: &mut C) {
    consumer.on_subscribe(Subscription::plain(cancelled()));
    consumer.on_complete();
}

/// `on_subscribe` with a cancelled handle followed by `on_error`.
pub fn error_immediately<T, C: Consumer<T> + ?Sized>(consumer: &mut C, error: FlowError) {
    consumer.on_subscribe(Subscription::plain(cancelled()));
    consumer.on_error(error);
}
