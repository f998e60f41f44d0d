//! Error surface shared by every pipeline primitive.
//!
//! Data errors travel through the pipeline as terminal signals (`Failed`).
//! Usage failures (`NoSuchElement`, `BlockingForbidden`) and interruption are
//! returned to the caller of the blocking bridge. Protocol violations are
//! either panics (sentinel misuse) or diagnostics reports (double attach),
//! never silently swallowed.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Convenience result alias for fallible pipeline operations.
pub type FlowResult<T, E = FlowError> = Result<T, E>;

/// Shared, cloneable cause carried by [`FlowError::Failed`].
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// Terminal failure raised by a producer or a user-supplied callback.
    #[error("{0}")]
    Failed(Cause),

    /// A value was requested from the blocking bridge but none arrived.
    #[error("no value was received")]
    NoSuchElement,

    /// A blocking wait was attempted while the thread is delivering signals.
    #[error("attempt to block on thread `{thread}` while it is delivering pipeline signals")]
    BlockingForbidden { thread: String },

    /// The blocking wait was interrupted before the bridge was released.
    #[error("blocking wait was interrupted")]
    Interrupted,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("capacity {requested} must be at least {minimum}")]
    InvalidCapacity { requested: usize, minimum: usize },
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl FlowError {
    /// Wraps an arbitrary error as a terminal pipeline failure.
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FlowError::Failed(Arc::new(error))
    }

    /// Terminal failure described only by a message.
    pub fn msg(msg: impl Into<String>) -> Self {
        FlowError::failed(Message(msg.into()))
    }

    /// Returns the wrapped cause for [`FlowError::Failed`].
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            FlowError::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    /// True when this is a `Failed` whose cause is an `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause().and_then(|cause| cause.downcast_ref::<E>())
    }

    /// Caller misuse of the blocking bridge, as opposed to a data error.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            FlowError::NoSuchElement | FlowError::BlockingForbidden { .. }
        )
    }
}
