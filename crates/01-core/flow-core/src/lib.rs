//! Execution core of a push-based reactive pipeline.
//!
//! This crate exposes the primitives every pipeline stage is built on:
//! * [`Consumer`] / [`Subscription`] – the delivery contract and its shared cancellation handle.
//! * [`null`] – the sentinel wrapper that tells "empty slot" apart from "absent item".
//! * [`FusionMask`] / [`FusedQueue`] – opt-in queue sharing between adjacent stages.
//! * [`ScalarHandle`] / [`ScalarSource`] – fast paths for sources with zero or one known item.
//! * [`BlockingBridge`] – a one-shot blocking wait for the result of a pipeline.
//! * [`AppendOnlyBuffer`] – chunked, write-once backlog for replay.
//! * [`Drain`] – the work counter that turns reentrant signalling into loop iterations.
//!
//! [`Emitter`], [`ConcatMap`] and the producers in [`source`] implement
//! those contracts end to end. Undeliverable errors go through [`hooks`].

mod blocking;
mod buffer;
mod concat;
mod drain;
mod emitter;
mod error;
mod fusion;
mod handle;
pub mod hooks;
pub mod null;
mod protocol;
mod scalar;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod wait;

pub use blocking::{
    blocking_first, blocking_last, in_delivery, verify_non_blocking, BlockingBridge,
    BlockingFirst, BlockingLast, BridgeCore, BridgePolicy, DeliveryScope, First, Last, Latch,
};
pub use buffer::{AppendOnlyBuffer, Iter, Visit};
pub use concat::{ConcatMap, ErrorMode};
pub use drain::Drain;
pub use emitter::Emitter;
pub use error::{Cause, FlowError, FlowResult};
pub use fusion::{FusedQueue, FusionMask, FusionMode};
pub use handle::{
    cancelled, complete_immediately, error_immediately, BooleanHandle, DeferredHandle,
    SequentialHandle,
};
pub use hooks::{Diagnostics, FlowConfig, LogSink, UndeliverableSink};
pub use null::{Null, Wrapped, NULL};
pub use protocol::{
    BoxConsumer, Cancellable, Consumer, Handle, Notification, QueueRef, Subscription,
};
pub use scalar::{
    scalar_x_map, try_scalar_x_map_subscribe, DeferredScalarHandle, ScalarHandle, ScalarXMap,
};
pub use source::{ScalarSource, SharedSource, Source, SourceExt};
