//! Fusion negotiation between adjacent pipeline stages.
//!
//! A consumer that receives a [`Subscription`](crate::Subscription) carrying a
//! queue may call [`FusedQueue::request_fusion`] once, from inside
//! `on_subscribe`, with the set of modes it can handle. The producer answers
//! with a single granted mode:
//!
//! - `Sync`: the consumer pulls with `poll` until it yields `Ok(None)`, which
//!   means the stream is complete. No `on_next`/`on_complete` follow.
//! - `Async`: the producer only signals `on_available`; the consumer pulls
//!   with `poll` and `Ok(None)` just means "nothing right now".
//! - `None`: regular push delivery.
//!
//! `BOUNDARY` is a request-side flag: the consumer is going to poll from a
//! different thread than the one the producer runs on, so a producer whose
//! `poll` runs user code must refuse.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::null::Wrapped;
use crate::protocol::Cancellable;
use crate::{FlowError, FlowResult};

/// Mode granted by a producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FusionMode {
    #[default]
    None,
    Sync,
    Async,
    Boundary,
}

impl FusionMode {
    pub fn is_fused(self) -> bool {
        matches!(self, FusionMode::Sync | FusionMode::Async)
    }
}

/// A set of fusion modes, used both for requests and for what a producer supports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionMask(u8);

impl FusionMask {
    pub const NONE: FusionMask = FusionMask(0);
    pub const SYNC: FusionMask = FusionMask(1);
    pub const ASYNC: FusionMask = FusionMask(2);
    pub const ANY: FusionMask = FusionMask(3);
    pub const BOUNDARY: FusionMask = FusionMask(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: FusionMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersection(self, other: FusionMask) -> FusionMask {
        FusionMask(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Picks the mode a producer advertising `supported` grants for this request.
    pub fn grant(self, supported: FusionMask) -> FusionMode {
        if self.contains(FusionMask::BOUNDARY) && !supported.contains(FusionMask::BOUNDARY) {
            return FusionMode::None;
        }
        let overlap = self.intersection(supported);
        if overlap.contains(FusionMask::SYNC) {
            FusionMode::Sync
        } else if overlap.contains(FusionMask::ASYNC) {
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }
}

impl BitOr for FusionMask {
    type Output = FusionMask;

    fn bitor(self, rhs: FusionMask) -> FusionMask {
        FusionMask(self.0 | rhs.0)
    }
}

impl BitAnd for FusionMask {
    type Output = FusionMask;

    fn bitand(self, rhs: FusionMask) -> FusionMask {
        self.intersection(rhs)
    }
}

impl From<FusionMode> for FusionMask {
    fn from(mode: FusionMode) -> Self {
        match mode {
            FusionMode::None => FusionMask::NONE,
            FusionMode::Sync => FusionMask::SYNC,
            FusionMode::Async => FusionMask::ASYNC,
            FusionMode::Boundary => FusionMask::BOUNDARY,
        }
    }
}

impl fmt::Debug for FusionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (FusionMask::SYNC, "SYNC"),
            (FusionMask::ASYNC, "ASYNC"),
            (FusionMask::BOUNDARY, "BOUNDARY"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Queue view a fusable producer hands to its consumer.
///
/// Only the consumer side is public: `poll`, `is_empty` and `clear` are called
/// by the single downstream consumer, never concurrently with each other.
pub trait FusedQueue<T>: Cancellable {
    /// One-shot negotiation; must be called from `on_subscribe` before any `poll`.
    fn request_fusion(&self, requested: FusionMask) -> FusionMode;

    /// Next item, `Ok(None)` when nothing is available. Errors raised by
    /// user code running inside `poll` surface here.
    fn poll(&self) -> FlowResult<Option<Wrapped<T>>>;

    fn is_empty(&self) -> bool;

    fn clear(&self);

    /// Producers own the write side; consumers may not enqueue.
    fn offer(&self, _item: Option<T>) -> FlowResult<()> {
        Err(FlowError::Unsupported("offer on a consumer-side fused queue"))
    }
}
