//! Work-in-progress counter that serialises a drain loop.
//!
//! Any thread (including one already inside the loop, re-entering through a
//! downstream callback) may signal "there is work" with [`Drain::enter`].
//! Only the caller that moved the counter from zero runs passes; everyone
//! else just increments and leaves. The runner keeps going until a
//! [`Drain::leave`] observes zero, so no signal is lost and the call stack
//! never grows with the number of reentrant signals.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicUsize, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

#[derive(Debug)]
pub struct Drain {
    wip: AtomicUsize,
}

impl Drain {
    pub fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
        }
    }

    /// Registers one unit of work. Returns `true` when the caller became the
    /// drain owner and must run passes until [`Drain::leave`] returns zero.
    #[inline]
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Retires `missed` units of work, returning what is still outstanding.
    #[inline]
    pub fn leave(&self, missed: usize) -> usize {
        let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
        assert!(prev >= missed, "drain counter underflow");
        prev - missed
    }

    pub fn is_active(&self) -> bool {
        self.wip.load(Ordering::Acquire) != 0
    }

    /// Signals work and, if this caller owns the drain, runs `pass` until no
    /// signals are outstanding. Returns whether any pass ran on this call.
    pub fn run(&self, mut pass: impl FnMut()) -> bool {
        if !self.enter() {
            return false;
        }
        let mut missed = 1;
        let mut passes = 0usize;
        loop {
            pass();
            passes += 1;
            missed = self.leave(missed);
            if missed == 0 {
                break;
            }
        }
        trace!("drain finished after {passes} passes");
        true
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}
