//! Process-wide diagnostics sink and configuration.
//!
//! Errors that can no longer be delivered (a second terminal error, an error
//! racing a cancellation, a double attach) are handed to the installed
//! [`UndeliverableSink`]. Without one, they are logged. Primitives that take
//! an explicit sink (`with_sink`) report there instead of the global slot.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::error;

use crate::FlowError;

/// Receives errors that have no consumer left to deliver them to.
pub trait UndeliverableSink: Send + Sync {
    fn report_undeliverable(&self, error: FlowError);
}

pub type Diagnostics = Arc<dyn UndeliverableSink>;

/// Default sink; never drops a report silently.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl UndeliverableSink for LogSink {
    fn report_undeliverable(&self, err: FlowError) {
        error!("undeliverable pipeline error: {err}");
    }
}

impl<F> UndeliverableSink for F
where
    F: Fn(FlowError) + Send + Sync,
{
    fn report_undeliverable(&self, error: FlowError) {
        self(error)
    }
}

static SINK: ArcSwapOption<Diagnostics> = ArcSwapOption::const_empty();
static CONFIG: ArcSwapOption<FlowConfig> = ArcSwapOption::const_empty();

/// Installs the process-wide sink, returning the previous one.
pub fn set_undeliverable_sink(sink: Diagnostics) -> Option<Diagnostics> {
    SINK.swap(Some(Arc::new(sink))).map(|prev| Arc::clone(&*prev))
}

/// The installed sink, or [`LogSink`] when none is installed.
pub fn sink() -> Diagnostics {
    match SINK.load_full() {
        Some(installed) => Arc::clone(&*installed),
        None => Arc::new(LogSink),
    }
}

pub fn report_undeliverable(error: FlowError) {
    sink().report_undeliverable(error);
}

/// Reports to `local` when present, otherwise to the global sink.
pub(crate) fn report_to(local: Option<&Diagnostics>, error: FlowError) {
    match local {
        Some(sink) => sink.report_undeliverable(error),
        None => report_undeliverable(error),
    }
}

/// Removes the installed sink and configuration.
pub fn reset() {
    SINK.store(None);
    CONFIG.store(None);
}

/// Tunables read by the primitives at construction or call time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    /// Chunk capacity used by [`AppendOnlyBuffer::from_config`](crate::AppendOnlyBuffer::from_config).
    pub buffer_chunk_capacity: usize,
    /// Reject `blocking_get` on a thread that is delivering signals.
    pub fail_on_blocking_in_delivery: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_chunk_capacity: 16,
            fail_on_blocking_in_delivery: true,
        }
    }
}

pub fn set_config(config: FlowConfig) {
    CONFIG.store(Some(Arc::new(config)));
}

pub fn config() -> FlowConfig {
    CONFIG.load().as_deref().copied().unwrap_or_default()
}
