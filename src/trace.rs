//! DEBUG instrumentation for the decode loop
//!
//! With the `tracing` feature, [`trace_enter!`] opens a DEBUG span and
//! [`trace_event!`] emits a DEBUG event through the `tracing` crate. Without
//! it both macros expand to nothing observable.
//!
//! Spans opened by the crate:
//!
//! | Span | Fields | Opened by |
//! |---|---|---|
//! | `decode` | `beam_width`, `max_len` | [`crate::decode`] |
//! | `greedy_decode` | `max_len` | [`crate::GreedyDecoder::decode`] |
//! | `beam_decode` | `beam_width`, `lanes` | [`crate::BeamDecoder::decode_observed`] |
//! | `decode_step` | `step` | [`crate::StepHarness::step`] |
//!
//! Events: `beam step` (`step`, `done` lane count) after every beam step,
//! `beam finished` (`steps`, `early_stop`), and `greedy: all lanes done`.

/// Guard returned by `trace_enter!` when spans are compiled out
#[cfg(not(feature = "tracing"))]
pub struct NoopSpanGuard;

/// Entered DEBUG span guard; a unit guard without the `tracing` feature
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_enter {
    ($name:expr) => {
        tracing::span!(tracing::Level::DEBUG, $name).entered()
    };
    ($name:expr, $($field:tt)*) => {
        tracing::span!(tracing::Level::DEBUG, $name, $($field)*).entered()
    };
}

/// Entered DEBUG span guard; a unit guard without the `tracing` feature
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_enter {
    ($name:expr) => {
        $crate::trace::NoopSpanGuard
    };
    ($name:expr, $($field:tt)*) => {
        $crate::trace::NoopSpanGuard
    };
}

/// DEBUG event with optional fields; expands to nothing without `tracing`
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

/// DEBUG event with optional fields; expands to nothing without `tracing`
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($($arg:tt)*) => {};
}

pub use trace_enter;
pub use trace_event;
