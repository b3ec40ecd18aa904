//! Lifecycle observation hooks.

use crate::{ErrorCode, InteractionKind, WeftError};

/// Observes stream lifecycle events on one side of a connection.
///
/// All methods default to no-ops; implementations hang metrics or tracing
/// off the events they care about. Hooks run inline on the engine's paths
/// and must not block.
pub trait RequestInterceptor: Send + Sync + 'static {
    /// A stream was started (first frame sent or accepted).
    fn on_start(&self, stream_id: u32, kind: InteractionKind) {
        let _ = (stream_id, kind);
    }

    /// A stream completed normally.
    fn on_complete(&self, stream_id: u32) {
        let _ = stream_id;
    }

    /// A stream was cancelled.
    fn on_cancel(&self, stream_id: u32) {
        let _ = stream_id;
    }

    /// A stream terminated with an error.
    fn on_error(&self, stream_id: u32, error: &WeftError) {
        let _ = (stream_id, error);
    }

    /// An inbound request was refused before a stream existed.
    fn on_reject(&self, stream_id: u32, code: ErrorCode) {
        let _ = (stream_id, code);
    }
}

/// The default interceptor: observes nothing.
pub struct NoopInterceptor;

impl RequestInterceptor for NoopInterceptor {}
