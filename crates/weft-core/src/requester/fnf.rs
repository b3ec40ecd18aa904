//! Fire-and-forget: one request frame, no stream afterwards.

use std::sync::Arc;

use crate::session::SessionCore;
use crate::{FrameType, InteractionKind, Payload, WeftError};

use super::request_spec;

/// Sends one payload with no response stream.
///
/// The stream id is allocated for the wire frame but never registered;
/// there is nothing to route back.
pub struct FireAndForgetRequester {
    core: Arc<SessionCore>,
    payload: Option<Payload>,
}

impl FireAndForgetRequester {
    pub(crate) fn new(core: Arc<SessionCore>, payload: Payload) -> Self {
        Self {
            core,
            payload: Some(payload),
        }
    }

    /// Validate, admit, and send. Consumes the operator; fire-and-forget
    /// has exactly one observable action.
    pub fn subscribe(mut self) -> Result<(), WeftError> {
        let payload = self.payload.take().ok_or(WeftError::ReleasedPayload)?;
        if !payload.is_valid() {
            return Err(WeftError::ReleasedPayload);
        }
        self.core.check_outbound(&payload, 0)?;
        self.core.admit_outbound()?;

        let stream_id = self.core.next_stream_id();
        self.core
            .interceptor
            .on_start(stream_id, InteractionKind::FireAndForget);
        self.core
            .send_payload(request_spec(stream_id, FrameType::RequestFnf, None), payload)?;
        self.core.interceptor.on_complete(stream_id);
        tracing::trace!(stream_id, "fire-and-forget sent");
        Ok(())
    }
}
