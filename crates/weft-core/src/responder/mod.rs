//! Responder-side operators: one per accepted inbound request.

mod channel;
mod fnf;
mod response;
mod stream;

use std::sync::Arc;

use crate::session::SessionCore;
use crate::{ErrorCode, Frame, FrameType, RequestHandler, WeftError};

pub(crate) use channel::ChannelResponder;
pub(crate) use fnf::FnfResponder;
pub(crate) use response::ResponseResponder;
pub(crate) use stream::StreamResponder;

/// How many inbound channel payloads the responder lets the peer send
/// before waiting for a new REQUEST_N grant.
pub(crate) const CHANNEL_INBOUND_WINDOW: u32 = 64;

/// Accepts inbound REQUEST_* frames and spins up the matching operator.
pub(crate) struct Responder {
    core: Arc<SessionCore>,
    handler: Arc<dyn RequestHandler>,
}

impl Responder {
    pub fn new(core: Arc<SessionCore>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { core, handler }
    }

    /// Route the opening frame of a new inbound stream.
    ///
    /// A request on an id that is already live is a duplicate delivery and
    /// is dropped; the existing operator keeps running.
    pub fn accept(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        if self.core.registry.contains(stream_id) {
            tracing::debug!(stream_id, "duplicate request on live stream, dropped");
            return;
        }

        // Lease admission happens before any per-request work. Interactions
        // with a response channel get a REJECTED error; fire-and-forget has
        // none and is dropped quietly.
        if let Some(lease) = &self.core.responder_lease {
            if lease.admit().is_err() {
                self.reject(&frame, WeftError::MissingLease);
                return;
            }
        }

        // A single-frame payload that busts the inbound limit is refused
        // before the handler ever sees it. Fragmented requests are checked
        // incrementally by the reassembler instead.
        if !frame.follows() {
            let len = frame.payload.as_ref().map_or(0, crate::Payload::len);
            if let Err(e) = self.core.config.check_inbound_payload(len) {
                self.reject(&frame, e);
                return;
            }
        }

        match frame.frame_type {
            FrameType::RequestFnf => FnfResponder::accept(&self.core, &self.handler, frame),
            FrameType::RequestResponse => {
                ResponseResponder::accept(&self.core, &self.handler, frame)
            }
            FrameType::RequestStream => StreamResponder::accept(&self.core, &self.handler, frame),
            FrameType::RequestChannel => {
                ChannelResponder::accept(&self.core, &self.handler, frame)
            }
            other => {
                tracing::debug!(stream_id, frame_type = ?other, "not a request frame");
            }
        }
    }

    pub fn metadata_push(&self, frame: Frame) {
        if let Some(payload) = frame.payload {
            self.handler.metadata_push(payload);
        }
    }

    fn reject(&self, frame: &Frame, error: WeftError) {
        let stream_id = frame.stream_id;
        let code = error.wire_code();
        self.core.interceptor.on_reject(stream_id, code);
        if frame.frame_type == FrameType::RequestFnf {
            tracing::debug!(stream_id, %error, "fire-and-forget dropped");
            return;
        }
        self.core
            .send_frame(Frame::error(stream_id, code, error.to_string()));
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// Frames a responder driver emits share this error mapping: application
/// failures become APPLICATION_ERROR, protocol violations keep their code.
pub(crate) fn error_frame(stream_id: u32, error: &WeftError) -> Frame {
    let code = match error {
        WeftError::Remote { code, .. } => *code,
        WeftError::Overflow
        | WeftError::FragmentTooSmall { .. }
        | WeftError::ReassemblyTooLarge { .. }
        | WeftError::PayloadTooLarge { .. } => ErrorCode::Invalid,
        WeftError::MissingLease | WeftError::Unsupported(_) => ErrorCode::Rejected,
        WeftError::Cancelled => ErrorCode::Canceled,
        _ => ErrorCode::ApplicationError,
    };
    Frame::error(stream_id, code, error.to_string())
}
