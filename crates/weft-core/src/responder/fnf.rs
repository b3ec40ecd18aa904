//! Inbound fire-and-forget.
//!
//! Unfragmented requests go straight to the handler. A fragmented request
//! registers briefly so the continuation frames route here, then invokes
//! the handler once the payload closes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fragment::Reassembler;
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::{Frame, FrameType, InteractionKind, Payload, RequestHandler, WeftError};

pub(crate) struct FnfResponder {
    core: Arc<SessionCore>,
    handler: Arc<dyn RequestHandler>,
    stream_id: u32,
    reassembler: Mutex<Reassembler>,
}

impl FnfResponder {
    pub fn accept(core: &Arc<SessionCore>, handler: &Arc<dyn RequestHandler>, frame: Frame) {
        let stream_id = frame.stream_id;
        let Some(payload) = frame.payload else {
            return;
        };
        core.interceptor
            .on_start(stream_id, InteractionKind::FireAndForget);

        if !frame.flags.contains(crate::FrameFlags::FOLLOWS) {
            handler.fire_and_forget(payload);
            core.interceptor.on_complete(stream_id);
            return;
        }

        let responder = Arc::new(Self {
            core: core.clone(),
            handler: handler.clone(),
            stream_id,
            reassembler: Mutex::new(Reassembler::new(core.config.max_inbound_payload_size)),
        });
        match responder.reassembler.lock().push(payload, true) {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => {
                // First fragment cannot close the payload; a bad opener
                // just never registers.
                return;
            }
        }
        core.registry.register(stream_id, responder);
    }

    fn finish(&self, payload: Option<Payload>) {
        self.core.registry.remove(self.stream_id);
        if let Some(payload) = payload {
            self.handler.fire_and_forget(payload);
            self.core.interceptor.on_complete(self.stream_id);
        }
    }
}

impl FrameHandler for FnfResponder {
    fn handle_frame(self: Arc<Self>, frame: Frame) {
        let follows = frame.follows();
        match frame.frame_type {
            FrameType::Next | FrameType::NextComplete => {
                let Some(payload) = frame.payload else {
                    return;
                };
                let result = self.reassembler.lock().push(payload, follows);
                match result {
                    Ok(Some(payload)) => self.finish(Some(payload)),
                    Ok(None) => {}
                    Err(e) => {
                        // No response channel; the malformed request is
                        // simply abandoned.
                        tracing::debug!(stream_id = self.stream_id, error = %e, "fire-and-forget reassembly failed");
                        self.finish(None);
                    }
                }
            }
            FrameType::Cancel => self.finish(None),
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on fire-and-forget");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, _error: WeftError) {}
}
