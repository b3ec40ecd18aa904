//! Inbound frame routing.
//!
//! The transport's read loop feeds every decoded frame to
//! [`InputMultiplexer::handle_frame`]. Stream 0 carries connection-scoped
//! frames; everything else is routed to the live stream's operator or, for
//! REQUEST_* frames, to the responder.

use std::sync::Arc;

use crate::responder::Responder;
use crate::session::SessionCore;
use crate::{Frame, FrameType, RequestHandler, WeftError};

pub struct InputMultiplexer {
    core: Arc<SessionCore>,
    responder: Responder,
}

impl InputMultiplexer {
    pub(crate) fn new(core: Arc<SessionCore>, handler: Arc<dyn RequestHandler>) -> Self {
        let responder = Responder::new(core.clone(), handler);
        Self { core, responder }
    }

    /// Route one inbound frame. Never blocks; unroutable frames are
    /// dropped, releasing their payloads.
    pub fn handle_frame(&self, frame: Frame) {
        if frame.stream_id == 0 {
            self.handle_connection_frame(frame);
            return;
        }

        let stream_id = frame.stream_id;
        if let Some(handler) = self.core.registry.get(stream_id) {
            handler.handle_frame(frame);
            return;
        }
        if frame.frame_type.is_request() {
            self.responder.accept(frame);
            return;
        }
        // A frame for one of our own finished streams is a benign
        // straggler; anything else is noise worth logging.
        if self.core.allocator.is_before_or_current(stream_id) {
            tracing::trace!(stream_id, frame_type = ?frame.frame_type, "late frame for finished stream");
        } else {
            tracing::debug!(stream_id, frame_type = ?frame.frame_type, "frame for unknown stream dropped");
        }
    }

    fn handle_connection_frame(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Lease => {
                let Some(grant) = frame.lease else {
                    return;
                };
                if let Some(lease) = &self.core.requester_lease {
                    lease.grant(grant);
                    tracing::debug!(permits = grant.permits, ttl_ms = grant.ttl.as_millis() as u64, "lease received");
                } else {
                    tracing::debug!("lease frame ignored, leasing disabled");
                }
            }
            FrameType::Error => {
                let Some(error) = frame.error else {
                    return;
                };
                if error.code.is_connection_scoped() {
                    tracing::warn!(code = %error.code, message = %error.message, "connection terminated by peer");
                    self.fault_all(WeftError::Remote {
                        code: error.code,
                        message: error.message,
                    });
                } else {
                    tracing::debug!(code = %error.code, "stream-scoped error on stream 0 dropped");
                }
            }
            FrameType::MetadataPush => self.responder.metadata_push(frame),
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on stream 0");
            }
        }
    }

    /// The transport closed underneath us; fault every live stream.
    pub fn connection_closed(&self) {
        self.fault_all(WeftError::ConnectionClosed);
    }

    fn fault_all(&self, error: WeftError) {
        let streams = self.core.registry.drain();
        if !streams.is_empty() {
            tracing::debug!(count = streams.len(), "faulting live streams");
        }
        for (_, handler) in streams {
            handler.connection_terminated(error.clone());
        }
    }
}

impl std::fmt::Debug for InputMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMultiplexer")
            .field("live_streams", &self.core.registry.len())
            .finish()
    }
}
