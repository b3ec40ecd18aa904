//! Shared per-connection state.

use std::sync::Arc;

use crate::fragment::{fragment, FragmentSpec};
use crate::lease::{RequesterLeaseTracker, ResponderLeaseTracker};
use crate::{
    DuplexConnection, EngineConfig, ErrorSink, Frame, Payload, RequestInterceptor,
    StreamIdAllocator, StreamRegistry, WeftError,
};

/// Everything one connection's operators share: the transport, the live
/// stream registry, id allocation, size limits, leasing, and the spawn
/// handle for responder work.
///
/// Cloned by `Arc`; one per connection.
pub(crate) struct SessionCore {
    pub connection: Arc<dyn DuplexConnection>,
    pub registry: StreamRegistry,
    pub allocator: StreamIdAllocator,
    pub config: EngineConfig,
    pub interceptor: Arc<dyn RequestInterceptor>,
    pub error_sink: ErrorSink,
    /// Present when leasing is enabled.
    pub requester_lease: Option<RequesterLeaseTracker>,
    pub responder_lease: Option<ResponderLeaseTracker>,
    pub runtime: tokio::runtime::Handle,
}

impl SessionCore {
    /// Combined availability: the lower of transport health and the lease
    /// gate (1.0 while an unexpired lease with permits is held, else 0.0).
    pub fn availability(&self) -> f64 {
        let transport = self.connection.availability();
        match &self.requester_lease {
            Some(lease) => transport.min(lease.availability()),
            None => transport,
        }
    }

    /// Allocate a stream id not colliding with any live stream.
    pub fn next_stream_id(&self) -> u32 {
        self.allocator.next(|id| self.registry.contains(id))
    }

    /// Admission for one outbound request: transport up, permit available.
    ///
    /// The permit is spent here, at send time, so queued-then-stale
    /// requests fail the same way fresh ones do.
    pub fn admit_outbound(&self) -> Result<(), WeftError> {
        if self.connection.availability() <= 0.0 {
            return Err(WeftError::Unavailable);
        }
        if let Some(lease) = &self.requester_lease {
            lease.use_permit()?;
        }
        Ok(())
    }

    /// Validate an outbound payload against the frame limits.
    ///
    /// With fragmentation on, any payload up to the reassembly ceiling is
    /// sendable; without it, the payload must fit one frame.
    pub fn check_outbound(&self, payload: &Payload, overhead: usize) -> Result<(), WeftError> {
        let len = payload.len() + overhead;
        if self.config.fragmentation_enabled() {
            if payload.len() > self.config.max_inbound_payload_size {
                return Err(WeftError::PayloadTooLarge {
                    len: payload.len(),
                    max: self.config.max_inbound_payload_size,
                });
            }
            return Ok(());
        }
        if len > self.config.max_frame_length {
            return Err(WeftError::PayloadTooLarge {
                len,
                max: self.config.max_frame_length,
            });
        }
        Ok(())
    }

    /// Emit one payload as a frame, fragmenting when the MTU requires it.
    ///
    /// Callers serialize per stream with their own send lock; fragments of
    /// one payload must not interleave with other frames on the stream.
    pub fn send_payload(&self, spec: FragmentSpec, payload: Payload) -> Result<(), WeftError> {
        let mut overhead =
            crate::frame::FRAME_LENGTH_FIELD_SIZE + crate::frame::FRAME_HEADER_SIZE;
        if spec.initial_request_n.is_some() {
            overhead += crate::frame::REQUEST_N_SIZE;
        }
        if payload.has_metadata() {
            overhead += crate::frame::METADATA_LENGTH_SIZE;
        }
        let needs_split =
            self.config.fragmentation_enabled() && overhead + payload.len() > self.config.mtu;
        if needs_split {
            for frame in fragment(spec, payload, &self.config)? {
                self.connection.send_frame(frame);
            }
            return Ok(());
        }
        let frame = if spec.frame_type.is_request() {
            Frame::request(spec.stream_id, spec.frame_type, payload, spec.initial_request_n)
        } else if spec.complete {
            Frame::next_complete(spec.stream_id, payload)
        } else {
            Frame::next(spec.stream_id, payload)
        };
        self.config.check_frame(&frame)?;
        self.connection.send_frame(frame);
        Ok(())
    }

    pub fn send_frame(&self, frame: Frame) {
        self.connection.send_frame(frame);
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("live_streams", &self.registry.len())
            .field("leasing", &self.requester_lease.is_some())
            .finish()
    }
}
