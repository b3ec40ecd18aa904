//! The in-memory frame value exchanged with the transport layer.
//!
//! The codec (byte layout, length prefixes) lives outside this crate; the
//! engine hands [`Frame`] values to [`DuplexConnection::send_frame`] and
//! receives them from the network-delivery context.
//!
//! [`DuplexConnection::send_frame`]: crate::DuplexConnection::send_frame

use std::time::Duration;

use crate::{ErrorCode, FrameFlags, FrameType, Payload};

/// Size of the length prefix the codec adds per frame.
pub const FRAME_LENGTH_FIELD_SIZE: usize = 3;
/// Size of the frame header (stream id + type/flags).
pub const FRAME_HEADER_SIZE: usize = 6;
/// Size of the metadata length prefix when metadata is present.
pub const METADATA_LENGTH_SIZE: usize = 3;
/// Size of the initial-request-n field on REQUEST_STREAM/REQUEST_CHANNEL.
pub const REQUEST_N_SIZE: usize = 4;
/// Largest frame the protocol can represent (24-bit length).
pub const MAX_FRAME_LENGTH: usize = (1 << 24) - 1;
/// Smallest MTU fragmentation may be configured with.
pub const MIN_MTU: usize = 64;
/// Mask for valid stream ids (31 bits).
pub const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// A lease grant carried by a LEASE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub permits: u32,
    pub ttl: Duration,
}

/// The error content of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub code: ErrorCode,
    pub message: String,
}

/// One protocol frame, pre-codec.
#[derive(Debug)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub request_n: Option<u32>,
    pub payload: Option<Payload>,
    pub error: Option<FrameError>,
    pub lease: Option<LeaseGrant>,
}

impl Frame {
    fn base(stream_id: u32, frame_type: FrameType) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::empty(),
            request_n: None,
            payload: None,
            error: None,
            lease: None,
        }
    }

    /// First frame of a new stream (or a fire-and-forget).
    pub fn request(
        stream_id: u32,
        frame_type: FrameType,
        payload: Payload,
        request_n: Option<u32>,
    ) -> Self {
        debug_assert!(frame_type.is_request());
        let mut frame = Self::base(stream_id, frame_type);
        frame.payload = Some(payload);
        frame.request_n = request_n;
        frame
    }

    pub fn next(stream_id: u32, payload: Payload) -> Self {
        let mut frame = Self::base(stream_id, FrameType::Next);
        frame.payload = Some(payload);
        frame
    }

    pub fn next_complete(stream_id: u32, payload: Payload) -> Self {
        let mut frame = Self::base(stream_id, FrameType::NextComplete);
        frame.payload = Some(payload);
        frame
    }

    pub fn complete(stream_id: u32) -> Self {
        Self::base(stream_id, FrameType::Complete)
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::base(stream_id, FrameType::Cancel)
    }

    pub fn request_n(stream_id: u32, n: u32) -> Self {
        let mut frame = Self::base(stream_id, FrameType::RequestN);
        frame.request_n = Some(n);
        frame
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut frame = Self::base(stream_id, FrameType::Error);
        frame.error = Some(FrameError {
            code,
            message: message.into(),
        });
        frame
    }

    pub fn lease(permits: u32, ttl: Duration) -> Self {
        let mut frame = Self::base(0, FrameType::Lease);
        frame.lease = Some(LeaseGrant { permits, ttl });
        frame
    }

    pub fn metadata_push(payload: Payload) -> Self {
        let mut frame = Self::base(0, FrameType::MetadataPush);
        frame.payload = Some(payload);
        frame
    }

    /// True if more fragments of this payload follow.
    pub fn follows(&self) -> bool {
        self.flags.contains(FrameFlags::FOLLOWS)
    }

    pub fn with_follows(mut self) -> Self {
        self.flags |= FrameFlags::FOLLOWS;
        self
    }

    /// Encoded size estimate: header plus type-specific fields plus payload
    /// bytes. Used for frame-length validation and fragmentation decisions.
    pub fn estimated_len(&self) -> usize {
        let mut len = FRAME_HEADER_SIZE;
        if self.request_n.is_some() {
            len += REQUEST_N_SIZE;
        }
        if let Some(payload) = &self.payload {
            if payload.has_metadata() {
                len += METADATA_LENGTH_SIZE;
            }
            len += payload.len();
        }
        if let Some(error) = &self.error {
            len += 4 + error.message.len();
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_request_frame_shape() {
        let frame = Frame::request(
            1,
            FrameType::RequestStream,
            Payload::new(Bytes::from_static(b"hello")),
            Some(16),
        );
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.frame_type, FrameType::RequestStream);
        assert_eq!(frame.request_n, Some(16));
        assert!(!frame.follows());
        assert_eq!(
            frame.estimated_len(),
            FRAME_HEADER_SIZE + REQUEST_N_SIZE + 5
        );
    }

    #[test]
    fn test_metadata_adds_length_prefix() {
        let plain = Frame::next(3, Payload::new(Bytes::from_static(b"abcd")));
        let tagged = Frame::next(
            3,
            Payload::with_metadata(Bytes::from_static(b"abcd"), Bytes::from_static(b"m")),
        );
        assert_eq!(
            tagged.estimated_len(),
            plain.estimated_len() + METADATA_LENGTH_SIZE + 1
        );
    }

    #[test]
    fn test_error_frame() {
        let frame = Frame::error(7, ErrorCode::Rejected, "missing lease");
        let err = frame.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::Rejected);
        assert_eq!(err.message, "missing lease");
        assert!(frame.payload.is_none());
    }
}
