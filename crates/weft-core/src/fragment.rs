//! Outbound fragmentation and inbound reassembly.
//!
//! When an MTU is configured, payloads larger than one frame's budget are
//! split: metadata bytes are packed first, then data, and every fragment
//! except the last carries the FOLLOWS flag. The receiving side accumulates
//! fragments in a [`Reassembler`] until a frame without FOLLOWS closes the
//! payload.
//!
//! Fragmentation is zero-copy: fragments hold [`Bytes`] slices of the
//! original buffers.

use bytes::{Bytes, BytesMut};

use crate::frame::{
    FRAME_HEADER_SIZE, FRAME_LENGTH_FIELD_SIZE, METADATA_LENGTH_SIZE, REQUEST_N_SIZE,
};
use crate::{EngineConfig, Frame, FrameType, Payload, WeftError};

/// Shape of the frame sequence a payload fragments into.
#[derive(Debug, Clone, Copy)]
pub struct FragmentSpec {
    pub stream_id: u32,
    /// Type of the first frame; continuations are NEXT.
    pub frame_type: FrameType,
    /// Initial request-n carried by the first frame, if any.
    pub initial_request_n: Option<u32>,
    /// Whether this payload also completes the stream. The final fragment
    /// becomes NEXT_COMPLETE.
    pub complete: bool,
}

/// Split `payload` into frames that each fit within the configured MTU.
///
/// Always produces at least one frame; a payload that fits yields exactly
/// the frame an unfragmented send would have produced.
pub fn fragment(
    spec: FragmentSpec,
    payload: Payload,
    config: &EngineConfig,
) -> Result<Vec<Frame>, WeftError> {
    let (data, metadata) = payload.into_parts()?;
    let budget = config
        .mtu
        .saturating_sub(FRAME_LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE);

    let mut frames = Vec::new();
    let mut meta_pos = 0;
    let meta = metadata.unwrap_or_else(Bytes::new);
    let mut data_pos = 0;
    let mut first = true;

    loop {
        let mut capacity = budget;
        if first && spec.initial_request_n.is_some() {
            capacity = capacity.saturating_sub(REQUEST_N_SIZE);
        }

        let meta_remaining = meta.len() - meta_pos;
        let meta_take = if meta_remaining > 0 {
            let room = capacity.saturating_sub(METADATA_LENGTH_SIZE);
            capacity = capacity.saturating_sub(METADATA_LENGTH_SIZE);
            room.min(meta_remaining)
        } else {
            0
        };
        capacity -= meta_take;
        let data_take = capacity.min(data.len() - data_pos);

        let frag_meta = (meta_take > 0).then(|| meta.slice(meta_pos..meta_pos + meta_take));
        let frag_data = data.slice(data_pos..data_pos + data_take);
        meta_pos += meta_take;
        data_pos += data_take;

        let last = meta_pos == meta.len() && data_pos == data.len();
        let frag_payload = Payload::from_parts(frag_data, frag_meta);
        let mut frame = if first {
            if spec.frame_type.is_request() {
                Frame::request(spec.stream_id, spec.frame_type, frag_payload, spec.initial_request_n)
            } else if last && spec.complete {
                Frame::next_complete(spec.stream_id, frag_payload)
            } else {
                Frame::next(spec.stream_id, frag_payload)
            }
        } else if last && spec.complete {
            Frame::next_complete(spec.stream_id, frag_payload)
        } else {
            Frame::next(spec.stream_id, frag_payload)
        };
        if !last {
            frame = frame.with_follows();
        }
        frames.push(frame);
        first = false;

        if last {
            return Ok(frames);
        }
    }
}

/// Smallest payload a non-final fragment may carry. A continuation frame
/// costs this much in header overhead, so a fragment delivering fewer
/// bytes than its own framing cannot be making progress and is treated as
/// a protocol violation.
pub const MIN_FRAGMENT_LEN: usize =
    FRAME_HEADER_SIZE + METADATA_LENGTH_SIZE - FRAME_LENGTH_FIELD_SIZE;

/// Accumulates inbound fragments into one payload.
///
/// One reassembler per stream; fragmented payloads cannot interleave on a
/// single stream, so a fresh sequence only starts after the previous one
/// closed.
#[derive(Debug)]
pub struct Reassembler {
    data: BytesMut,
    metadata: Option<BytesMut>,
    limit: usize,
    active: bool,
}

impl Reassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            metadata: None,
            limit,
            active: false,
        }
    }

    /// True while a fragment sequence is open.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Add a fragment. Returns the finished payload when `follows` is
    /// false, `None` while more fragments are expected.
    ///
    /// Errors leave the reassembler reset; the caller terminates the
    /// stream, so partial state must not leak into a later sequence.
    pub fn push(&mut self, payload: Payload, follows: bool) -> Result<Option<Payload>, WeftError> {
        let len = payload.len();
        if follows && len < MIN_FRAGMENT_LEN {
            self.reset();
            return Err(WeftError::FragmentTooSmall {
                len,
                min: MIN_FRAGMENT_LEN,
            });
        }

        let (data, metadata) = payload.into_parts()?;
        let total = self.data.len()
            + self.metadata.as_ref().map_or(0, BytesMut::len)
            + data.len()
            + metadata.as_ref().map_or(0, Bytes::len);
        if total > self.limit {
            self.reset();
            return Err(WeftError::ReassemblyTooLarge {
                len: total,
                max: self.limit,
            });
        }

        if let Some(meta) = metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&meta);
        }
        self.data.extend_from_slice(&data);
        self.active = follows;

        if follows {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.data).freeze();
        let metadata = self.metadata.take().map(BytesMut::freeze);
        Ok(Some(Payload::from_parts(data, metadata)))
    }

    /// Drop any partially accumulated payload.
    ///
    /// Called when the stream terminates mid-sequence; the buffers are
    /// freed now, not when the operator's last handle drops.
    pub fn clear(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.data = BytesMut::new();
        self.metadata = None;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MIN_MTU;

    fn config(mtu: usize) -> EngineConfig {
        EngineConfig {
            mtu,
            ..Default::default()
        }
    }

    fn roundtrip(spec: FragmentSpec, payload: Payload, mtu: usize, expect_frames: usize) {
        let config = config(mtu);
        let original_data = payload.data().unwrap().clone();
        let original_meta = payload.metadata().unwrap().cloned();

        let frames = fragment(spec, payload, &config).unwrap();
        assert_eq!(frames.len(), expect_frames);
        for frame in &frames[..frames.len() - 1] {
            assert!(frame.follows());
            assert!(
                FRAME_LENGTH_FIELD_SIZE + frame.estimated_len() <= mtu,
                "fragment exceeds mtu"
            );
        }
        assert!(!frames.last().unwrap().follows());

        let mut reassembler = Reassembler::new(config.max_inbound_payload_size);
        let mut out = None;
        for frame in frames {
            let follows = frame.follows();
            let result = reassembler.push(frame.payload.unwrap(), follows).unwrap();
            if follows {
                assert!(result.is_none());
            } else {
                out = result;
            }
        }
        let out = out.expect("reassembly did not finish");
        assert_eq!(out.data().unwrap(), &original_data);
        assert_eq!(out.metadata().unwrap().cloned(), original_meta);
    }

    fn spec() -> FragmentSpec {
        FragmentSpec {
            stream_id: 1,
            frame_type: FrameType::Next,
            initial_request_n: None,
            complete: false,
        }
    }

    #[test]
    fn test_roundtrip_one_to_four_fragments_data_only() {
        // Data budget at the minimum MTU is 64 - 3 - 6 = 55 bytes.
        let budget = MIN_MTU - FRAME_LENGTH_FIELD_SIZE - FRAME_HEADER_SIZE;
        for fragments in 1..=4 {
            let len = budget * fragments - 1;
            let payload = Payload::new(Bytes::from(vec![0xAB; len]));
            roundtrip(spec(), payload, MIN_MTU, fragments);
        }
    }

    #[test]
    fn test_roundtrip_with_metadata() {
        for fragments in 1..=4usize {
            let payload = Payload::with_metadata(
                Bytes::from(vec![0xCD; fragments.saturating_sub(1) * 40 + 10]),
                Bytes::from(vec![0xEF; 20]),
            );
            let frames = fragment(spec(), payload, &config(MIN_MTU)).unwrap();
            assert!(!frames.is_empty());
        }
        let payload = Payload::with_metadata(
            Bytes::from(vec![0xCD; 90]),
            Bytes::from(vec![0xEF; 30]),
        );
        roundtrip(spec(), payload, MIN_MTU, 3);
    }

    #[test]
    fn test_metadata_packs_before_data() {
        let payload = Payload::with_metadata(
            Bytes::from(vec![1u8; 100]),
            Bytes::from(vec![2u8; 100]),
        );
        let frames = fragment(spec(), payload, &config(MIN_MTU)).unwrap();
        // The first fragment is all metadata.
        let first = frames[0].payload.as_ref().unwrap();
        assert!(first.has_metadata());
        assert!(first.data().unwrap().is_empty());
    }

    #[test]
    fn test_request_frame_keeps_type_and_request_n() {
        let payload = Payload::new(Bytes::from(vec![7u8; 120]));
        let frames = fragment(
            FragmentSpec {
                stream_id: 3,
                frame_type: FrameType::RequestStream,
                initial_request_n: Some(8),
                complete: false,
            },
            payload,
            &config(MIN_MTU),
        )
        .unwrap();
        assert_eq!(frames[0].frame_type, FrameType::RequestStream);
        assert_eq!(frames[0].request_n, Some(8));
        for frame in &frames[1..] {
            assert_eq!(frame.frame_type, FrameType::Next);
            assert_eq!(frame.request_n, None);
        }
    }

    #[test]
    fn test_completing_payload_ends_with_next_complete() {
        let payload = Payload::new(Bytes::from(vec![7u8; 120]));
        let frames = fragment(
            FragmentSpec {
                complete: true,
                ..spec()
            },
            payload,
            &config(MIN_MTU),
        )
        .unwrap();
        assert!(frames.len() > 1);
        for frame in &frames[..frames.len() - 1] {
            assert_eq!(frame.frame_type, FrameType::Next);
        }
        assert_eq!(frames.last().unwrap().frame_type, FrameType::NextComplete);
    }

    #[test]
    fn test_reassembly_limit() {
        let mut reassembler = Reassembler::new(10);
        let result = reassembler.push(Payload::new(Bytes::from(vec![0u8; 8])), true);
        assert!(result.unwrap().is_none());
        let err = reassembler
            .push(Payload::new(Bytes::from(vec![0u8; 8])), true)
            .unwrap_err();
        assert!(matches!(err, WeftError::ReassemblyTooLarge { len: 16, max: 10 }));
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_undersized_non_final_fragment_rejected() {
        let mut reassembler = Reassembler::new(1024);
        let err = reassembler.push(Payload::empty(), true).unwrap_err();
        assert!(matches!(err, WeftError::FragmentTooSmall { .. }));

        // Nonempty but below the framing-overhead floor is equally bad.
        let mut reassembler = Reassembler::new(1024);
        let err = reassembler
            .push(Payload::new(Bytes::from(vec![0u8; MIN_FRAGMENT_LEN - 1])), true)
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::FragmentTooSmall { min: MIN_FRAGMENT_LEN, .. }
        ));
        // The floor applies only while more fragments follow.
        let mut reassembler = Reassembler::new(1024);
        let out = reassembler
            .push(Payload::new(Bytes::from_static(b"x")), false)
            .unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn test_clear_drops_partial_sequence() {
        let mut reassembler = Reassembler::new(1024);
        assert!(reassembler
            .push(Payload::new(Bytes::from(vec![1u8; 16])), true)
            .unwrap()
            .is_none());
        assert!(reassembler.is_active());

        reassembler.clear();
        assert!(!reassembler.is_active());

        // A later sequence starts from scratch, with no stale prefix.
        let out = reassembler
            .push(Payload::new(Bytes::from_static(b"fresh")), false)
            .unwrap()
            .unwrap();
        assert_eq!(out.data().unwrap(), &Bytes::from_static(b"fresh"));
    }
}
