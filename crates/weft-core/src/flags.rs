//! Frame type tags and flags.

use bitflags::bitflags;

/// Frame type tags consumed and produced by the engine.
///
/// The byte layout of frames is the codec's concern; the engine only sees
/// these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    RequestFnf = 0x05,
    RequestResponse = 0x04,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    /// A payload item on an active stream.
    Next = 0x0A,
    /// A payload item that also completes the stream.
    NextComplete = 0x0B,
    /// Completion without a payload.
    Complete = 0x0C,
    Error = 0x0D,
    Lease = 0x02,
    MetadataPush = 0x0E,
}

impl FrameType {
    /// True for the four frame types that open a new stream.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestFnf | Self::RequestResponse | Self::RequestStream | Self::RequestChannel
        )
    }

    /// True for frame types that may carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            Self::RequestFnf
                | Self::RequestResponse
                | Self::RequestStream
                | Self::RequestChannel
                | Self::Next
                | Self::NextComplete
                | Self::MetadataPush
        )
    }
}

bitflags! {
    /// Flags carried by each frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u16 {
        /// More fragments of this payload follow.
        const FOLLOWS = 0b0000_0001;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_types() {
        assert!(FrameType::RequestFnf.is_request());
        assert!(FrameType::RequestChannel.is_request());
        assert!(!FrameType::Next.is_request());
        assert!(!FrameType::Cancel.is_request());
    }

    #[test]
    fn test_payload_carriers() {
        assert!(FrameType::Next.carries_payload());
        assert!(FrameType::NextComplete.carries_payload());
        assert!(!FrameType::Complete.carries_payload());
        assert!(!FrameType::RequestN.carries_payload());
    }
}
