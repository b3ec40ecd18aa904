//! Engine configuration and size validation.

use crate::frame::{FRAME_HEADER_SIZE, FRAME_LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH, MIN_MTU};
use crate::{Frame, WeftError};

/// Size limits and fragmentation settings for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbound fragmentation MTU in bytes; 0 disables fragmentation.
    pub mtu: usize,
    /// Largest single frame allowed on the wire, length prefix included.
    pub max_frame_length: usize,
    /// Largest payload that may be reassembled from inbound fragments.
    pub max_inbound_payload_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 0,
            max_frame_length: MAX_FRAME_LENGTH,
            max_inbound_payload_size: MAX_FRAME_LENGTH,
        }
    }
}

impl EngineConfig {
    /// Check the configured limits against each other.
    ///
    /// Ordering invariant: MTU <= max frame length <= max inbound payload
    /// size <= 2^24 - 1. Violations fail fast at setup instead of producing
    /// unsendable frames later.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.mtu != 0 && self.mtu < MIN_MTU {
            return Err(WeftError::InvalidConfig(format!(
                "mtu {} is below the minimum of {MIN_MTU}",
                self.mtu
            )));
        }
        if self.mtu > self.max_frame_length {
            return Err(WeftError::InvalidConfig(format!(
                "mtu {} exceeds max frame length {}",
                self.mtu, self.max_frame_length
            )));
        }
        if self.max_frame_length > self.max_inbound_payload_size {
            return Err(WeftError::InvalidConfig(format!(
                "max frame length {} exceeds max inbound payload size {}",
                self.max_frame_length, self.max_inbound_payload_size
            )));
        }
        if self.max_inbound_payload_size > MAX_FRAME_LENGTH {
            return Err(WeftError::InvalidConfig(format!(
                "max inbound payload size {} exceeds protocol limit {MAX_FRAME_LENGTH}",
                self.max_inbound_payload_size
            )));
        }
        Ok(())
    }

    /// True when fragmentation is enabled.
    pub fn fragmentation_enabled(&self) -> bool {
        self.mtu != 0
    }

    /// Check an outbound frame against the frame-length limit.
    ///
    /// Only applies when fragmentation is off; with an MTU set, oversized
    /// payloads are split instead of rejected.
    pub fn check_frame(&self, frame: &Frame) -> Result<(), WeftError> {
        let len = FRAME_LENGTH_FIELD_SIZE + frame.estimated_len();
        if len > self.max_frame_length {
            return Err(WeftError::PayloadTooLarge {
                len,
                max: self.max_frame_length,
            });
        }
        Ok(())
    }

    /// Check an inbound single-frame payload against the inbound limit.
    pub fn check_inbound_payload(&self, len: usize) -> Result<(), WeftError> {
        if len > self.max_inbound_payload_size {
            return Err(WeftError::ReassemblyTooLarge {
                len,
                max: self.max_inbound_payload_size,
            });
        }
        Ok(())
    }

    /// Payload bytes that fit in one fragment after header overhead.
    pub fn fragment_data_budget(&self) -> usize {
        self.mtu.saturating_sub(FRAME_LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE)
    }
}
