//! Requester-side operators: one per started interaction.

mod channel;
mod fnf;
mod response;
mod stream;

pub use channel::RequestChannelRequester;
pub use fnf::FireAndForgetRequester;
pub use response::{RequestResponseRequester, ResponseReceiver};
pub use stream::{RequestStreamRequester, StreamReceiver};

use std::sync::Arc;

use crate::fragment::FragmentSpec;
use crate::handler::PayloadStream;
use crate::session::SessionCore;
use crate::{Frame, FrameType, Payload, WeftError};

/// The requester face of a session: starts outbound interactions.
#[derive(Clone)]
pub struct Requester {
    core: Arc<SessionCore>,
}

impl Requester {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub fn fire_and_forget(&self, payload: Payload) -> FireAndForgetRequester {
        FireAndForgetRequester::new(self.core.clone(), payload)
    }

    pub fn request_response(&self, payload: Payload) -> RequestResponseRequester {
        RequestResponseRequester::new(self.core.clone(), payload)
    }

    pub fn request_stream(&self, payload: Payload) -> RequestStreamRequester {
        RequestStreamRequester::new(self.core.clone(), payload)
    }

    /// `outbound` supplies this side's items; its first item rides the
    /// opening frame.
    pub fn request_channel(&self, outbound: PayloadStream) -> RequestChannelRequester {
        RequestChannelRequester::new(self.core.clone(), outbound)
    }

    /// Push connection-scoped metadata. Not lease-gated and not part of any
    /// stream.
    pub fn metadata_push(&self, payload: Payload) -> Result<(), WeftError> {
        self.core.check_outbound(&payload, 0)?;
        if self.core.connection.availability() <= 0.0 {
            return Err(WeftError::Unavailable);
        }
        self.core.send_frame(Frame::metadata_push(payload));
        Ok(())
    }

    /// Combined transport and lease availability, 0.0..=1.0.
    pub fn availability(&self) -> f64 {
        self.core.availability()
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("availability", &self.availability())
            .finish()
    }
}

/// Frame-shape helper shared by the operators.
fn request_spec(stream_id: u32, frame_type: FrameType, request_n: Option<u32>) -> FragmentSpec {
    FragmentSpec {
        stream_id,
        frame_type,
        initial_request_n: request_n,
        complete: false,
    }
}
