//! Core protocol engine: multiplexed, flow-controlled request streams over
//! a single duplex connection.
//!
//! The engine is transport- and codec-agnostic. A transport implements
//! [`DuplexConnection`] for the outbound half and feeds decoded frames
//! into [`InputMultiplexer::handle_frame`] for the inbound half; the
//! engine handles everything between those seams: stream id allocation,
//! the four interaction shapes, REQUEST_N flow control, fragmentation and
//! reassembly, lease admission, and teardown.
//!
//! Build an [`Endpoint`] per connection:
//!
//! ```ignore
//! let endpoint = Endpoint::builder(Role::Client, connection)
//!     .handler(Arc::new(MyHandler))
//!     .build()?;
//! let response = endpoint.requester().request_response(payload).subscribe()?;
//! ```

mod connection;
mod credits;
mod endpoint;
mod error;
mod flags;
mod fragment;
mod frame;
mod handler;
mod interceptor;
mod lease;
mod multiplexer;
mod payload;
mod registry;
mod requester;
mod responder;
mod session;
mod state;
mod stream_id;
mod validation;

pub use connection::DuplexConnection;
pub use endpoint::{Endpoint, EndpointBuilder, Role};
pub use error::{ErrorCode, ErrorSink, InteractionKind, WeftError};
pub use flags::{FrameFlags, FrameType};
pub use fragment::{fragment, FragmentSpec, Reassembler};
pub use frame::{
    Frame, FrameError, LeaseGrant, FRAME_HEADER_SIZE, FRAME_LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH,
    METADATA_LENGTH_SIZE, MIN_MTU, REQUEST_N_SIZE, STREAM_ID_MASK,
};
pub use handler::{NoopHandler, PayloadStream, RequestHandler};
pub use interceptor::{NoopInterceptor, RequestInterceptor};
pub use multiplexer::InputMultiplexer;
pub use payload::{Payload, PayloadLedger};
pub use registry::{FrameHandler, StreamRegistry};
pub use requester::{
    FireAndForgetRequester, RequestChannelRequester, Requester, RequestResponseRequester,
    RequestStreamRequester, ResponseReceiver, StreamReceiver,
};
pub use state::{HalfCloseOutcome, RequestOutcome, StreamState, REQUEST_MAX};
pub use stream_id::StreamIdAllocator;
pub use validation::EngineConfig;
