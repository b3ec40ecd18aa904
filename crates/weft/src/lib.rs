//! Bidirectional multiplexed RPC and streaming over one duplex connection.
//!
//! This crate re-exports the engine from `weft-core`. See [`Endpoint`] for
//! the entry point.

pub use weft_core::{
    DuplexConnection, Endpoint, EndpointBuilder, EngineConfig, ErrorCode, ErrorSink,
    FireAndForgetRequester, Frame, FrameError, FrameFlags, FrameType, InputMultiplexer,
    InteractionKind, LeaseGrant, NoopHandler, NoopInterceptor, Payload, PayloadLedger,
    PayloadStream, RequestChannelRequester, Requester, RequestHandler, RequestInterceptor,
    RequestResponseRequester, RequestStreamRequester, ResponseReceiver, Role, StreamReceiver,
    WeftError, MAX_FRAME_LENGTH, MIN_MTU, REQUEST_MAX,
};
