//! Error codes and error types.

use core::fmt;

use tokio::sync::mpsc;

/// Wire-level error codes carried by ERROR frames.
///
/// Codes in the 0x01xx range are connection-scoped (stream id 0); codes in
/// the 0x02xx range terminate a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Connection-level error; every active stream is torn down.
    ConnectionError = 0x0101,
    /// Orderly connection close requested by the peer.
    ConnectionClose = 0x0102,
    /// The responder's application logic failed.
    ApplicationError = 0x0201,
    /// The responder refused the request (admission control, lease).
    Rejected = 0x0202,
    /// The stream was cancelled.
    Canceled = 0x0203,
    /// The request violated the protocol (overflow, bad fragment, size).
    Invalid = 0x0204,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0101 => Some(Self::ConnectionError),
            0x0102 => Some(Self::ConnectionClose),
            0x0201 => Some(Self::ApplicationError),
            0x0202 => Some(Self::Rejected),
            0x0203 => Some(Self::Canceled),
            0x0204 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// True if an ERROR frame carrying this code on stream 0 kills the
    /// whole connection rather than one stream.
    pub fn is_connection_scoped(self) -> bool {
        matches!(self, Self::ConnectionError | Self::ConnectionClose)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError => write!(f, "connection error"),
            Self::ConnectionClose => write!(f, "connection close"),
            Self::ApplicationError => write!(f, "application error"),
            Self::Rejected => write!(f, "rejected"),
            Self::Canceled => write!(f, "canceled"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Engine errors.
///
/// Variants fall into four families with different blast radius:
///
/// 1. Local validation (`ReleasedPayload`, `PayloadTooLarge`) — rejected
///    before any frame is sent; the caller hears about it, the peer never
///    does.
/// 2. Admission (`MissingLease`, `Unavailable`) — rejected at send time,
///    distinct from validation so callers can retry after a new lease.
/// 3. Per-stream protocol violations (`Overflow`, `FragmentTooSmall`,
///    `ReassemblyTooLarge`) — terminate one stream with an ERROR/CANCEL
///    frame, the connection survives.
/// 4. Connection-fatal (`ConnectionClosed`, connection-scoped `Remote`) —
///    every live stream is faulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// The payload was already consumed or explicitly released.
    ReleasedPayload,
    /// The payload cannot be sent within the configured frame limits.
    PayloadTooLarge { len: usize, max: usize },
    /// No lease permit was available at the moment the frame would be sent.
    MissingLease,
    /// The connection reported zero availability.
    Unavailable,
    /// A second subscriber tried to attach to an operator.
    SingleSubscriberOnly,
    /// A request-channel outbound source completed before producing data.
    EmptySource,
    /// More payloads arrived than were requested.
    Overflow,
    /// A non-final inbound fragment was below the minimum viable size.
    FragmentTooSmall { len: usize, min: usize },
    /// Reassembly would exceed the maximum inbound payload size.
    ReassemblyTooLarge { len: usize, max: usize },
    /// The interaction kind is not implemented by the handler.
    Unsupported(InteractionKind),
    /// The stream was cancelled locally.
    Cancelled,
    /// The underlying connection closed; all streams are faulted.
    ConnectionClosed,
    /// The peer terminated the stream (or connection) with an ERROR frame.
    Remote { code: ErrorCode, message: String },
    /// The engine configuration violates a setup invariant.
    InvalidConfig(String),
}

impl WeftError {
    /// The wire code used when this error is reported to the peer.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::Overflow
            | Self::FragmentTooSmall { .. }
            | Self::ReassemblyTooLarge { .. }
            | Self::PayloadTooLarge { .. } => ErrorCode::Invalid,
            Self::MissingLease | Self::Unavailable | Self::Unsupported(_) => ErrorCode::Rejected,
            Self::Cancelled => ErrorCode::Canceled,
            Self::ConnectionClosed => ErrorCode::ConnectionError,
            Self::Remote { code, .. } => *code,
            _ => ErrorCode::ApplicationError,
        }
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleasedPayload => write!(f, "payload already released"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds maximum frame size {max}")
            }
            Self::MissingLease => write!(f, "missing lease"),
            Self::Unavailable => write!(f, "connection unavailable"),
            Self::SingleSubscriberOnly => write!(f, "only one subscriber allowed"),
            Self::EmptySource => write!(f, "empty source"),
            Self::Overflow => write!(f, "messages received exceeds number requested"),
            Self::FragmentTooSmall { len, min } => {
                write!(f, "fragment is too small: {len} bytes (minimum {min})")
            }
            Self::ReassemblyTooLarge { len, max } => {
                write!(f, "reassembled payload of {len} bytes exceeds maximum {max}")
            }
            Self::Unsupported(kind) => write!(f, "{kind} not supported by handler"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Remote { code, message } => write!(f, "remote error ({code}): {message}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for WeftError {}

/// The four interaction shapes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FireAndForget => write!(f, "fire-and-forget"),
            Self::RequestResponse => write!(f, "request-response"),
            Self::RequestStream => write!(f, "request-stream"),
            Self::RequestChannel => write!(f, "request-channel"),
        }
    }
}

/// Aggregation channel for errors that lose a race to the terminal signal.
///
/// Only one terminal signal may reach a stream's observer. Secondary errors
/// (an inbound ERROR racing a local cancel, a send failure after
/// termination) land here instead of being swallowed. Without an attached
/// receiver they are logged at WARN.
#[derive(Clone, Default)]
pub struct ErrorSink {
    tx: Option<mpsc::UnboundedSender<WeftError>>,
}

impl ErrorSink {
    /// A sink that only logs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sink backed by a channel the application can drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WeftError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Record an error that could not be delivered to its stream observer.
    pub fn dropped(&self, error: WeftError) {
        match &self.tx {
            Some(tx) => {
                if tx.send(error.clone()).is_err() {
                    tracing::warn!(%error, "dropped error (sink receiver gone)");
                }
            }
            None => tracing::warn!(%error, "dropped error"),
        }
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("attached", &self.tx.is_some())
            .finish()
    }
}
