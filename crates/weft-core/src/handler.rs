//! The application-facing responder seam.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::{InteractionKind, Payload, WeftError};

/// Items flowing through streaming interactions.
pub type PayloadStream = BoxStream<'static, Result<Payload, WeftError>>;

/// Implemented by the application to serve inbound requests.
///
/// Every method has a default: unimplemented interaction kinds are rejected
/// with [`WeftError::Unsupported`], which the responder reports to the peer
/// as a REJECTED error (fire-and-forget and metadata push, having no return
/// channel, are silently dropped).
pub trait RequestHandler: Send + Sync + 'static {
    fn fire_and_forget(&self, payload: Payload) {
        drop(payload);
    }

    fn request_response(
        &self,
        payload: Payload,
    ) -> BoxFuture<'static, Result<Payload, WeftError>> {
        drop(payload);
        Box::pin(async { Err(WeftError::Unsupported(InteractionKind::RequestResponse)) })
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        drop(payload);
        Box::pin(futures_util::stream::once(async {
            Err(WeftError::Unsupported(InteractionKind::RequestStream))
        }))
    }

    /// `inbound` yields the initial payload first, then the peer's
    /// subsequent items.
    fn request_channel(&self, inbound: PayloadStream) -> PayloadStream {
        drop(inbound);
        Box::pin(futures_util::stream::once(async {
            Err(WeftError::Unsupported(InteractionKind::RequestChannel))
        }))
    }

    fn metadata_push(&self, payload: Payload) {
        drop(payload);
    }
}

/// A handler that rejects everything; useful for pure-requester endpoints.
pub struct NoopHandler;

impl RequestHandler for NoopHandler {}
