//! The transport seam.

use crate::Frame;

/// One bidirectional frame transport.
///
/// The engine treats the transport as a sink: [`send_frame`] hands over a
/// frame and returns immediately, and delivery failures surface later as a
/// connection close, not as a per-call error. Inbound frames travel the
/// other way, from the transport's read loop into
/// [`InputMultiplexer::handle_frame`].
///
/// [`send_frame`]: DuplexConnection::send_frame
/// [`InputMultiplexer::handle_frame`]: crate::InputMultiplexer::handle_frame
pub trait DuplexConnection: Send + Sync + 'static {
    /// Hand one outbound frame to the transport.
    ///
    /// Must not block; implementations queue or write asynchronously. Frame
    /// order within one call site is the wire order.
    fn send_frame(&self, frame: Frame);

    /// Transport health as a 0.0..=1.0 signal; 0.0 means closed.
    fn availability(&self) -> f64 {
        1.0
    }
}
