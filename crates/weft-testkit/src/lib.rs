//! Test doubles for exercising the engine without a real transport.
//!
//! [`TestConnection`] captures outbound frames for assertion, or forwards
//! them into a channel so a test can pump them into a peer endpoint's
//! multiplexer, forming a full in-memory wire.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use weft_core::{DuplexConnection, Frame, FrameType};

pub use weft_core::PayloadLedger;

/// An in-memory connection end.
///
/// In recording mode (the default) sent frames pile up for inspection. In
/// channel mode they flow into an [`mpsc`] receiver instead, which a test
/// pumps into the peer with [`pump`].
pub struct TestConnection {
    sent: Mutex<Vec<Frame>>,
    forward: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    availability: Mutex<f64>,
}

impl TestConnection {
    /// A recording connection.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            forward: Mutex::new(None),
            availability: Mutex::new(1.0),
        })
    }

    /// A forwarding connection; the receiver sees every sent frame.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self::new();
        *conn.forward.lock() = Some(tx);
        (conn, rx)
    }

    /// Take every frame recorded so far.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Frame types recorded so far, without consuming the frames.
    pub fn sent_types(&self) -> Vec<FrameType> {
        self.sent.lock().iter().map(|f| f.frame_type).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Override the availability signal; 0.0 simulates a dead transport.
    pub fn set_availability(&self, value: f64) {
        *self.availability.lock() = value;
    }
}

impl DuplexConnection for TestConnection {
    fn send_frame(&self, frame: Frame) {
        let forward = self.forward.lock();
        match forward.as_ref() {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!("test connection peer gone, frame dropped");
                }
            }
            None => {
                drop(forward);
                self.sent.lock().push(frame);
            }
        }
    }

    fn availability(&self) -> f64 {
        *self.availability.lock()
    }
}

/// Pump frames from a connection's outbox into `deliver` (typically the
/// peer multiplexer's `handle_frame`) until the sender side is dropped.
pub async fn pump(mut rx: mpsc::UnboundedReceiver<Frame>, deliver: impl Fn(Frame)) {
    while let Some(frame) = rx.recv().await {
        deliver(frame);
    }
}

/// Drain every frame currently queued into `deliver`, without waiting.
pub fn drain_into(rx: &mut mpsc::UnboundedReceiver<Frame>, deliver: impl Fn(Frame)) {
    while let Ok(frame) = rx.try_recv() {
        deliver(frame);
    }
}
