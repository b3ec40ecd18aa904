//! Request/response: one request frame, at most one payload back.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::fragment::Reassembler;
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::{Frame, FrameType, InteractionKind, Payload, WeftError};

use super::request_spec;

/// The answer delivered to a request/response subscriber: a payload, a bare
/// completion, or an error.
pub type ResponseReceiver = oneshot::Receiver<Result<Option<Payload>, WeftError>>;

/// Starts a request/response interaction.
///
/// `subscribe` sends the request and yields a receiver for the single
/// terminal signal. `cancel` before `subscribe` is a pure no-op on the
/// wire; after it, exactly one CANCEL frame is sent no matter how many
/// callers race.
pub struct RequestResponseRequester {
    inner: Arc<ResponseOperator>,
}

struct ResponseOperator {
    core: Arc<SessionCore>,
    state: crate::StreamState,
    stream_id: AtomicU32,
    request: Mutex<Option<Payload>>,
    waiter: Mutex<Option<oneshot::Sender<Result<Option<Payload>, WeftError>>>>,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    /// Set under the send lock once the request frame is on the wire;
    /// gates CANCEL emission so a racing cancel cannot precede it.
    frame_sent: AtomicBool,
}

impl RequestResponseRequester {
    pub(crate) fn new(core: Arc<SessionCore>, payload: Payload) -> Self {
        let limit = core.config.max_inbound_payload_size;
        Self {
            inner: Arc::new(ResponseOperator {
                core,
                state: crate::StreamState::new(),
                stream_id: AtomicU32::new(0),
                request: Mutex::new(Some(payload)),
                waiter: Mutex::new(None),
                reassembler: Mutex::new(Reassembler::new(limit)),
                send_lock: Mutex::new(()),
                frame_sent: AtomicBool::new(false),
            }),
        }
    }

    /// Send the request. Fails locally (nothing on the wire) on a released
    /// payload, an oversized payload, a missing lease, or a dead transport.
    pub fn subscribe(&self) -> Result<ResponseReceiver, WeftError> {
        let inner = &self.inner;
        inner.state.try_subscribe()?;

        let payload = inner
            .request
            .lock()
            .take()
            .ok_or(WeftError::ReleasedPayload)?;
        if !payload.is_valid() {
            return Err(WeftError::ReleasedPayload);
        }

        // Install the waiter before admission. A cancel racing this call
        // may have already claimed the terminal with no waiter to resolve;
        // the re-check below surfaces it before a lease permit is spent.
        let (tx, rx) = oneshot::channel();
        *inner.waiter.lock() = Some(tx);
        if inner.state.is_terminated() {
            inner.waiter.lock().take();
            return Err(WeftError::Cancelled);
        }

        if let Err(e) = inner.core.check_outbound(&payload, 0) {
            // Leave the operator terminated; a failed subscribe is final.
            inner.state.try_terminate();
            inner.waiter.lock().take();
            return Err(e);
        }
        if let Err(e) = inner.core.admit_outbound() {
            inner.state.try_terminate();
            inner.waiter.lock().take();
            return Err(e);
        }

        let stream_id = inner.core.next_stream_id();
        inner.stream_id.store(stream_id, Ordering::Release);
        // Register before sending so a fast response cannot miss us.
        inner.core.registry.register(stream_id, inner.clone());
        inner.state.mark_first_frame_sent();
        inner
            .core
            .interceptor
            .on_start(stream_id, InteractionKind::RequestResponse);

        {
            let _guard = inner.send_lock.lock();
            // A cancel that won in the meantime suppresses the request
            // frame; its terminal already went through the waiter.
            if inner.state.is_terminated() {
                inner.core.registry.remove(stream_id);
                return Ok(rx);
            }
            if let Err(e) = inner
                .core
                .send_payload(request_spec(stream_id, FrameType::RequestResponse, None), payload)
            {
                drop(_guard);
                inner.finish(Err(e.clone()), false);
                return Err(e);
            }
            inner.frame_sent.store(true, Ordering::Release);
        }
        // A cancel that raced the send may have pulled the registry entry
        // before we inserted it; sweep it out.
        if inner.state.is_terminated() {
            inner.core.registry.remove(stream_id);
        }
        tracing::trace!(stream_id, "request-response sent");
        Ok(rx)
    }

    /// Cancel the interaction. Before `subscribe` nothing reaches the wire;
    /// after it, the winner of the terminal race sends one CANCEL frame.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl ResponseOperator {
    /// Deliver the terminal signal; exactly one caller wins.
    fn finish(&self, result: Result<Option<Payload>, WeftError>, send_cancel: bool) {
        let Some(snapshot) = self.state.try_terminate() else {
            if let Err(e) = result {
                self.core.error_sink.dropped(e);
            }
            return;
        };
        self.reassembler.lock().clear();
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            if send_cancel {
                let _guard = self.send_lock.lock();
                if self.frame_sent.load(Ordering::Acquire) {
                    self.core.send_frame(Frame::cancel(stream_id));
                }
            }
        }
        match &result {
            Ok(_) => self.core.interceptor.on_complete(stream_id),
            Err(WeftError::Cancelled) => self.core.interceptor.on_cancel(stream_id),
            Err(e) => self.core.interceptor.on_error(stream_id, e),
        }
        if let Some(waiter) = self.waiter.lock().take() {
            if let Err(Err(e)) = waiter.send(result) {
                self.core.error_sink.dropped(e);
            }
        }
    }

    fn cancel(&self) {
        self.finish(Err(WeftError::Cancelled), true);
    }

    fn deliver_payload(&self, payload: Payload, follows: bool) {
        let finished = {
            let mut reassembler = self.reassembler.lock();
            if follows || reassembler.is_active() {
                self.state.set_reassembling(follows);
                match reassembler.push(payload, follows) {
                    Ok(done) => done,
                    Err(e) => {
                        drop(reassembler);
                        self.finish(Err(e), true);
                        return;
                    }
                }
            } else {
                Some(payload)
            }
        };
        if let Some(payload) = finished {
            self.finish(Ok(Some(payload)), false);
        }
    }
}

impl FrameHandler for ResponseOperator {
    fn handle_frame(self: Arc<Self>, frame: Frame) {
        match frame.frame_type {
            FrameType::Next | FrameType::NextComplete => {
                if let Some(payload) = frame.payload {
                    self.deliver_payload(payload, frame.flags.contains(crate::FrameFlags::FOLLOWS));
                }
            }
            FrameType::Complete => self.finish(Ok(None), false),
            FrameType::Error => {
                let error = frame
                    .error
                    .map(|e| WeftError::Remote {
                        code: e.code,
                        message: e.message,
                    })
                    .unwrap_or(WeftError::ConnectionClosed);
                self.finish(Err(error), false);
            }
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on request-response stream");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, error: WeftError) {
        self.finish(Err(error), false);
    }
}
