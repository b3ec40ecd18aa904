//! Request/stream: one request frame, a flow-controlled stream back.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::fragment::Reassembler;
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::state::{RequestOutcome, REQUEST_MAX};
use crate::{Frame, FrameType, InteractionKind, Payload, WeftError};

use super::request_spec;

/// Items delivered to a stream subscriber. The channel closing without an
/// error is the completion signal.
pub type StreamReceiver = mpsc::UnboundedReceiver<Result<Payload, WeftError>>;

/// Starts a request/stream interaction.
///
/// `subscribe` attaches the single subscriber without sending anything;
/// traffic starts with the first `request`. Demand recorded before the
/// first frame wins its claim rides the opening frame; every later
/// increment becomes exactly one REQUEST_N.
pub struct RequestStreamRequester {
    inner: Arc<StreamOperator>,
}

struct StreamOperator {
    core: Arc<SessionCore>,
    state: crate::StreamState,
    stream_id: AtomicU32,
    request: Mutex<Option<Payload>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Result<Payload, WeftError>>>>,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    /// Set under the send lock once the request frame is on the wire.
    frame_sent: AtomicBool,
    /// Demand that lost the claim race before the opening frame went out;
    /// folded into the opening frame's request-n under the send lock.
    pending_n: AtomicU32,
}

impl RequestStreamRequester {
    pub(crate) fn new(core: Arc<SessionCore>, payload: Payload) -> Self {
        let limit = core.config.max_inbound_payload_size;
        Self {
            inner: Arc::new(StreamOperator {
                core,
                state: crate::StreamState::new(),
                stream_id: AtomicU32::new(0),
                request: Mutex::new(Some(payload)),
                subscriber: Mutex::new(None),
                reassembler: Mutex::new(Reassembler::new(limit)),
                send_lock: Mutex::new(()),
                frame_sent: AtomicBool::new(false),
                pending_n: AtomicU32::new(0),
            }),
        }
    }

    /// Attach the subscriber. Sends no frames; the stream opens on the
    /// first `request`.
    pub fn subscribe(&self) -> Result<StreamReceiver, WeftError> {
        self.inner.state.try_subscribe()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.subscriber.lock() = Some(tx);
        // A cancel that landed between the claim and the install found no
        // sender to drop; close the channel ourselves.
        if self.inner.state.is_terminated() {
            self.inner.subscriber.lock().take();
        }
        Ok(rx)
    }

    /// Signal demand for `n` more items.
    ///
    /// The first effective call sends the request frame carrying all
    /// demand accumulated so far; later calls send one REQUEST_N each.
    /// Failures surface through the subscriber channel.
    pub fn request(&self, n: u32) {
        let inner = &self.inner;
        match inner.state.request(n) {
            RequestOutcome::SendInitial(total) => inner.open_stream(total),
            RequestOutcome::SendRequestN(n) => {
                let _guard = inner.send_lock.lock();
                if inner.frame_sent.load(Ordering::Acquire) {
                    let stream_id = inner.stream_id.load(Ordering::Acquire);
                    inner.core.send_frame(Frame::request_n(stream_id, n));
                } else {
                    // The claimer has not emitted the opening frame yet; a
                    // REQUEST_N now would precede it on the wire. Park the
                    // demand for the claimer to fold into the opening frame.
                    let _ = inner.pending_n.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |v| Some(v.saturating_add(n)),
                    );
                }
            }
            RequestOutcome::Buffered | RequestOutcome::Terminated => {}
        }
    }

    /// Cancel the stream; exactly one CANCEL frame if the request frame
    /// already went out, nothing otherwise.
    pub fn cancel(&self) {
        self.inner.cancel_local();
    }
}

impl StreamOperator {
    fn open_stream(self: &Arc<Self>, initial_n: u32) {
        let Some(payload) = self.request.lock().take() else {
            self.finish(Err(WeftError::ReleasedPayload), false);
            return;
        };
        if let Err(e) = self.core.check_outbound(&payload, crate::frame::REQUEST_N_SIZE) {
            self.finish(Err(e), false);
            return;
        }
        if let Err(e) = self.core.admit_outbound() {
            self.finish(Err(e), false);
            return;
        }

        let stream_id = self.core.next_stream_id();
        self.stream_id.store(stream_id, Ordering::Release);
        self.core.registry.register(stream_id, self.clone());
        self.core
            .interceptor
            .on_start(stream_id, InteractionKind::RequestStream);

        {
            let _guard = self.send_lock.lock();
            // A cancel that won in the meantime suppresses the opening
            // frame; the peer never learns the stream existed.
            if self.state.is_terminated() {
                self.core.registry.remove(stream_id);
                return;
            }
            // Demand parked by racing `request` calls rides the opening
            // frame instead of a premature REQUEST_N.
            let initial_n = initial_n
                .saturating_add(self.pending_n.swap(0, Ordering::AcqRel))
                .min(REQUEST_MAX);
            match self.core.send_payload(
                request_spec(stream_id, FrameType::RequestStream, Some(initial_n)),
                payload,
            ) {
                Ok(()) => self.frame_sent.store(true, Ordering::Release),
                Err(e) => {
                    drop(_guard);
                    self.finish(Err(e), false);
                    return;
                }
            }
        }
        // Sweep the registry if a cancel raced the registration.
        if self.state.is_terminated() {
            self.core.registry.remove(stream_id);
        }
    }

    /// Terminate and deliver the one terminal signal.
    ///
    /// `Ok(())` closes the channel (completion); an error is sent before
    /// closing. `send_cancel` emits a CANCEL when this side gives up on a
    /// live stream.
    fn finish(&self, result: Result<(), WeftError>, send_cancel: bool) {
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
                self.send_cancel_frame(stream_id);
            }
        }
        match &result {
            Ok(()) => self.core.interceptor.on_complete(stream_id),
            Err(WeftError::Cancelled) => self.core.interceptor.on_cancel(stream_id),
            Err(e) => self.core.interceptor.on_error(stream_id, e),
        }
        let subscriber = self.subscriber.lock().take();
        if let (Some(tx), Err(e)) = (subscriber, result) {
            // Channel closure after this send is the terminal boundary.
            let _ = tx.send(Err(e));
        }
    }

    fn cancel_local(&self) {
        // A voluntary cancel delivers no signal; dropping the sender closes
        // the subscriber channel.
        let Some(snapshot) = self.state.try_terminate() else {
            return;
        };
        self.reassembler.lock().clear();
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            self.send_cancel_frame(stream_id);
        }
        self.core.interceptor.on_cancel(stream_id);
        self.subscriber.lock().take();
    }

    /// Emit CANCEL only after the request frame is truly on the wire, and
    /// never reordered ahead of it.
    fn send_cancel_frame(&self, stream_id: u32) {
        let _guard = self.send_lock.lock();
        if self.frame_sent.load(Ordering::Acquire) {
            self.core.send_frame(Frame::cancel(stream_id));
        }
    }

    fn deliver(&self, payload: Payload, follows: bool, complete: bool) {
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
        let Some(payload) = finished else {
            return;
        };
        if let Err(e) = self.state.consume_demand() {
            // More payloads than requested; tear the stream down.
            self.finish(Err(e), true);
            return;
        }
        if let Some(tx) = self.subscriber.lock().as_ref() {
            let _ = tx.send(Ok(payload));
        }
        if complete {
            self.finish(Ok(()), false);
        }
    }
}

impl FrameHandler for StreamOperator {
    fn handle_frame(self: Arc<Self>, frame: Frame) {
        let follows = frame.follows();
        match frame.frame_type {
            FrameType::Next => {
                if let Some(payload) = frame.payload {
                    self.deliver(payload, follows, false);
                }
            }
            FrameType::NextComplete => {
                if let Some(payload) = frame.payload {
                    self.deliver(payload, follows, !follows);
                }
            }
            FrameType::Complete => self.finish(Ok(()), false),
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
                tracing::debug!(frame_type = ?other, "unexpected frame on request-stream");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, error: WeftError) {
        self.finish(Err(error), false);
    }
}
