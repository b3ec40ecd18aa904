//! Request/channel: flow-controlled streams in both directions.
//!
//! The outbound source's first item rides the opening frame. A driver task
//! pulls the rest of the source as peer credit (REQUEST_N) arrives. The
//! two directions terminate independently: our COMPLETE closes outbound,
//! the peer's COMPLETE closes inbound, and the stream fully ends when both
//! are closed or on any error or cancel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::credits::Credits;
use crate::fragment::Reassembler;
use crate::handler::PayloadStream;
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::state::{HalfCloseOutcome, RequestOutcome};
use crate::{Frame, FrameType, InteractionKind, Payload, WeftError};

use super::request_spec;

use super::stream::StreamReceiver;

/// Starts a request/channel interaction.
pub struct RequestChannelRequester {
    inner: Arc<ChannelOperator>,
}

struct ChannelOperator {
    core: Arc<SessionCore>,
    state: crate::StreamState,
    stream_id: AtomicU32,
    outbound: Mutex<Option<PayloadStream>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Result<Payload, WeftError>>>>,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    /// Set under the send lock once the opening frame is on the wire.
    frame_sent: AtomicBool,
    /// Demand that lost the claim race before the opening frame went out;
    /// folded into the opening frame's request-n under the send lock.
    pending_n: AtomicU32,
    /// Outbound credit granted by the peer's REQUEST_N frames.
    credits: Credits,
    driver_started: AtomicBool,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RequestChannelRequester {
    pub(crate) fn new(core: Arc<SessionCore>, outbound: PayloadStream) -> Self {
        let limit = core.config.max_inbound_payload_size;
        Self {
            inner: Arc::new(ChannelOperator {
                core,
                state: crate::StreamState::new(),
                stream_id: AtomicU32::new(0),
                outbound: Mutex::new(Some(outbound)),
                subscriber: Mutex::new(None),
                reassembler: Mutex::new(Reassembler::new(limit)),
                send_lock: Mutex::new(()),
                frame_sent: AtomicBool::new(false),
                pending_n: AtomicU32::new(0),
                credits: Credits::new(0),
                driver_started: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Attach the subscriber for the peer's items. Sends nothing.
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

    /// Signal demand for `n` of the peer's items.
    ///
    /// The first effective call starts the driver task, which pulls the
    /// first outbound item and opens the stream with all demand
    /// accumulated by then. Later calls send one REQUEST_N each.
    pub fn request(&self, n: u32) {
        let inner = &self.inner;
        match inner.state.add_demand(n) {
            RequestOutcome::SendRequestN(n) => {
                let _guard = inner.send_lock.lock();
                if inner.frame_sent.load(Ordering::Acquire) {
                    let stream_id = inner.stream_id.load(Ordering::Acquire);
                    inner.core.send_frame(Frame::request_n(stream_id, n));
                } else {
                    // The driver has not emitted the opening frame yet; a
                    // REQUEST_N now would precede it on the wire. Park the
                    // demand for the driver to fold into the opening frame.
                    let _ = inner.pending_n.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |v| Some(v.saturating_add(n)),
                    );
                }
            }
            RequestOutcome::Buffered => {
                if !inner.driver_started.swap(true, Ordering::AcqRel) {
                    let operator = inner.clone();
                    let handle = inner.core.runtime.spawn(async move {
                        operator.drive_outbound().await;
                    });
                    *inner.driver.lock() = Some(handle);
                }
            }
            RequestOutcome::SendInitial(_) | RequestOutcome::Terminated => {}
        }
    }

    /// Cancel the whole channel, both directions.
    pub fn cancel(&self) {
        self.inner.cancel_local();
    }
}

impl ChannelOperator {
    /// The outbound driver: opens the stream with the source's first item,
    /// then sends one NEXT per unit of peer credit until the source ends.
    async fn drive_outbound(self: Arc<Self>) {
        let Some(mut outbound) = self.outbound.lock().take() else {
            return;
        };

        let first = match outbound.next().await {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                // Source failed before the stream existed; nothing on the
                // wire, the subscriber just hears the error.
                self.finish(Err(e), false);
                return;
            }
            None => {
                self.finish(Err(WeftError::EmptySource), false);
                return;
            }
        };

        if let Err(e) = self.open_stream(first) {
            self.finish(Err(e), false);
            return;
        }

        // Pull before taking credit: the end of the source must surface as
        // a COMPLETE even when no credit is left.
        loop {
            match outbound.next().await {
                Some(Ok(payload)) => {
                    if !self
                        .credits
                        .take(|| self.state.is_terminated() || self.state.outbound_terminated())
                        .await
                    {
                        return;
                    }
                    let stream_id = self.stream_id.load(Ordering::Acquire);
                    let spec = crate::fragment::FragmentSpec {
                        stream_id,
                        frame_type: FrameType::Next,
                        initial_request_n: None,
                        complete: false,
                    };
                    let result = {
                        let _guard = self.send_lock.lock();
                        self.core.send_payload(spec, payload)
                    };
                    if let Err(e) = result {
                        self.fail_stream(e);
                        return;
                    }
                }
                Some(Err(e)) => {
                    self.fail_stream(e);
                    return;
                }
                None => {
                    self.complete_outbound();
                    return;
                }
            }
        }
    }

    fn open_stream(self: &Arc<Self>, payload: Payload) -> Result<(), WeftError> {
        self.core
            .check_outbound(&payload, crate::frame::REQUEST_N_SIZE)?;
        self.core.admit_outbound()?;

        let stream_id = self.core.next_stream_id();
        self.stream_id.store(stream_id, Ordering::Release);
        self.core.registry.register(stream_id, self.clone());
        self.core
            .interceptor
            .on_start(stream_id, InteractionKind::RequestChannel);

        // Demand added between here and now rides the frame; later demand
        // sees the claimed flag and maps to REQUEST_N.
        let initial_n = self.state.claim_first_frame().unwrap_or(0);
        {
            let _guard = self.send_lock.lock();
            // A cancel that won in the meantime suppresses the opening
            // frame; the peer never learns the stream existed.
            if self.state.is_terminated() {
                self.core.registry.remove(stream_id);
                return Ok(());
            }
            // Demand parked by racing `request` calls rides the opening
            // frame instead of a premature REQUEST_N.
            let initial_n = initial_n
                .saturating_add(self.pending_n.swap(0, Ordering::AcqRel))
                .min(crate::REQUEST_MAX);
            self.core.send_payload(
                request_spec(stream_id, FrameType::RequestChannel, Some(initial_n)),
                payload,
            )?;
            self.frame_sent.store(true, Ordering::Release);
        }
        // Sweep the registry if a cancel raced the registration.
        if self.state.is_terminated() {
            self.core.registry.remove(stream_id);
        }
        Ok(())
    }

    /// Emit a terminal frame only after the opening frame is truly on the
    /// wire, and never reordered ahead of it.
    fn send_terminal_frame(&self, frame: Frame) {
        let _guard = self.send_lock.lock();
        if self.frame_sent.load(Ordering::Acquire) {
            self.core.send_frame(frame);
        }
    }

    /// Our side ran out of items: COMPLETE and close outbound only.
    fn complete_outbound(&self) {
        let stream_id = self.stream_id.load(Ordering::Acquire);
        match self.state.terminate_outbound() {
            HalfCloseOutcome::HalfClosed => {
                let _guard = self.send_lock.lock();
                self.core.send_frame(Frame::complete(stream_id));
            }
            HalfCloseOutcome::BothClosed => {
                {
                    let _guard = self.send_lock.lock();
                    self.core.send_frame(Frame::complete(stream_id));
                }
                self.core.registry.remove(stream_id);
                self.core.interceptor.on_complete(stream_id);
                self.subscriber.lock().take();
            }
            HalfCloseOutcome::AlreadyTerminated => {}
        }
    }

    /// Inbound completed; outbound may keep sending.
    fn complete_inbound(&self) {
        let stream_id = self.stream_id.load(Ordering::Acquire);
        match self.state.terminate_inbound() {
            HalfCloseOutcome::HalfClosed => {
                self.subscriber.lock().take();
            }
            HalfCloseOutcome::BothClosed => {
                self.core.registry.remove(stream_id);
                self.core.interceptor.on_complete(stream_id);
                self.subscriber.lock().take();
            }
            HalfCloseOutcome::AlreadyTerminated => {}
        }
    }

    /// Full termination with an error on the wire.
    fn fail_stream(&self, error: WeftError) {
        let code = error.wire_code();
        let message = error.to_string();
        let Some(snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            self.send_terminal_frame(Frame::error(stream_id, code, message));
        }
        self.core.interceptor.on_error(stream_id, &error);
        if let Some(tx) = self.subscriber.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Full termination without frames (remote fault or local failure
    /// before the stream opened).
    fn finish(&self, result: Result<(), WeftError>, send_cancel: bool) {
        let Some(snapshot) = self.state.try_terminate() else {
            if let Err(e) = result {
                self.core.error_sink.dropped(e);
            }
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            if send_cancel {
                self.send_terminal_frame(Frame::cancel(stream_id));
            }
        }
        match &result {
            Ok(()) => self.core.interceptor.on_complete(stream_id),
            Err(e) => self.core.interceptor.on_error(stream_id, e),
        }
        let subscriber = self.subscriber.lock().take();
        if let (Some(tx), Err(e)) = (subscriber, result) {
            let _ = tx.send(Err(e));
        }
    }

    fn cancel_local(&self) {
        let Some(snapshot) = self.state.try_terminate() else {
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            self.send_terminal_frame(Frame::cancel(stream_id));
        }
        self.core.interceptor.on_cancel(stream_id);
        self.subscriber.lock().take();
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
                        self.fail_local(e);
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
            self.fail_local(e);
            return;
        }
        if let Some(tx) = self.subscriber.lock().as_ref() {
            let _ = tx.send(Ok(payload));
        }
        if complete {
            self.complete_inbound();
        }
    }

    /// Inbound protocol violation: CANCEL the peer, stop the driver, fault
    /// the subscriber.
    fn fail_local(&self, error: WeftError) {
        let Some(snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let stream_id = self.stream_id.load(Ordering::Acquire);
        if snapshot.first_frame_sent {
            self.core.registry.remove(stream_id);
            self.send_terminal_frame(Frame::cancel(stream_id));
        }
        self.core.interceptor.on_error(stream_id, &error);
        if let Some(tx) = self.subscriber.lock().take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl FrameHandler for ChannelOperator {
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
            FrameType::Complete => self.complete_inbound(),
            FrameType::RequestN => {
                if let Some(n) = frame.request_n {
                    self.credits.add(n);
                }
            }
            FrameType::Cancel => {
                // Peer cancel tears down both directions at once.
                if let Some(driver) = self.driver.lock().take() {
                    driver.abort();
                }
                self.finish(Err(WeftError::Cancelled), false);
            }
            FrameType::Error => {
                if let Some(driver) = self.driver.lock().take() {
                    driver.abort();
                }
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
                tracing::debug!(frame_type = ?other, "unexpected frame on request-channel");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, error: WeftError) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.finish(Err(error), false);
    }
}
