//! Inbound request/channel: the peer's items feed the handler, the
//! handler's stream feeds the peer, each direction flow-controlled on its
//! own.
//!
//! Inbound flow control is window-based: the responder grants
//! [`CHANNEL_INBOUND_WINDOW`] up front and re-grants half a window at a
//! time as the peer's payloads arrive. A peer that sends beyond its grant
//! is terminated with an INVALID error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::credits::Credits;
use crate::fragment::{FragmentSpec, Reassembler};
use crate::handler::PayloadStream;
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::state::HalfCloseOutcome;
use crate::{Frame, FrameType, InteractionKind, Payload, RequestHandler, WeftError};

use super::{error_frame, CHANNEL_INBOUND_WINDOW};

pub(crate) struct ChannelResponder {
    core: Arc<SessionCore>,
    handler: Arc<dyn RequestHandler>,
    stream_id: u32,
    state: crate::StreamState,
    /// Outbound credit, granted by the peer.
    credits: Credits,
    /// Inbound grant bookkeeping for the window we issue.
    window: Mutex<InboundWindow>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Result<Payload, WeftError>>>>,
    started: AtomicBool,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug)]
struct InboundWindow {
    /// Payloads the peer may still send against past grants.
    remaining: u32,
    /// Payloads consumed since the last re-grant.
    consumed: u32,
}

impl ChannelResponder {
    pub fn accept(core: &Arc<SessionCore>, handler: &Arc<dyn RequestHandler>, frame: Frame) {
        let stream_id = frame.stream_id;
        let Some(payload) = frame.payload else {
            return;
        };
        let follows = frame.flags.contains(crate::FrameFlags::FOLLOWS);
        let initial_n = frame.request_n.unwrap_or(0);

        let responder = Arc::new(Self {
            core: core.clone(),
            handler: handler.clone(),
            stream_id,
            state: crate::StreamState::new(),
            credits: Credits::new(initial_n),
            window: Mutex::new(InboundWindow {
                remaining: CHANNEL_INBOUND_WINDOW,
                consumed: 0,
            }),
            inbound_tx: Mutex::new(None),
            started: AtomicBool::new(false),
            reassembler: Mutex::new(Reassembler::new(core.config.max_inbound_payload_size)),
            send_lock: Mutex::new(()),
            task: Mutex::new(None),
        });
        core.interceptor
            .on_start(stream_id, InteractionKind::RequestChannel);
        core.registry.register(stream_id, responder.clone());
        // Open the inbound window; the request payload itself is not
        // charged against it.
        {
            let _guard = responder.send_lock.lock();
            core.send_frame(Frame::request_n(stream_id, CHANNEL_INBOUND_WINDOW));
        }

        if follows {
            responder.state.set_reassembling(true);
            if let Err(e) = responder.reassembler.lock().push(payload, true) {
                responder.fail(e);
            }
            return;
        }
        responder.start(payload);
    }

    /// First complete payload in hand: wire up the handler and the
    /// outbound driver.
    fn start(self: &Arc<Self>, first: Payload) {
        self.started.store(true, Ordering::Release);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(first));
        *self.inbound_tx.lock() = Some(tx);
        let inbound: PayloadStream =
            Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)));

        let responder = self.clone();
        let handle = self.core.runtime.spawn(async move {
            responder.drive(inbound).await;
        });
        let mut task = self.task.lock();
        if self.state.is_terminated() {
            handle.abort();
        } else {
            *task = Some(handle);
        }
    }

    async fn drive(self: Arc<Self>, inbound: PayloadStream) {
        let mut source = self.handler.request_channel(inbound);
        // Pull before taking credit so an exhausted source completes the
        // stream even with zero demand left.
        loop {
            match source.next().await {
                Some(Ok(payload)) => {
                    if !self
                        .credits
                        .take(|| self.state.is_terminated() || self.state.outbound_terminated())
                        .await
                    {
                        return;
                    }
                    let spec = FragmentSpec {
                        stream_id: self.stream_id,
                        frame_type: FrameType::Next,
                        initial_request_n: None,
                        complete: false,
                    };
                    let result = {
                        let _guard = self.send_lock.lock();
                        self.core.send_payload(spec, payload)
                    };
                    if let Err(e) = result {
                        self.fail(e);
                        return;
                    }
                }
                Some(Err(e)) => {
                    self.fail(e);
                    return;
                }
                None => {
                    self.complete_outbound();
                    return;
                }
            }
        }
    }

    fn complete_outbound(&self) {
        match self.state.terminate_outbound() {
            HalfCloseOutcome::HalfClosed => {
                let _guard = self.send_lock.lock();
                self.core.send_frame(Frame::complete(self.stream_id));
            }
            HalfCloseOutcome::BothClosed => {
                {
                    let _guard = self.send_lock.lock();
                    self.core.send_frame(Frame::complete(self.stream_id));
                }
                self.core.registry.remove(self.stream_id);
                self.core.interceptor.on_complete(self.stream_id);
            }
            HalfCloseOutcome::AlreadyTerminated => {}
        }
    }

    fn complete_inbound(&self) {
        // Close the handler's inbound stream.
        self.inbound_tx.lock().take();
        match self.state.terminate_inbound() {
            HalfCloseOutcome::BothClosed => {
                self.core.registry.remove(self.stream_id);
                self.core.interceptor.on_complete(self.stream_id);
            }
            HalfCloseOutcome::HalfClosed | HalfCloseOutcome::AlreadyTerminated => {}
        }
    }

    /// Full termination with an ERROR frame to the peer.
    fn fail(&self, error: WeftError) {
        let Some(_snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        self.core.registry.remove(self.stream_id);
        {
            let _guard = self.send_lock.lock();
            self.core.send_frame(error_frame(self.stream_id, &error));
        }
        if let Some(tx) = self.inbound_tx.lock().take() {
            let _ = tx.send(Err(error.clone()));
        }
        self.core.interceptor.on_error(self.stream_id, &error);
    }

    /// Full termination caused by the peer; nothing goes back out.
    fn fault(&self, error: WeftError) {
        let Some(_snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.credits.close();
        self.reassembler.lock().clear();
        self.core.registry.remove(self.stream_id);
        if let Some(tx) = self.inbound_tx.lock().take() {
            let _ = tx.send(Err(error.clone()));
        }
        self.core.interceptor.on_error(self.stream_id, &error);
    }

    fn cancelled(&self) {
        if self.state.try_terminate().is_none() {
            return;
        }
        self.credits.close();
        self.reassembler.lock().clear();
        self.core.registry.remove(self.stream_id);
        self.inbound_tx.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.core.interceptor.on_cancel(self.stream_id);
    }

    fn deliver(self: &Arc<Self>, payload: Payload, follows: bool, complete: bool) {
        let finished = {
            let mut reassembler = self.reassembler.lock();
            if follows || reassembler.is_active() {
                self.state.set_reassembling(follows);
                match reassembler.push(payload, follows) {
                    Ok(done) => done,
                    Err(e) => {
                        drop(reassembler);
                        self.fail(e);
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

        if !self.started.load(Ordering::Acquire) {
            // This was the (reassembled) request payload.
            self.start(payload);
            if complete {
                self.complete_inbound();
            }
            return;
        }

        // Window accounting for a peer item.
        let regrant = {
            let mut window = self.window.lock();
            if window.remaining == 0 {
                drop(window);
                self.fail(WeftError::Overflow);
                return;
            }
            window.remaining -= 1;
            window.consumed += 1;
            if window.consumed >= CHANNEL_INBOUND_WINDOW / 2 && !complete {
                let grant = window.consumed;
                window.remaining += grant;
                window.consumed = 0;
                Some(grant)
            } else {
                None
            }
        };
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Ok(payload));
        }
        if let Some(grant) = regrant {
            let _guard = self.send_lock.lock();
            self.core.send_frame(Frame::request_n(self.stream_id, grant));
        }
        if complete {
            self.complete_inbound();
        }
    }
}

impl FrameHandler for ChannelResponder {
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
            FrameType::Cancel => self.cancelled(),
            FrameType::Error => {
                let error = frame
                    .error
                    .map(|e| WeftError::Remote {
                        code: e.code,
                        message: e.message,
                    })
                    .unwrap_or(WeftError::ConnectionClosed);
                self.fault(error);
            }
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on request-channel responder");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, error: WeftError) {
        self.credits.close();
        if self.state.try_terminate().is_some() {
            self.reassembler.lock().clear();
            if let Some(tx) = self.inbound_tx.lock().take() {
                let _ = tx.send(Err(error));
            }
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }
}
