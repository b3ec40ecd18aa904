//! Inbound request/stream: drive the handler's stream under the peer's
//! demand.

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::credits::Credits;
use crate::fragment::{FragmentSpec, Reassembler};
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::{Frame, FrameType, InteractionKind, Payload, RequestHandler, WeftError};

use super::error_frame;

pub(crate) struct StreamResponder {
    core: Arc<SessionCore>,
    handler: Arc<dyn RequestHandler>,
    stream_id: u32,
    state: crate::StreamState,
    credits: Credits,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamResponder {
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
            reassembler: Mutex::new(Reassembler::new(core.config.max_inbound_payload_size)),
            send_lock: Mutex::new(()),
            task: Mutex::new(None),
        });
        core.interceptor
            .on_start(stream_id, InteractionKind::RequestStream);
        core.registry.register(stream_id, responder.clone());

        if follows {
            responder.state.set_reassembling(true);
            if let Err(e) = responder.reassembler.lock().push(payload, true) {
                responder.fail(e);
            }
            return;
        }
        responder.start(payload);
    }

    fn start(self: &Arc<Self>, request: Payload) {
        let responder = self.clone();
        let handle = self.core.runtime.spawn(async move {
            responder.drive(request).await;
        });
        let mut task = self.task.lock();
        if self.state.is_terminated() {
            handle.abort();
        } else {
            *task = Some(handle);
        }
    }

    /// Pull the handler's stream, sending one NEXT per credit.
    async fn drive(self: Arc<Self>, request: Payload) {
        let mut source = self.handler.request_stream(request);
        // Pull before taking credit so an exhausted source completes the
        // stream even with zero demand left.
        loop {
            match source.next().await {
                Some(Ok(payload)) => {
                    if !self.credits.take(|| self.state.is_terminated()).await {
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
                    self.complete();
                    return;
                }
            }
        }
    }

    fn complete(&self) {
        if self.state.try_terminate().is_none() {
            return;
        }
        self.core.registry.remove(self.stream_id);
        {
            let _guard = self.send_lock.lock();
            self.core.send_frame(Frame::complete(self.stream_id));
        }
        self.core.interceptor.on_complete(self.stream_id);
    }

    fn fail(&self, error: WeftError) {
        let Some(_snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.credits.close();
        self.core.registry.remove(self.stream_id);
        {
            let _guard = self.send_lock.lock();
            self.core.send_frame(error_frame(self.stream_id, &error));
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
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.core.interceptor.on_cancel(self.stream_id);
    }
}

impl FrameHandler for StreamResponder {
    fn handle_frame(self: Arc<Self>, frame: Frame) {
        let follows = frame.follows();
        match frame.frame_type {
            FrameType::Next | FrameType::NextComplete if self.state.is_reassembling() => {
                let Some(payload) = frame.payload else {
                    return;
                };
                let result = self.reassembler.lock().push(payload, follows);
                match result {
                    Ok(Some(request)) => {
                        self.state.set_reassembling(false);
                        self.start(request);
                    }
                    Ok(None) => {}
                    Err(e) => self.fail(e),
                }
            }
            FrameType::RequestN => {
                if let Some(n) = frame.request_n {
                    self.credits.add(n);
                }
            }
            FrameType::Cancel => self.cancelled(),
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on request-stream responder");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, _error: WeftError) {
        if self.state.try_terminate().is_some() {
            self.credits.close();
            self.reassembler.lock().clear();
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }
}
