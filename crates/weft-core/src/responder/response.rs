//! Inbound request/response: run the handler future, answer with one
//! payload or an error.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fragment::{FragmentSpec, Reassembler};
use crate::registry::FrameHandler;
use crate::session::SessionCore;
use crate::{Frame, FrameType, InteractionKind, Payload, RequestHandler, WeftError};

use super::error_frame;

pub(crate) struct ResponseResponder {
    core: Arc<SessionCore>,
    handler: Arc<dyn RequestHandler>,
    stream_id: u32,
    state: crate::StreamState,
    reassembler: Mutex<Reassembler>,
    send_lock: Mutex<()>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResponseResponder {
    pub fn accept(core: &Arc<SessionCore>, handler: &Arc<dyn RequestHandler>, frame: Frame) {
        let stream_id = frame.stream_id;
        let Some(payload) = frame.payload else {
            return;
        };
        let follows = frame.flags.contains(crate::FrameFlags::FOLLOWS);

        let responder = Arc::new(Self {
            core: core.clone(),
            handler: handler.clone(),
            stream_id,
            state: crate::StreamState::new(),
            reassembler: Mutex::new(Reassembler::new(core.config.max_inbound_payload_size)),
            send_lock: Mutex::new(()),
            task: Mutex::new(None),
        });
        core.interceptor
            .on_start(stream_id, InteractionKind::RequestResponse);
        // Register first: CANCEL may race the handler task.
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
            let result = responder.handler.request_response(request).await;
            match result {
                Ok(payload) => responder.answer(payload),
                Err(e) => responder.fail(e),
            }
        });
        let mut task = self.task.lock();
        if self.state.is_terminated() {
            // Cancel won the race while we were spawning.
            handle.abort();
        } else {
            *task = Some(handle);
        }
    }

    fn answer(&self, payload: Payload) {
        let Some(_snapshot) = self.state.try_terminate() else {
            return;
        };
        self.core.registry.remove(self.stream_id);
        let spec = FragmentSpec {
            stream_id: self.stream_id,
            frame_type: FrameType::Next,
            initial_request_n: None,
            complete: true,
        };
        let result = {
            let _guard = self.send_lock.lock();
            self.core.send_payload(spec, payload)
        };
        match result {
            Ok(()) => self.core.interceptor.on_complete(self.stream_id),
            Err(e) => {
                let _guard = self.send_lock.lock();
                self.core.send_frame(error_frame(self.stream_id, &e));
                self.core.interceptor.on_error(self.stream_id, &e);
            }
        }
    }

    fn fail(&self, error: WeftError) {
        let Some(_snapshot) = self.state.try_terminate() else {
            self.core.error_sink.dropped(error);
            return;
        };
        self.core.registry.remove(self.stream_id);
        {
            let _guard = self.send_lock.lock();
            self.core.send_frame(error_frame(self.stream_id, &error));
        }
        self.core.interceptor.on_error(self.stream_id, &error);
    }

    fn cancelled(&self) {
        let Some(_snapshot) = self.state.try_terminate() else {
            return;
        };
        self.reassembler.lock().clear();
        self.core.registry.remove(self.stream_id);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.core.interceptor.on_cancel(self.stream_id);
    }
}

impl FrameHandler for ResponseResponder {
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
            FrameType::Cancel => self.cancelled(),
            other => {
                tracing::debug!(frame_type = ?other, "unexpected frame on request-response responder");
            }
        }
    }

    fn connection_terminated(self: Arc<Self>, _error: WeftError) {
        if self.state.try_terminate().is_some() {
            self.reassembler.lock().clear();
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }
}
