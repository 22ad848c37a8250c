//! Receive-side routing: matches inbound replies to outstanding calls by id
//! and routes inbound calls to registered handlers by message tag.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::message::Message;

struct PendingCall {
    tx: oneshot::Sender<Result<Message, RpcError>>,
    /// Expected reply tag; kept for mismatch detection and debug logs.
    expected: &'static str,
}

/// Handler for a server-initiated (or server-side) call. Returns the reply
/// message, or an error string sent back as an ERROR frame.
pub type CallHandler = Box<dyn Fn(Message) -> Result<Message, String> + Send + Sync>;

/// Per-channel dispatcher. `pending` is the only state shared between the
/// demux task and callers of `register_rpc`.
#[derive(Default)]
pub struct Dispatcher {
    pending: Mutex<HashMap<i64, PendingCall>>,
    handlers: Mutex<HashMap<&'static str, CallHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call. Must happen before the call is written
    /// so a fast reply cannot race the registration.
    pub fn register_rpc(
        &self,
        id: i64,
        expected: &'static str,
    ) -> oneshot::Receiver<Result<Message, RpcError>> {
        let (tx, rx) = oneshot::channel();
        tracing::trace!(id, expected, "registering RPC call");
        let prev = self.pending.lock().insert(id, PendingCall { tx, expected });
        debug_assert!(prev.is_none(), "call id reused");
        rx
    }

    /// Drop a registration whose send failed.
    pub fn discard_rpc(&self, id: i64) {
        if self.pending.lock().remove(&id).is_some() {
            tracing::debug!(id, "discarded RPC call after failed send");
        }
    }

    /// Resolve an outstanding call with a REPLY payload.
    pub fn complete_reply(&self, id: i64, payload: Message) {
        let Some(call) = self.pending.lock().remove(&id) else {
            tracing::warn!(id, tag = payload.tag(), "reply for unknown call id, dropping");
            return;
        };
        let outcome = if payload.tag() == call.expected {
            Ok(payload)
        } else {
            Err(RpcError::UnexpectedReply {
                expected: call.expected,
                got: payload.tag().to_string(),
            })
        };
        let _ = call.tx.send(outcome);
    }

    /// Resolve an outstanding call with an ERROR payload.
    pub fn complete_error(&self, id: i64, message: String) {
        let Some(call) = self.pending.lock().remove(&id) else {
            tracing::warn!(id, "error for unknown call id, dropping");
            return;
        };
        tracing::debug!(id, expected = call.expected, "call failed remotely");
        let _ = call.tx.send(Err(RpcError::Remote(message)));
    }

    /// Fail every outstanding call. Invoked when the channel goes inactive.
    pub fn discard_all(&self, cause: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), cause, "failing outstanding calls");
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(RpcError::Closed(cause.to_string())));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register a handler for inbound calls carrying the given tag.
    pub fn register_handler(
        &self,
        tag: &'static str,
        handler: impl Fn(Message) -> Result<Message, String> + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(tag, Box::new(handler));
    }

    /// Route an inbound call to its handler. `None` when no handler is
    /// registered for the tag.
    pub fn dispatch_call(&self, msg: Message) -> Option<Result<Message, String>> {
        let handlers = self.handlers.lock();
        handlers.get(msg.tag()).map(|h| h(msg))
    }
}
