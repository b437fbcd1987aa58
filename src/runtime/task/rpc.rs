//! RPC request dispatch and reply delivery tasks.
//!
//! The transport owns framing and serialization; this module only sees
//! decoded [`Message`]s. For every inbound request the transport builds an
//! [`RpcRequestTask`] and enqueues it. For every outbound call it hands an
//! [`RpcResponseTask`] to the transport, which calls
//! [`RpcResponseTask::enqueue_response`] exactly once with the outcome.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::{Execution, Payload, PoolCode, Task, TaskCode};
use crate::runtime::error::{ErrorCode, TaskError, TaskResult};
use crate::runtime::node::ServiceNode;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Process-unique message id.
    pub id: u64,
    /// Request id a reply answers; equals `id` on requests.
    pub rpc_id: u64,
    /// Task code of the RPC.
    pub code: TaskCode,
    /// Address of the sender, for diagnostics.
    pub from_address: String,
    /// How long the client waits for a reply.
    pub client_timeout_ms: u32,
    /// Affinity hash chosen by the client.
    pub thread_hash: u64,
    pub trace_id: u64,
}

/// A request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    body: Vec<u8>,
}

impl Message {
    /// Build a request. Without a timeout the code's registered RPC timeout
    /// is used.
    pub fn new_request(
        code: TaskCode,
        timeout_ms: Option<u32>,
        thread_hash: u64,
        body: Vec<u8>,
    ) -> Message {
        let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        Message {
            header: MessageHeader {
                id,
                rpc_id: id,
                code,
                from_address: String::new(),
                client_timeout_ms: timeout_ms.unwrap_or(code.spec().rpc_timeout_ms),
                thread_hash,
                trace_id: 0,
            },
            body,
        }
    }

    /// Same message, stamped with the sender address.
    pub fn with_from_address(
        mut self,
        from_address: impl Into<String>,
    ) -> Self {
        self.header.from_address = from_address.into();
        self
    }

    /// Build the reply to this request under the paired `_ACK` code.
    pub fn create_response(
        &self,
        body: Vec<u8>,
    ) -> TaskResult<Arc<Message>> {
        let ack = self
            .header
            .code
            .spec()
            .rpc_paired_code
            .ok_or(TaskError::UnknownTaskCode(self.header.code.inner()))?;

        Ok(Arc::new(Message {
            header: MessageHeader {
                id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
                rpc_id: self.header.rpc_id,
                code: ack,
                from_address: String::new(),
                client_timeout_ms: self.header.client_timeout_ms,
                thread_hash: self.header.thread_hash,
                trace_id: self.header.trace_id,
            },
            body,
        }))
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

type RequestHandler = Box<dyn FnOnce(&Arc<Message>) + Send>;
type ResponseHandler = Box<dyn FnMut(ErrorCode, &Arc<Message>, Option<&Arc<Message>>) + Send>;

pub(crate) struct RequestBody {
    request: Arc<Message>,
    handler: Mutex<Option<RequestHandler>>,
    // 0 until the first enqueue.
    enqueue_ts_ns: AtomicU64,
}

impl RequestBody {
    pub(crate) fn stamp_enqueue(
        &self,
        task: &Task,
    ) {
        // `now_ns` may legitimately be 0 on a fresh clock; 0 means unstamped.
        let now = task.node().env().now_ns().max(1);
        self.enqueue_ts_ns.store(now, Ordering::Release);
    }

    pub(crate) fn execute(
        &self,
        task: &Task,
    ) -> Execution {
        let handler = self.handler.lock().take();
        let enqueued = self.enqueue_ts_ns.load(Ordering::Acquire);
        let timeout_ns = self.request.header.client_timeout_ms as u64 * 1_000_000;

        if enqueued == 0 || task.node().env().now_ns().saturating_sub(enqueued) < timeout_ns {
            if let Some(handler) = handler {
                handler(&self.request);
            }
        } else {
            warn!(
                rpc = %task.spec().name,
                from = %self.request.header.from_address,
                timeout_ms = self.request.header.client_timeout_ms,
                "request dropped, client timeout exceeded before dispatch"
            );
        }
        Execution::Done
    }

    pub(crate) fn release(&self) {
        self.handler.lock().take();
    }
}

/// Dispatches one inbound request to its handler.
#[derive(Clone)]
pub struct RpcRequestTask(Arc<Task>);

task_handle!(RpcRequestTask);

impl RpcRequestTask {
    /// Wrap `request`. The task code and hash come from the header.
    #[track_caller]
    pub fn new<F>(
        request: Arc<Message>,
        handler: F,
        node: Option<Arc<ServiceNode>>,
    ) -> Self
    where
        F: FnOnce(&Arc<Message>) + Send + 'static,
    {
        let code = request.header.code;
        let hash = request.header.thread_hash;
        let body = RequestBody {
            request,
            handler: Mutex::new(Some(Box::new(handler))),
            enqueue_ts_ns: AtomicU64::new(0),
        };
        RpcRequestTask(Task::with_payload(code, hash, node, Payload::RpcRequest(body)))
    }

    fn body(&self) -> &RequestBody {
        match self.0.payload() {
            Payload::RpcRequest(body) => body,
            _ => unreachable!("RpcRequestTask always wraps a request payload"),
        }
    }

    #[inline]
    pub fn request(&self) -> &Arc<Message> {
        &self.body().request
    }

    /// Environment clock reading taken at the last enqueue; 0 if never
    /// enqueued.
    #[inline]
    pub fn enqueue_ts_ns(&self) -> u64 {
        self.body().enqueue_ts_ns.load(Ordering::Acquire)
    }
}

pub(crate) struct ResponseBody {
    request: Arc<Message>,
    reply: Mutex<Option<Arc<Message>>>,
    cb: Mutex<Option<ResponseHandler>>,
    caller_pool: Mutex<Option<PoolCode>>,
}

impl ResponseBody {
    pub(crate) fn caller_pool(&self) -> Option<PoolCode> {
        *self.caller_pool.lock()
    }

    pub(crate) fn execute(
        &self,
        task: &Task,
    ) -> Execution {
        let cb = self.cb.lock().take();
        if let Some(mut cb) = cb {
            let reply = self.reply.lock().clone();
            cb(task.error(), &self.request, reply.as_ref());

            let mut slot = self.cb.lock();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
        Execution::Done
    }

    pub(crate) fn release(&self) {
        self.cb.lock().take();
    }
}

/// Delivers the outcome of one outbound call to its callback.
#[derive(Clone)]
pub struct RpcResponseTask(Arc<Task>);

task_handle!(RpcResponseTask);

impl RpcResponseTask {
    /// Build the reply task for `request`. Its code is the request code's
    /// paired `_ACK` code.
    #[track_caller]
    pub fn new<F>(
        request: Arc<Message>,
        cb: F,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> TaskResult<Self>
    where
        F: FnMut(ErrorCode, &Arc<Message>, Option<&Arc<Message>>) + Send + 'static,
    {
        let code = request
            .header
            .code
            .spec()
            .rpc_paired_code
            .ok_or(TaskError::UnknownTaskCode(request.header.code.inner()))?;

        let body = ResponseBody {
            request,
            reply: Mutex::new(None),
            cb: Mutex::new(Some(Box::new(cb))),
            caller_pool: Mutex::new(None),
        };
        Ok(RpcResponseTask(Task::with_payload(
            code,
            hash,
            node,
            Payload::RpcResponse(body),
        )))
    }

    fn body(&self) -> &ResponseBody {
        match self.0.payload() {
            Payload::RpcResponse(body) => body,
            _ => unreachable!("RpcResponseTask always wraps a response payload"),
        }
    }

    /// Record the outcome of the call and admit the task. Called once by the
    /// transport; `reply` is `None` when `err` reports a failure. Returns
    /// false if the task was already cancelled.
    pub fn enqueue_response(
        &self,
        err: ErrorCode,
        reply: Option<Arc<Message>>,
    ) -> bool {
        self.0.set_error(err);
        *self.body().reply.lock() = reply;
        if self.0.state() == super::TaskState::Cancelled {
            return false;
        }
        self.0.enqueue();
        true
    }

    #[inline]
    pub fn request(&self) -> &Arc<Message> {
        &self.body().request
    }

    /// Reply captured by [`RpcResponseTask::enqueue_response`].
    pub fn response(&self) -> Option<Arc<Message>> {
        self.body().reply.lock().clone()
    }

    /// Replace the callback. Must happen before dispatch; it is not meant to
    /// race with the callback running.
    pub fn reset_callback<F>(
        &self,
        cb: F,
    ) where
        F: FnMut(ErrorCode, &Arc<Message>, Option<&Arc<Message>>) + Send + 'static,
    {
        *self.body().cb.lock() = Some(Box::new(cb));
    }

    /// Whether a callback is installed.
    pub fn has_callback(&self) -> bool {
        self.body().cb.lock().is_some()
    }

    /// Deliver on `pool` instead of the code's pool.
    pub fn set_caller_pool(
        &self,
        pool: PoolCode,
    ) {
        *self.body().caller_pool.lock() = Some(pool);
    }

    #[inline]
    pub fn caller_pool(&self) -> Option<PoolCode> {
        self.body().caller_pool()
    }
}
