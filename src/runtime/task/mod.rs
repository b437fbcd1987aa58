//! Task definitions.
//!
//! A [`Task`] is the unit every kind of asynchronous work in the runtime is
//! expressed as: plain callbacks, periodic timers, inbound RPC dispatch,
//! outbound RPC reply delivery and disk I/O completion. They all share one
//! lifecycle:
//!
//! ```text
//! Ready --dispatch--> Running --Done--> Finished
//!   ^                    |
//!   +-------retry--------+
//! Ready --cancel--> Cancelled
//! Running + cancel request --retry / next cycle--> Cancelled
//! ```
//!
//! Tasks are shared as `Arc<Task>` between the producer, the queue holding
//! them, an optional [`TaskTracker`](crate::runtime::tracker::TaskTracker)
//! and the worker executing them. The variant-specific payload lives in a
//! private enum; each variant has a typed handle ([`RawTask`], [`TimerTask`],
//! [`RpcRequestTask`], [`RpcResponseTask`], [`AioTask`]) that derefs to
//! `Arc<Task>`.

/// Shared plumbing for the typed handles: `Deref` to `Arc<Task>` and
/// conversion back into it.
macro_rules! task_handle {
    ($name:ident) => {
        impl std::ops::Deref for $name {
            type Target = std::sync::Arc<$crate::runtime::task::Task>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl $name {
            /// The underlying task.
            #[inline]
            pub fn task(&self) -> &std::sync::Arc<$crate::runtime::task::Task> {
                &self.0
            }

            /// Give up the typed view.
            #[inline]
            pub fn into_task(self) -> std::sync::Arc<$crate::runtime::task::Task> {
                self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                std::fmt::Debug::fmt(&*self.0, f)
            }
        }
    };
}

pub mod aio;
pub mod code;
pub mod raw;
pub mod rpc;
pub mod state;
pub mod timer;

pub use aio::{AioTask, AioType, DiskAio, FileHandle};
pub use code::{
    PoolCode, TaskCode, TaskPriority, TaskSpec, TaskType, DEFAULT_RPC_TIMEOUT_MS,
    THREAD_POOL_DEFAULT,
};
pub use raw::{LateTask, RawTask};
pub use rpc::{Message, MessageHeader, RpcRequestTask, RpcResponseTask};
pub use state::TaskState;
pub use timer::TimerTask;

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use crate::runtime::context;
use crate::runtime::error::ErrorCode;
use crate::runtime::node::ServiceNode;
use crate::runtime::tracker::{TaskTracker, TrackerShared};
use state::StateCell;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// What an execution asks the runtime to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Finish the task.
    Done,
    /// Admit the task again right away.
    RetryNow,
    /// Admit the task again after the given milliseconds.
    RetryAfter(u32),
    /// Go back to `Ready` without admission; the owner enqueues it later.
    Rearm,
}

/// Result of [`Task::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelResult {
    /// This call moved the task to `Cancelled`.
    pub cancelled: bool,
    /// The task is not executing anymore and never will again.
    pub finished: bool,
}

pub(crate) enum Payload {
    Raw(raw::RawBody),
    Timer(timer::TimerBody),
    RpcRequest(rpc::RequestBody),
    RpcResponse(rpc::ResponseBody),
    Aio(aio::AioBody),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Raw(_) => "raw",
            Payload::Timer(_) => "timer",
            Payload::RpcRequest(_) => "rpc_request",
            Payload::RpcResponse(_) => "rpc_response",
            Payload::Aio(_) => "aio",
        }
    }

    fn execute(
        &self,
        task: &Task,
    ) -> Execution {
        match self {
            Payload::Raw(body) => body.execute(),
            Payload::Timer(body) => body.execute(),
            Payload::RpcRequest(body) => body.execute(task),
            Payload::RpcResponse(body) => body.execute(task),
            Payload::Aio(body) => body.execute(task),
        }
    }

    fn on_enqueue(
        &self,
        task: &Task,
    ) {
        if let Payload::RpcRequest(body) = self {
            body.stamp_enqueue(task);
        }
    }

    fn pool_override(&self) -> Option<PoolCode> {
        match self {
            Payload::RpcResponse(body) => body.caller_pool(),
            _ => None,
        }
    }

    fn release(&self) {
        match self {
            Payload::Raw(body) => body.release(),
            Payload::Timer(body) => body.release(),
            Payload::RpcRequest(body) => body.release(),
            Payload::RpcResponse(body) => body.release(),
            Payload::Aio(body) => body.release(),
        }
    }
}

/// A schedulable unit of work.
pub struct Task {
    id: TaskId,
    spec: &'static TaskSpec,
    hash: u64,
    state: StateCell,
    error: Mutex<ErrorCode>,
    delay_ms: AtomicU32,
    node: Arc<ServiceNode>,
    tracker: Mutex<Option<Weak<TrackerShared>>>,
    retry: Mutex<Option<Execution>>,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    payload: Payload,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("code", &self.spec.name)
            .field("kind", &self.payload.kind())
            .field("hash", &self.hash)
            .field("state", &self.state())
            .field("delay_ms", &self.delay_ms())
            .finish()
    }
}

impl Task {
    /// Build a task. Without an explicit node the calling thread's node is
    /// used, which requires an execution context.
    #[track_caller]
    pub(crate) fn with_payload(
        code: TaskCode,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
        payload: Payload,
    ) -> Arc<Task> {
        let node = node.unwrap_or_else(context::current_node);
        let task = Arc::new(Task {
            id: TaskId::next(),
            spec: code.spec(),
            hash,
            state: StateCell::new(),
            error: Mutex::new(ErrorCode::Ok),
            delay_ms: AtomicU32::new(0),
            node,
            tracker: Mutex::new(None),
            retry: Mutex::new(None),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            payload,
        });
        trace!(task = %task.id, code = %task.spec.name, kind = task.payload.kind(), "task created");
        task
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn code(&self) -> TaskCode {
        self.spec.code
    }

    #[inline]
    pub fn spec(&self) -> &'static TaskSpec {
        self.spec
    }

    /// Affinity key used to pick a worker inside partitioned pools.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Whether a cancel arrived while the task was running.
    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.state.cancel_requested()
    }

    #[inline]
    pub fn error(&self) -> ErrorCode {
        *self.error.lock()
    }

    #[inline]
    pub fn set_error(
        &self,
        err: ErrorCode,
    ) {
        *self.error.lock() = err;
    }

    #[inline]
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms.load(Ordering::Acquire)
    }

    /// Set the admission delay. Only meaningful before [`Task::enqueue`].
    #[inline]
    pub fn set_delay(
        &self,
        delay_ms: u32,
    ) {
        self.delay_ms.store(delay_ms, Ordering::Release);
    }

    #[inline]
    pub fn node(&self) -> &Arc<ServiceNode> {
        &self.node
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the task is attached to a live tracker.
    pub fn has_tracker(&self) -> bool {
        self.tracker
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    /// Attach to `tracker`; dropping the tracker cancels the task.
    pub fn set_tracker(
        self: &Arc<Self>,
        tracker: &TaskTracker,
    ) {
        *self.tracker.lock() = Some(tracker.downgrade());
        tracker.attach(self.clone());

        // Reached a terminal state while we were attaching.
        if self.state().is_terminal() {
            tracker.detach(self.id);
        }
    }

    /// Admit the task to its pool, honoring the delay.
    ///
    /// A cancelled task is ignored silently; a task that is running or
    /// finished is ignored with a warning.
    pub fn enqueue(self: &Arc<Self>) {
        match self.state() {
            TaskState::Ready => {},
            TaskState::Cancelled => {
                debug!(task = %self.id, code = %self.spec.name, "enqueue of cancelled task ignored");
                return;
            },
            state => {
                warn!(task = %self.id, code = %self.spec.name, ?state, "enqueue ignored");
                return;
            },
        }

        self.payload.on_enqueue(self);
        let pool = self.payload.pool_override().unwrap_or(self.spec.pool);
        self.node.dispatch(self.clone(), pool);
    }

    /// Set the delay and enqueue.
    pub fn enqueue_after(
        self: &Arc<Self>,
        delay: Duration,
    ) {
        self.set_delay(delay.as_millis().min(u32::MAX as u128) as u32);
        self.enqueue();
    }

    /// Try to cancel the task.
    ///
    /// `cancelled` is true only for the one call that moved the task from
    /// `Ready` to `Cancelled`. A running task cannot be intercepted, but it
    /// is flagged so it is never admitted again; with `wait_until_finished`
    /// the caller blocks until that execution returns. A task cancelling
    /// itself never blocks.
    pub fn cancel(
        &self,
        wait_until_finished: bool,
    ) -> CancelResult {
        loop {
            if self.state.transition(TaskState::Ready, TaskState::Cancelled) {
                debug!(task = %self.id, code = %self.spec.name, "task cancelled");
                self.on_terminal();
                return CancelResult {
                    cancelled: true,
                    finished: true,
                };
            }

            match self.state() {
                TaskState::Finished | TaskState::Cancelled => {
                    return CancelResult {
                        cancelled: false,
                        finished: true,
                    };
                },
                // Re-armed between the exchange and the load.
                TaskState::Ready => continue,
                TaskState::Running => {
                    if !self.state.request_cancel() {
                        continue;
                    }

                    if !wait_until_finished || context::current_task_id() == self.id.0 {
                        return CancelResult {
                            cancelled: false,
                            finished: false,
                        };
                    }

                    self.wait_terminal(None);
                    return CancelResult {
                        cancelled: false,
                        finished: true,
                    };
                },
            }
        }
    }

    /// Block until the task is `Finished` or `Cancelled`, or `timeout`
    /// elapses. Returns whether the task reached a terminal state.
    ///
    /// # Panics
    ///
    /// When called from the thread executing this task.
    #[track_caller]
    pub fn wait(
        &self,
        timeout: Duration,
    ) -> bool {
        self.check_not_self_wait();
        self.wait_terminal(Some(timeout))
    }

    /// Block until the task is `Finished` or `Cancelled`.
    #[track_caller]
    pub fn wait_forever(&self) {
        self.check_not_self_wait();
        self.wait_terminal(None);
    }

    #[track_caller]
    fn check_not_self_wait(&self) {
        if context::current_task_id() == self.id.0 && self.state() == TaskState::Running {
            error!(task = %self.id, code = %self.spec.name, "task waits on itself");
            panic!("{} ({}) cannot wait on itself", self.id, self.spec.name);
        }
    }

    fn wait_terminal(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        if self.state().is_terminal() {
            return true;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.wait_lock.lock();
        while !self.state().is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.wait_cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.state().is_terminal();
                    }
                },
                None => self.wait_cond.wait(&mut guard),
            }
        }
        true
    }

    fn signal_waiters(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cond.notify_all();
    }

    /// Ask for another admission instead of finishing. Only accepted from
    /// inside this task's own execution.
    pub fn set_retry(
        &self,
        enqueue_immediately: bool,
    ) -> bool {
        self.request_retry(if enqueue_immediately {
            Execution::RetryNow
        } else {
            Execution::Rearm
        })
    }

    /// Ask for another admission after `delay_ms`. Only accepted from inside
    /// this task's own execution.
    pub fn set_retry_after(
        &self,
        delay_ms: u32,
    ) -> bool {
        self.request_retry(Execution::RetryAfter(delay_ms))
    }

    fn request_retry(
        &self,
        outcome: Execution,
    ) -> bool {
        if self.state() != TaskState::Running || context::current_task_id() != self.id.0 {
            return false;
        }
        *self.retry.lock() = Some(outcome);
        true
    }

    /// Run one admission of the task on the calling worker thread.
    pub(crate) fn exec_internal(self: &Arc<Self>) {
        if !self.state.transition(TaskState::Ready, TaskState::Running) {
            trace!(task = %self.id, state = ?self.state(), "skip execution");
            return;
        }

        let previous = context::enter_task(self.clone());
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.payload.execute(self))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(task = %self.id, code = %self.spec.name, "task body panicked");
                *self.retry.lock() = None;
                Execution::Done
            },
        };
        let outcome = self.retry.lock().take().unwrap_or(outcome);
        context::leave_task(previous);

        match self.state.complete(&outcome) {
            TaskState::Ready => match outcome {
                Execution::RetryNow => {
                    self.set_delay(0);
                    self.enqueue();
                },
                Execution::RetryAfter(delay_ms) => {
                    self.set_delay(delay_ms);
                    self.enqueue();
                },
                Execution::Rearm | Execution::Done => {},
            },
            _ => self.on_terminal(),
        }
    }

    fn on_terminal(&self) {
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker.and_then(|t| t.upgrade()) {
            tracker.remove(self.id);
        }
        self.payload.release();
        self.signal_waiters();
    }
}

/// Builder for tasks sharing the common options.
#[derive(Debug)]
pub struct TaskBuilder {
    code: TaskCode,
    hash: u64,
    delay_ms: u32,
    node: Option<Arc<ServiceNode>>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new(code: TaskCode) -> Self {
        Self {
            code,
            hash: 0,
            delay_ms: 0,
            node: None,
        }
    }

    /// Set the affinity hash.
    #[inline]
    pub fn hash(
        mut self,
        hash: u64,
    ) -> Self {
        self.hash = hash;
        self
    }

    /// Set the admission delay.
    #[inline]
    pub fn delay_ms(
        mut self,
        delay_ms: u32,
    ) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Run under `node` instead of the calling thread's node.
    #[inline]
    pub fn node(
        mut self,
        node: Arc<ServiceNode>,
    ) -> Self {
        self.node = Some(node);
        self
    }

    /// Build a plain callback task.
    #[track_caller]
    pub fn raw<F>(
        self,
        cb: F,
    ) -> RawTask
    where
        F: FnMut() + Send + 'static,
    {
        let task = RawTask::with_node(self.code, cb, self.hash, self.node);
        task.set_delay(self.delay_ms);
        task
    }

    /// Build a periodic timer task. The first cycle runs after the builder's
    /// delay, later ones every `interval_ms`.
    #[track_caller]
    pub fn timer<F>(
        self,
        interval_ms: u32,
        cb: F,
    ) -> TimerTask
    where
        F: FnMut() + Send + 'static,
    {
        let task = TimerTask::with_node(self.code, cb, interval_ms, self.hash, self.node);
        task.set_delay(self.delay_ms);
        task
    }

    /// Build a disk completion task.
    #[track_caller]
    pub fn aio<F>(
        self,
        cb: F,
    ) -> AioTask
    where
        F: FnOnce(ErrorCode, usize) + Send + 'static,
    {
        let task = AioTask::with_node(self.code, cb, self.hash, self.node);
        task.set_delay(self.delay_ms);
        task
    }
}
