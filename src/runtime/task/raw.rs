//! Plain callback tasks.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{Execution, Payload, Task, TaskCode};
use crate::runtime::node::ServiceNode;

type Callback = Box<dyn FnMut() + Send>;

pub(crate) struct RawBody {
    cb: Mutex<Option<Callback>>,
}

impl RawBody {
    fn new(cb: Option<Callback>) -> Self {
        Self { cb: Mutex::new(cb) }
    }

    pub(crate) fn execute(&self) -> Execution {
        // The callback runs outside the lock so it may rebind itself.
        let cb = self.cb.lock().take();
        if let Some(mut cb) = cb {
            cb();
            let mut slot = self.cb.lock();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
        Execution::Done
    }

    fn bind(
        &self,
        cb: Callback,
    ) {
        *self.cb.lock() = Some(cb);
    }

    pub(crate) fn release(&self) {
        self.cb.lock().take();
    }
}

/// A task running a closure.
#[derive(Clone)]
pub struct RawTask(Arc<Task>);

task_handle!(RawTask);

impl RawTask {
    /// Create a task on the calling thread's node.
    #[track_caller]
    pub fn new<F>(
        code: TaskCode,
        cb: F,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_node(code, cb, 0, None)
    }

    /// Create a task with an explicit hash and node.
    #[track_caller]
    pub fn with_node<F>(
        code: TaskCode,
        cb: F,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let body = RawBody::new(Some(Box::new(cb)));
        RawTask(Task::with_payload(code, hash, node, Payload::Raw(body)))
    }

    #[track_caller]
    fn unbound(
        code: TaskCode,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> Self {
        RawTask(Task::with_payload(code, hash, node, Payload::Raw(RawBody::new(None))))
    }

    fn body(&self) -> &RawBody {
        match self.0.payload() {
            Payload::Raw(body) => body,
            _ => unreachable!("RawTask always wraps a raw payload"),
        }
    }
}

/// A task whose body is produced from a typed user callback at enqueue time.
///
/// The producer keeps the callback typed (e.g. `FnOnce(ErrorCode, Reply)`),
/// and only when the inputs are known does a currying function bind them into
/// a plain task body.
pub struct LateTask<C> {
    task: RawTask,
    user_cb: Mutex<Option<C>>,
}

impl<C: Send + 'static> LateTask<C> {
    #[track_caller]
    pub fn new(
        code: TaskCode,
        user_cb: C,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> Self {
        Self {
            task: RawTask::unbound(code, hash, node),
            user_cb: Mutex::new(Some(user_cb)),
        }
    }

    /// Bind the user callback through `curry` and enqueue after `delay_ms`.
    ///
    /// Binding happens once; later calls only re-enqueue.
    pub fn bind_and_enqueue<B, F>(
        &self,
        curry: B,
        delay_ms: u32,
    ) where
        B: FnOnce(C) -> F,
        F: FnMut() + Send + 'static,
    {
        let user_cb = self.user_cb.lock().take();
        if let Some(user_cb) = user_cb {
            self.task.body().bind(Box::new(curry(user_cb)));
        }
        self.task.set_delay(delay_ms);
        self.task.enqueue();
    }

    #[inline]
    pub fn task(&self) -> &Arc<Task> {
        self.task.task()
    }
}
