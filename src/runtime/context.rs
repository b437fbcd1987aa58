//! Thread-local execution context.
//!
//! Every thread that uses the task API (pool workers, the delay timer
//! thread, I/O completion threads) binds itself to a [`ServiceNode`] with
//! [`set_context`] before its first task call. The context remembers the
//! node, the worker identity when the thread belongs to a pool, the task
//! currently executing on the thread, and the node's facilities.
//!
//! The `current_*` accessors treat a missing context as a broken program:
//! they log and panic. The `try_*` / `*_id` variants return an absent value
//! instead, for code such as logging that may run anywhere.

use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, error};

use crate::runtime::node::{DiskEngine, EnvProvider, NfsNode, RpcEngine, ServiceNode, TimerService};
use crate::runtime::task::{PoolCode, Task};

/// Identity of a pool worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Pool the worker belongs to.
    pub pool: PoolCode,
    /// Index of the worker inside its pool.
    pub index: usize,
    /// Thread name, e.g. `node1.THREAD_POOL_DEFAULT.3`.
    pub name: String,
}

struct ExecutionContext {
    node: Arc<ServiceNode>,
    worker: Option<WorkerInfo>,
    current_task: Option<Arc<Task>>,
    rpc: Option<Arc<dyn RpcEngine>>,
    disk: Option<Arc<dyn DiskEngine>>,
    env: Arc<dyn EnvProvider>,
    nfs: Option<Arc<dyn NfsNode>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Bind the calling thread to `node`.
///
/// `worker` is `None` for I/O and timer threads. Calling it again rebinds the
/// thread; a task executing at that moment stays current.
pub fn set_context(
    node: Arc<ServiceNode>,
    worker: Option<WorkerInfo>,
) {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let current_task = slot.as_mut().and_then(|ctx| ctx.current_task.take());

        debug!(
            node = %node.name(),
            worker = ?worker.as_ref().map(|w| w.name.as_str()),
            "execution context bound"
        );

        *slot = Some(ExecutionContext {
            rpc: node.rpc(),
            disk: node.disk(),
            env: node.env(),
            nfs: node.nfs(),
            node,
            worker,
            current_task,
        });
    });
}

/// Whether the calling thread has an execution context.
pub fn is_initialized() -> bool {
    CONTEXT.with(|cell| cell.borrow().is_some())
}

#[cold]
#[track_caller]
fn on_context_not_set() -> ! {
    let thread = std::thread::current();
    error!(
        thread = thread.name().unwrap_or("<unnamed>"),
        "task API used on a thread without an execution context"
    );
    panic!(
        "execution context not set on thread {:?}; call context::set_context first",
        thread.name().unwrap_or("<unnamed>")
    );
}

#[track_caller]
fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&ExecutionContext) -> R,
{
    CONTEXT.with(|cell| match cell.borrow().as_ref() {
        Some(ctx) => f(ctx),
        None => on_context_not_set(),
    })
}

fn try_with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&ExecutionContext) -> R,
{
    CONTEXT.with(|cell| cell.borrow().as_ref().map(f))
}

/// Task executing on this thread, if any.
#[track_caller]
pub fn current_task() -> Option<Arc<Task>> {
    with_context(|ctx| ctx.current_task.clone())
}

/// Id of the task executing on this thread; 0 when there is none or the
/// thread has no context.
pub fn current_task_id() -> u64 {
    try_with_context(|ctx| ctx.current_task.as_ref().map(|t| t.id().inner()))
        .flatten()
        .unwrap_or(0)
}

/// Worker identity; `None` on I/O and timer threads.
#[track_caller]
pub fn current_worker() -> Option<WorkerInfo> {
    with_context(|ctx| ctx.worker.clone())
}

/// Like [`current_worker`] but never panics.
pub fn try_current_worker() -> Option<WorkerInfo> {
    try_with_context(|ctx| ctx.worker.clone()).flatten()
}

/// Index of this worker inside its pool; `None` on non-worker threads.
#[track_caller]
pub fn current_worker_index() -> Option<usize> {
    with_context(|ctx| ctx.worker.as_ref().map(|w| w.index))
}

#[track_caller]
pub fn current_node() -> Arc<ServiceNode> {
    with_context(|ctx| ctx.node.clone())
}

/// Like [`current_node`] but never panics.
pub fn try_current_node() -> Option<Arc<ServiceNode>> {
    try_with_context(|ctx| ctx.node.clone())
}

/// Node id, or 0 without a context.
pub fn current_node_id() -> u32 {
    try_with_context(|ctx| ctx.node.id()).unwrap_or(0)
}

#[track_caller]
pub fn current_node_name() -> String {
    with_context(|ctx| ctx.node.name().to_string())
}

#[track_caller]
pub fn current_rpc() -> Option<Arc<dyn RpcEngine>> {
    with_context(|ctx| ctx.rpc.clone())
}

#[track_caller]
pub fn current_disk() -> Option<Arc<dyn DiskEngine>> {
    with_context(|ctx| ctx.disk.clone())
}

#[track_caller]
pub fn current_env() -> Arc<dyn EnvProvider> {
    with_context(|ctx| ctx.env.clone())
}

#[track_caller]
pub fn current_nfs() -> Option<Arc<dyn NfsNode>> {
    with_context(|ctx| ctx.nfs.clone())
}

/// Read through the node: the engine installs its timer service after the
/// workers have bound their context.
#[track_caller]
pub fn current_tsvc() -> Option<Arc<dyn TimerService>> {
    with_context(|ctx| ctx.node.tsvc())
}

/// Mark `task` as executing on this thread. Returns the previously current
/// task so nested execution restores it.
#[track_caller]
pub(crate) fn enter_task(task: Arc<Task>) -> Option<Arc<Task>> {
    CONTEXT.with(|cell| match cell.borrow_mut().as_mut() {
        Some(ctx) => ctx.current_task.replace(task),
        None => on_context_not_set(),
    })
}

pub(crate) fn leave_task(previous: Option<Arc<Task>>) {
    // Dropped outside the borrow: the last reference may run destructors
    // that read the context.
    let _left = CONTEXT.with(|cell| {
        cell.borrow_mut()
            .as_mut()
            .and_then(|ctx| std::mem::replace(&mut ctx.current_task, previous))
    });
}
