//! Service nodes and the facilities reachable from a node.
//!
//! A [`ServiceNode`] is one service instance inside the process. Tasks run
//! under a node, and every thread that touches the task API is bound to one
//! through its execution context. The RPC, disk, environment, NFS and timer
//! facilities are collaborators implemented elsewhere; the core only stores
//! them and forwards access.

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

use crate::runtime::task::{AioTask, Message, PoolCode, RpcResponseTask, Task};

/// Outbound half of the RPC transport.
pub trait RpcEngine: Send + Sync {
    /// Send `request`; the engine calls
    /// [`RpcResponseTask::enqueue_response`] exactly once with the outcome.
    fn call(
        &self,
        request: Arc<Message>,
        response: RpcResponseTask,
    );

    /// Send a reply produced by a request handler.
    fn reply(
        &self,
        reply: Arc<Message>,
    );
}

/// Disk I/O engine.
pub trait DiskEngine: Send + Sync {
    /// Submit the I/O described by the task; the engine calls
    /// [`AioTask::enqueue_aio`] exactly once on completion.
    fn submit(
        &self,
        task: AioTask,
    );
}

/// Clock and host environment.
pub trait EnvProvider: Send + Sync {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;

    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }
}

/// Remote file copy service.
pub trait NfsNode: Send + Sync {
    /// Copy `files` from `source_dir` on `source` into `dest_dir`, completing
    /// through `task`.
    fn copy_remote_files(
        &self,
        source: &str,
        source_dir: &str,
        files: &[String],
        dest_dir: &str,
        task: AioTask,
    );
}

/// Holds tasks until their delay elapses, then admits them.
pub trait TimerService: Send + Sync {
    /// Admit `task` on `pool` after `task.delay_ms()`.
    fn add_timer(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    );
}

/// Worker pool side of the task contract.
pub trait TaskDispatcher: Send + Sync {
    /// Place `task` on `pool`, honoring its delay.
    fn dispatch(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    );
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// [`EnvProvider`] backed by the process monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl EnvProvider for SystemEnv {
    fn now_ns(&self) -> u64 {
        PROCESS_START.elapsed().as_nanos() as u64
    }
}

/// One service instance.
pub struct ServiceNode {
    id: u32,
    name: String,
    rpc: Option<Arc<dyn RpcEngine>>,
    disk: Option<Arc<dyn DiskEngine>>,
    env: Arc<dyn EnvProvider>,
    nfs: Option<Arc<dyn NfsNode>>,
    tsvc: OnceCell<Arc<dyn TimerService>>,
    dispatcher: RwLock<Option<Weak<dyn TaskDispatcher>>>,
}

impl fmt::Debug for ServiceNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ServiceNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rpc", &self.rpc.is_some())
            .field("disk", &self.disk.is_some())
            .field("nfs", &self.nfs.is_some())
            .field("tsvc", &self.tsvc.get().is_some())
            .finish()
    }
}

impl ServiceNode {
    /// Start building a node.
    #[inline]
    pub fn builder(
        id: u32,
        name: impl Into<String>,
    ) -> ServiceNodeBuilder {
        ServiceNodeBuilder::new(id, name)
    }

    /// Node id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Node name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn rpc(&self) -> Option<Arc<dyn RpcEngine>> {
        self.rpc.clone()
    }

    #[inline]
    pub fn disk(&self) -> Option<Arc<dyn DiskEngine>> {
        self.disk.clone()
    }

    #[inline]
    pub fn env(&self) -> Arc<dyn EnvProvider> {
        self.env.clone()
    }

    #[inline]
    pub fn nfs(&self) -> Option<Arc<dyn NfsNode>> {
        self.nfs.clone()
    }

    #[inline]
    pub fn tsvc(&self) -> Option<Arc<dyn TimerService>> {
        self.tsvc.get().cloned()
    }

    /// Install the timer service if none was configured. Returns whether
    /// `tsvc` was installed.
    pub fn install_tsvc(
        &self,
        tsvc: Arc<dyn TimerService>,
    ) -> bool {
        self.tsvc.set(tsvc).is_ok()
    }

    /// Route this node's tasks through `dispatcher`. The node keeps only a
    /// weak reference; the owner of the dispatcher decides its lifetime.
    pub fn attach_dispatcher(
        &self,
        dispatcher: Weak<dyn TaskDispatcher>,
    ) {
        *self.dispatcher.write() = Some(dispatcher);
        debug!(node = %self.name, "dispatcher attached");
    }

    /// Stop routing tasks.
    pub fn detach_dispatcher(&self) {
        *self.dispatcher.write() = None;
        debug!(node = %self.name, "dispatcher detached");
    }

    /// Whether a live dispatcher is attached.
    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    pub(crate) fn dispatch(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    ) {
        let dispatcher = self.dispatcher.read().as_ref().and_then(Weak::upgrade);
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(task, pool),
            None => {
                warn!(
                    node = %self.name,
                    task = %task.id(),
                    code = %task.code(),
                    "no dispatcher attached, task cancelled"
                );
                task.cancel(false);
            },
        }
    }
}

/// Builder for [`ServiceNode`].
pub struct ServiceNodeBuilder {
    id: u32,
    name: String,
    rpc: Option<Arc<dyn RpcEngine>>,
    disk: Option<Arc<dyn DiskEngine>>,
    env: Option<Arc<dyn EnvProvider>>,
    nfs: Option<Arc<dyn NfsNode>>,
    tsvc: Option<Arc<dyn TimerService>>,
}

impl ServiceNodeBuilder {
    fn new(
        id: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            rpc: None,
            disk: None,
            env: None,
            nfs: None,
            tsvc: None,
        }
    }

    pub fn rpc(
        mut self,
        rpc: Arc<dyn RpcEngine>,
    ) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn disk(
        mut self,
        disk: Arc<dyn DiskEngine>,
    ) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn env(
        mut self,
        env: Arc<dyn EnvProvider>,
    ) -> Self {
        self.env = Some(env);
        self
    }

    pub fn nfs(
        mut self,
        nfs: Arc<dyn NfsNode>,
    ) -> Self {
        self.nfs = Some(nfs);
        self
    }

    pub fn tsvc(
        mut self,
        tsvc: Arc<dyn TimerService>,
    ) -> Self {
        self.tsvc = Some(tsvc);
        self
    }

    /// Build the node. The environment defaults to [`SystemEnv`].
    pub fn build(self) -> Arc<ServiceNode> {
        let tsvc = OnceCell::new();
        if let Some(t) = self.tsvc {
            let _ = tsvc.set(t);
        }

        Arc::new(ServiceNode {
            id: self.id,
            name: self.name,
            rpc: self.rpc,
            disk: self.disk,
            env: self.env.unwrap_or_else(|| Arc::new(SystemEnv)),
            nfs: self.nfs,
            tsvc,
            dispatcher: RwLock::new(None),
        })
    }
}
