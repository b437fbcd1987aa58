//! Task codes, thread pool codes and the static task spec registry.
//!
//! Every task carries a [`TaskCode`]. The code selects a [`TaskSpec`]: a
//! descriptor registered once per process that names the task, says what kind
//! of work it is, which thread pool runs it and, for RPC codes, which code the
//! reply is delivered under.
//!
//! Specs are leaked on registration so they can be handed out as
//! `&'static TaskSpec` without reference counting on the hot path.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt;

use crate::runtime::error::{TaskError, TaskResult};

/// Name of the pool every process has.
pub const THREAD_POOL_DEFAULT: &str = "THREAD_POOL_DEFAULT";

/// Default client timeout for RPC codes registered without one.
pub const DEFAULT_RPC_TIMEOUT_MS: u32 = 5000;

/// Identifier of a named worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolCode(u32);

/// Identifier of a registered task spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskCode(u32);

/// What kind of work a code describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Plain callbacks and timers.
    Compute,
    /// Inbound RPC request dispatch.
    RpcRequest,
    /// Outbound RPC reply delivery.
    RpcResponse,
    /// Disk I/O completion.
    Aio,
}

/// Task priority levels.
///
/// Pools drain higher lanes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default, Hash)]
pub enum TaskPriority {
    /// Low priority tasks.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority tasks.
    High = 2,
    /// Critical priority tasks.
    Critical = 3,
}

/// Static descriptor of a task code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// The code this spec is registered under.
    pub code: TaskCode,
    /// Unique name, e.g. `RPC_PREPARE` or `LPC_CHECKPOINT_TIMER`.
    pub name: String,
    /// Kind of work.
    pub task_type: TaskType,
    /// Queue lane inside the pool.
    pub priority: TaskPriority,
    /// Pool that runs tasks of this code.
    pub pool: PoolCode,
    /// Client timeout for RPC requests of this code.
    pub rpc_timeout_ms: u32,
    /// Request code for an `_ACK` code and the `_ACK` code for a request code.
    pub rpc_paired_code: Option<TaskCode>,
}

#[derive(Default)]
struct Registry {
    specs: Vec<&'static TaskSpec>,
    codes: IndexMap<String, TaskCode>,
    pools: IndexMap<String, PoolCode>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

impl PoolCode {
    /// Register a pool name, or return the code it already has.
    pub fn register(name: &str) -> PoolCode {
        if let Some(code) = REGISTRY.read().pools.get(name) {
            return *code;
        }

        let mut registry = REGISTRY.write();
        let next = PoolCode(registry.pools.len() as u32);
        *registry.pools.entry(name.to_string()).or_insert(next)
    }

    /// The pool named [`THREAD_POOL_DEFAULT`].
    #[inline]
    pub fn default_pool() -> PoolCode {
        PoolCode::register(THREAD_POOL_DEFAULT)
    }

    /// Look up a pool by name.
    pub fn lookup(name: &str) -> Option<PoolCode> {
        REGISTRY.read().pools.get(name).copied()
    }

    /// The registered name.
    pub fn name(&self) -> String {
        REGISTRY
            .read()
            .pools
            .get_index(self.0 as usize)
            .map(|(name, _)| name.clone())
            .unwrap_or_default()
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PoolCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TaskCode {
    /// Register a code.
    ///
    /// Registering the same name again with the same shape returns the
    /// existing code; a different shape is an error.
    pub fn register(
        name: &str,
        task_type: TaskType,
        priority: TaskPriority,
        pool: PoolCode,
    ) -> TaskResult<TaskCode> {
        let mut registry = REGISTRY.write();
        if let Some(existing) = registry.codes.get(name).copied() {
            let spec = registry.specs[existing.0 as usize];
            if spec.task_type == task_type && spec.priority == priority && spec.pool == pool {
                return Ok(existing);
            }
            return Err(TaskError::DuplicateCode(name.to_string()));
        }

        let code = TaskCode(registry.specs.len() as u32);
        let spec: &'static TaskSpec = Box::leak(Box::new(TaskSpec {
            code,
            name: name.to_string(),
            task_type,
            priority,
            pool,
            rpc_timeout_ms: 0,
            rpc_paired_code: None,
        }));
        registry.specs.push(spec);
        registry.codes.insert(name.to_string(), code);
        Ok(code)
    }

    /// Register a plain compute code on the default pool.
    #[inline]
    pub fn register_compute(name: &str) -> TaskResult<TaskCode> {
        TaskCode::register(
            name,
            TaskType::Compute,
            TaskPriority::Normal,
            PoolCode::default_pool(),
        )
    }

    /// Register a disk completion code on `pool`.
    #[inline]
    pub fn register_aio(
        name: &str,
        pool: PoolCode,
    ) -> TaskResult<TaskCode> {
        TaskCode::register(name, TaskType::Aio, TaskPriority::Normal, pool)
    }

    /// Register an RPC code and its `<name>_ACK` reply code.
    ///
    /// Both run on `pool`. The request code is returned; the reply code is
    /// reachable through [`TaskSpec::rpc_paired_code`].
    pub fn register_rpc(
        name: &str,
        priority: TaskPriority,
        pool: PoolCode,
        timeout_ms: Option<u32>,
    ) -> TaskResult<TaskCode> {
        let ack_name = format!("{}_ACK", name);
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_RPC_TIMEOUT_MS);

        let mut registry = REGISTRY.write();
        if let Some(existing) = registry.codes.get(name).copied() {
            let spec = registry.specs[existing.0 as usize];
            if spec.task_type == TaskType::RpcRequest
                && spec.priority == priority
                && spec.pool == pool
                && spec.rpc_timeout_ms == timeout_ms
            {
                return Ok(existing);
            }
            return Err(TaskError::DuplicateCode(name.to_string()));
        }
        if registry.codes.contains_key(&ack_name) {
            return Err(TaskError::DuplicateCode(ack_name));
        }

        let request = TaskCode(registry.specs.len() as u32);
        let ack = TaskCode(request.0 + 1);

        let request_spec: &'static TaskSpec = Box::leak(Box::new(TaskSpec {
            code: request,
            name: name.to_string(),
            task_type: TaskType::RpcRequest,
            priority,
            pool,
            rpc_timeout_ms: timeout_ms,
            rpc_paired_code: Some(ack),
        }));
        let ack_spec: &'static TaskSpec = Box::leak(Box::new(TaskSpec {
            code: ack,
            name: ack_name.clone(),
            task_type: TaskType::RpcResponse,
            priority,
            pool,
            rpc_timeout_ms: timeout_ms,
            rpc_paired_code: Some(request),
        }));

        registry.specs.push(request_spec);
        registry.specs.push(ack_spec);
        registry.codes.insert(name.to_string(), request);
        registry.codes.insert(ack_name, ack);
        Ok(request)
    }

    /// Look up a code by name.
    pub fn lookup(name: &str) -> Option<TaskCode> {
        REGISTRY.read().codes.get(name).copied()
    }

    /// Resolve a raw code value received from elsewhere in the process.
    pub fn from_raw(value: u32) -> TaskResult<TaskCode> {
        if (value as usize) < REGISTRY.read().specs.len() {
            Ok(TaskCode(value))
        } else {
            Err(TaskError::UnknownTaskCode(value))
        }
    }

    /// The static spec. Codes are only minted by the registry, so this
    /// always resolves.
    #[inline]
    pub fn spec(&self) -> &'static TaskSpec {
        REGISTRY.read().specs[self.0 as usize]
    }

    /// The registered name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.spec().name.as_str()
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
