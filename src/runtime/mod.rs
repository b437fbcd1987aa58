//! Runtime system
//!
//! The task abstraction, the per-thread execution context it runs under, and
//! an in-process engine that executes tasks on named worker pools.

pub mod context;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod task;
pub mod tracker;

pub use context::{set_context, WorkerInfo};
pub use error::{ErrorCode, TaskError, TaskResult};
pub use node::{
    DiskEngine, EnvProvider, NfsNode, RpcEngine, ServiceNode, ServiceNodeBuilder, SystemEnv,
    TaskDispatcher, TimerService,
};
pub use scheduler::{SchedulerStats, TaskEngine};
pub use task::{
    AioTask, CancelResult, Execution, LateTask, Message, PoolCode, RawTask, RpcRequestTask,
    RpcResponseTask, Task, TaskBuilder, TaskCode, TaskId, TaskPriority, TaskState, TaskType,
    TimerTask,
};
pub use tracker::TaskTracker;

#[cfg(test)]
mod tests;
