//! Weft
//!
//! Reference-counted task core and thread-local dispatch context for
//! distributed-systems runtimes. RPC dispatch, RPC reply delivery, disk I/O
//! completion, timers and plain callbacks are all [`Task`]s sharing one
//! state machine: enqueue, execute once per admission, retry, cancel, wait.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use weft::runtime::{ServiceNode, TaskBuilder, TaskCode, TaskEngine};
//! use weft::util::config::RuntimeConfig;
//!
//! fn main() -> weft::Result<()> {
//!     let config = RuntimeConfig {
//!         node_name: "replica1".to_string(),
//!         ..RuntimeConfig::default()
//!     };
//!     let node = ServiceNode::builder(1, &config.node_name).build();
//!     let engine = TaskEngine::start(&config, &node)?;
//!
//!     let code = TaskCode::register_compute("LPC_HELLO")?;
//!     let task = TaskBuilder::new(code)
//!         .node(node.clone())
//!         .raw(|| tracing::info!("hello from a worker"));
//!     task.enqueue();
//!     task.wait(Duration::from_secs(1));
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use runtime::{
    AioTask, ErrorCode, Execution, RawTask, RpcRequestTask, RpcResponseTask, ServiceNode, Task,
    TaskBuilder, TaskCode, TaskEngine, TaskState, TaskTracker, TimerTask,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
