//! Periodic timer tasks.
//!
//! A timer runs its callback, then asks for another admission after its
//! interval. Cycles are serialized by the task state machine: the next cycle
//! is only admitted once the current one has left `Running`. A cancel that
//! lands during a cycle cannot stop that cycle, but it turns the re-admission
//! into `Cancelled`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Execution, Payload, Task, TaskCode};
use crate::runtime::node::ServiceNode;

type Callback = Box<dyn FnMut() + Send>;

pub(crate) struct TimerBody {
    cb: Mutex<Option<Callback>>,
    interval_ms: u32,
    cycles: AtomicU64,
}

impl TimerBody {
    pub(crate) fn execute(&self) -> Execution {
        let cb = self.cb.lock().take();
        if let Some(mut cb) = cb {
            cb();
            *self.cb.lock() = Some(cb);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);

        if self.interval_ms > 0 {
            Execution::RetryAfter(self.interval_ms)
        } else {
            Execution::Done
        }
    }

    pub(crate) fn release(&self) {
        self.cb.lock().take();
    }
}

/// A task that re-runs every `interval_ms` until cancelled.
#[derive(Clone)]
pub struct TimerTask(Arc<Task>);

task_handle!(TimerTask);

impl TimerTask {
    /// Create a timer on the calling thread's node.
    #[track_caller]
    pub fn new<F>(
        code: TaskCode,
        cb: F,
        interval_ms: u32,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_node(code, cb, interval_ms, 0, None)
    }

    /// Create a timer with an explicit hash and node. An interval of 0 runs
    /// the callback once.
    #[track_caller]
    pub fn with_node<F>(
        code: TaskCode,
        cb: F,
        interval_ms: u32,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let body = TimerBody {
            cb: Mutex::new(Some(Box::new(cb))),
            interval_ms,
            cycles: AtomicU64::new(0),
        };
        TimerTask(Task::with_payload(code, hash, node, Payload::Timer(body)))
    }

    fn body(&self) -> &TimerBody {
        match self.0.payload() {
            Payload::Timer(body) => body,
            _ => unreachable!("TimerTask always wraps a timer payload"),
        }
    }

    #[inline]
    pub fn interval_ms(&self) -> u32 {
        self.body().interval_ms
    }

    /// Number of cycles that have run.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.body().cycles.load(Ordering::Relaxed)
    }
}
