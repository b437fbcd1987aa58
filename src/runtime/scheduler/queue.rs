//! Task queue for the worker pools
//!
//! Multi-producer, multi-consumer queue with priority lanes. Consumers block
//! on a condition variable until a task arrives, the timeout elapses or the
//! queue is closed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::task::{Task, TaskPriority};

#[derive(Debug, Default)]
struct Lanes {
    high: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
    low: VecDeque<Arc<Task>>,
    closed: bool,
}

impl Lanes {
    fn pop(&mut self) -> Option<Arc<Task>> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// Priority-aware blocking task queue.
///
/// Higher priority lanes are drained first; tasks of equal priority run in
/// admission order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    lanes: Mutex<Lanes>,
    available: Condvar,
}

impl TaskQueue {
    /// Create a new empty queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task with the given priority. Returns false, dropping the
    /// task, once the queue is closed.
    pub fn push(
        &self,
        task: Arc<Task>,
        priority: TaskPriority,
    ) -> bool {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return false;
        }
        match priority {
            TaskPriority::Critical | TaskPriority::High => lanes.high.push_back(task),
            TaskPriority::Normal => lanes.normal.push_back(task),
            TaskPriority::Low => lanes.low.push_back(task),
        }
        drop(lanes);
        self.available.notify_one();
        true
    }

    /// Pop the highest priority task without blocking.
    #[inline]
    pub fn try_pop(&self) -> Option<Arc<Task>> {
        self.lanes.lock().pop()
    }

    /// Pop the highest priority task, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout, and right away when the queue is closed
    /// and empty.
    pub fn pop_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Arc<Task>> {
        let mut lanes = self.lanes.lock();
        loop {
            if let Some(task) = lanes.pop() {
                return Some(task);
            }
            if lanes.closed {
                return None;
            }
            if self.available.wait_for(&mut lanes, timeout).timed_out() {
                return lanes.pop();
            }
        }
    }

    /// Close the queue and wake every consumer. Returns the tasks that were
    /// still queued.
    pub fn close(&self) -> Vec<Arc<Task>> {
        let mut lanes = self.lanes.lock();
        lanes.closed = true;
        let mut remaining = Vec::with_capacity(lanes.len());
        while let Some(task) = lanes.pop() {
            remaining.push(task);
        }
        drop(lanes);
        self.available.notify_all();
        remaining
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    /// Get the number of queued tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
