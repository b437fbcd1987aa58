//! Task tracker.
//!
//! A component that launches tasks capturing references to itself owns a
//! [`TaskTracker`]. Tasks attach with [`Task::set_tracker`] and detach on
//! their own once they finish or are cancelled. Dropping the tracker cancels
//! everything still attached and waits for in-flight executions, so none of
//! them can observe the component after it is gone.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::runtime::task::{Task, TaskId};

/// Shared half of the tracker, referenced weakly from attached tasks.
#[derive(Debug, Default)]
pub(crate) struct TrackerShared {
    tasks: Mutex<IndexMap<TaskId, Arc<Task>>>,
}

impl TrackerShared {
    pub(crate) fn remove(
        &self,
        id: TaskId,
    ) {
        self.tasks.lock().shift_remove(&id);
    }
}

/// Registry of the outstanding tasks of one component.
#[derive(Debug, Default)]
pub struct TaskTracker {
    shared: Arc<TrackerShared>,
}

impl TaskTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached tasks.
    pub fn len(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Whether no task is attached.
    pub fn is_empty(&self) -> bool {
        self.shared.tasks.lock().is_empty()
    }

    /// Cancel every attached task, waiting for executions in flight.
    /// Returns how many tasks this call moved to `Cancelled`.
    pub fn cancel_outstanding(&self) -> usize {
        let snapshot: Vec<Arc<Task>> = {
            let mut tasks = self.shared.tasks.lock();
            tasks.drain(..).map(|(_, task)| task).collect()
        };

        let mut cancelled = 0;
        for task in &snapshot {
            if task.cancel(true).cancelled {
                cancelled += 1;
            }
        }

        if !snapshot.is_empty() {
            debug!(outstanding = snapshot.len(), cancelled, "tracker drained");
        }
        cancelled
    }

    pub(crate) fn downgrade(&self) -> Weak<TrackerShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn attach(
        &self,
        task: Arc<Task>,
    ) {
        self.shared.tasks.lock().insert(task.id(), task);
    }

    pub(crate) fn detach(
        &self,
        id: TaskId,
    ) {
        self.shared.remove(id);
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        self.cancel_outstanding();
    }
}
