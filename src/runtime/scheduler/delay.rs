//! Delay queue.
//!
//! Holds tasks whose delay has not elapsed yet, ordered by due instant. A
//! dedicated timer thread sleeps until the earliest one is due, or at most
//! the configured resolution, and hands due tasks to their pool.

use anyhow::Context;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::pool::PoolSet;
use super::SchedulerStats;
use crate::runtime::context;
use crate::runtime::node::{ServiceNode, TimerService};
use crate::runtime::task::{PoolCode, Task};

struct Delayed {
    due: Instant,
    // Ties on `due` keep admission order.
    seq: u64,
    task: Arc<Task>,
    pool: PoolCode,
}

impl PartialEq for Delayed {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(
        &self,
        other: &Self,
    ) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    wake: Condvar,
    pools: Arc<PoolSet>,
    resolution: Duration,
    stats: Arc<SchedulerStats>,
}

/// Timer thread plus the tasks it is holding back.
pub struct DelayQueue {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for DelayQueue {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DelayQueue")
            .field("pending", &self.len())
            .field("resolution", &self.shared.resolution)
            .finish()
    }
}

impl DelayQueue {
    /// Spawn the timer thread. It binds itself to `node` without a worker
    /// identity.
    pub(crate) fn start(
        node: &Arc<ServiceNode>,
        pools: Arc<PoolSet>,
        resolution: Duration,
        stats: Arc<SchedulerStats>,
    ) -> anyhow::Result<Arc<DelayQueue>> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            pools,
            resolution,
            stats,
        });

        let thread_shared = shared.clone();
        let thread_node = node.clone();
        let handle = thread::Builder::new()
            .name(format!("{}.timer", node.name()))
            .spawn(move || {
                context::set_context(thread_node, None);
                Self::timer_loop(&thread_shared);
            })
            .context("failed to spawn timer thread")?;

        Ok(Arc::new(DelayQueue {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    fn timer_loop(shared: &Shared) {
        let mut pending = shared.pending.lock();
        while !pending.stopped {
            let now = Instant::now();
            match pending.heap.peek().map(|Reverse(d)| d.due) {
                Some(due) if due <= now => {
                    if let Some(Reverse(item)) = pending.heap.pop() {
                        MutexGuard::unlocked(&mut pending, || {
                            shared.pools.admit(item.task, item.pool);
                        });
                    }
                },
                Some(due) => {
                    shared
                        .wake
                        .wait_for(&mut pending, (due - now).min(shared.resolution));
                },
                None => {
                    shared.wake.wait_for(&mut pending, shared.resolution);
                },
            }
        }
        debug!("timer thread exiting");
    }

    /// Tasks waiting for their delay.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the timer thread. Tasks still waiting are cancelled.
    pub fn stop(&self) {
        let remaining: Vec<Arc<Task>> = {
            let mut pending = self.shared.pending.lock();
            pending.stopped = true;
            pending.heap.drain().map(|Reverse(d)| d.task).collect()
        };
        self.shared.wake.notify_all();

        for task in remaining {
            task.cancel(false);
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl TimerService for DelayQueue {
    fn add_timer(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    ) {
        let due = Instant::now() + Duration::from_millis(task.delay_ms() as u64);
        let mut pending = self.shared.pending.lock();
        if pending.stopped {
            drop(pending);
            warn!(task = %task.id(), code = %task.code(), "timer stopped, task cancelled");
            task.cancel(false);
            return;
        }

        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.heap.push(Reverse(Delayed {
            due,
            seq,
            task,
            pool,
        }));
        drop(pending);

        self.shared.stats.record_delayed();
        self.shared.wake.notify_one();
    }
}
