//! Named worker pools.
//!
//! A pool owns `worker_count` threads. A shared pool feeds all of them from
//! one queue; a partitioned pool gives each worker its own queue and routes
//! a task to worker `hash % worker_count`, so tasks with the same hash run
//! sequentially in admission order.

use anyhow::Context;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::queue::TaskQueue;
use super::SchedulerStats;
use crate::runtime::context::{self, WorkerInfo};
use crate::runtime::error::{TaskError, TaskResult};
use crate::runtime::node::ServiceNode;
use crate::runtime::task::{PoolCode, Task, TaskState};
use crate::util::config::PoolConfig;

/// One named pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    code: PoolCode,
    partitioned: bool,
    queues: Vec<Arc<TaskQueue>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl WorkerPool {
    /// Spawn the pool's workers. Each worker binds itself to `node` before
    /// taking its first task.
    pub fn start(
        node: &Arc<ServiceNode>,
        config: &PoolConfig,
        idle_timeout: Duration,
        stats: Arc<SchedulerStats>,
    ) -> anyhow::Result<Arc<WorkerPool>> {
        let code = PoolCode::register(&config.name);
        let worker_count = config.worker_count.max(1);
        let queue_count = if config.partitioned { worker_count } else { 1 };
        let queues: Vec<Arc<TaskQueue>> = (0..queue_count)
            .map(|_| Arc::new(TaskQueue::new()))
            .collect();
        let running = Arc::new(AtomicBool::new(true));

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let info = WorkerInfo {
                pool: code,
                index,
                name: format!("{}.{}.{}", node.name(), config.name, index),
            };
            let node = node.clone();
            let queue = queues[index % queue_count].clone();
            let worker_running = running.clone();
            let stats = stats.clone();

            let spawned = thread::Builder::new()
                .name(info.name.clone())
                .spawn(move || {
                    context::set_context(node, Some(info));
                    Self::worker_loop(&queue, &worker_running, &stats, idle_timeout);
                })
                .with_context(|| format!("failed to spawn worker {} of pool {}", index, config.name));

            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    // Let the workers already spawned run out.
                    running.store(false, Ordering::Release);
                    queues.iter().for_each(|q| {
                        q.close();
                    });
                    return Err(err);
                },
            }
        }

        debug!(
            pool = %config.name,
            workers = worker_count,
            partitioned = config.partitioned,
            "worker pool started"
        );

        Ok(Arc::new(WorkerPool {
            code,
            partitioned: config.partitioned,
            queues,
            workers: Mutex::new(workers),
            running,
            stats,
        }))
    }

    /// Worker thread main loop.
    fn worker_loop(
        queue: &TaskQueue,
        running: &AtomicBool,
        stats: &SchedulerStats,
        idle_timeout: Duration,
    ) {
        while running.load(Ordering::Acquire) {
            match queue.pop_timeout(idle_timeout) {
                Some(task) => Self::execute_task(&task, stats),
                None if queue.is_closed() => break,
                None => {},
            }
        }
        trace!("worker exiting");
    }

    /// Execute one admission of a task.
    fn execute_task(
        task: &Arc<Task>,
        stats: &SchedulerStats,
    ) {
        if task.state() != TaskState::Ready {
            stats.record_skipped();
            return;
        }

        let running = stats.enter();
        stats.update_parallelism(running);
        let start = Instant::now();

        task.exec_internal();

        stats.leave();
        stats.record_completed(start.elapsed().as_micros() as usize);
    }

    /// Queue `task` on this pool.
    pub fn enqueue(
        &self,
        task: Arc<Task>,
    ) {
        let queue = &self.queues[self.queue_index(task.hash())];
        let priority = task.spec().priority;
        if queue.push(task.clone(), priority) {
            self.stats.record_scheduled();
        } else {
            warn!(pool = %self.code, task = %task.id(), "pool stopped, task cancelled");
            task.cancel(false);
        }
    }

    #[inline]
    fn queue_index(
        &self,
        hash: u64,
    ) -> usize {
        (hash % self.queues.len() as u64) as usize
    }

    #[inline]
    pub fn code(&self) -> PoolCode {
        self.code
    }

    #[inline]
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    /// Get the number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Tasks waiting in the pool's queues.
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Stop the workers and join them.
    ///
    /// Tasks still queued are cancelled so their waiters wake up. A worker
    /// calling this on its own pool is not joined.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for queue in &self.queues {
            for task in queue.close() {
                task.cancel(false);
            }
        }

        let me = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                warn!(pool = %self.code, "worker panicked");
            }
        }
        debug!(pool = %self.code, "worker pool stopped");
    }
}

/// The pools of one engine, by code.
#[derive(Debug)]
pub(crate) struct PoolSet {
    pools: IndexMap<PoolCode, Arc<WorkerPool>>,
    fallback: PoolCode,
}

impl PoolSet {
    pub(crate) fn new(
        pools: IndexMap<PoolCode, Arc<WorkerPool>>,
        fallback: PoolCode,
    ) -> Self {
        Self { pools, fallback }
    }

    pub(crate) fn get(
        &self,
        code: PoolCode,
    ) -> TaskResult<&Arc<WorkerPool>> {
        self.pools
            .get(&code)
            .ok_or_else(|| TaskError::UnknownPool(code.name()))
    }

    /// Queue `task` on `pool`, or on the fallback pool when the engine does
    /// not run `pool`.
    pub(crate) fn admit(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    ) {
        match self.get(pool) {
            Ok(p) => p.enqueue(task),
            Err(err) => {
                warn!(task = %task.id(), code = %task.code(), %err, "using fallback pool");
                if let Some(p) = self.pools.get(&self.fallback) {
                    p.enqueue(task);
                }
            },
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<WorkerPool>> {
        self.pools.values()
    }
}
