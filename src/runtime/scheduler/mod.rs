//! Task engine
//!
//! The in-process implementation of the worker-pool side of the task
//! contract: one [`WorkerPool`] per configured pool, a [`DelayQueue`] for
//! tasks with a delay, and [`SchedulerStats`] shared by both.
//!
//! ```text
//! task.enqueue() -> ServiceNode -> TaskEngine --delay == 0--> WorkerPool queue -> worker
//!                                             --delay  > 0--> DelayQueue --due--^
//! ```
//!
//! The node only holds a weak link to the engine; dropping the last
//! `Arc<TaskEngine>` shuts it down.

pub mod delay;
pub mod pool;
pub mod queue;

pub use delay::DelayQueue;
pub use pool::WorkerPool;
pub use queue::TaskQueue;

use anyhow::Context;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

use crate::runtime::error::TaskResult;
use crate::runtime::node::{ServiceNode, TaskDispatcher, TimerService};
use crate::runtime::task::{PoolCode, Task, THREAD_POOL_DEFAULT};
use crate::util::config::{PoolConfig, RuntimeConfig};
use pool::PoolSet;

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Tasks placed on a pool queue.
    pub tasks_scheduled: AtomicUsize,
    /// Tasks handed to the delay queue.
    pub tasks_delayed: AtomicUsize,
    /// Admissions executed.
    pub tasks_completed: AtomicUsize,
    /// Admissions popped but not executed (cancelled while queued).
    pub tasks_skipped: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Tasks executing right now.
    pub running: AtomicUsize,
    /// Peak number of running tasks.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    /// Record a scheduled task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delayed task.
    #[inline]
    pub fn record_delayed(&self) {
        self.tasks_delayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed admission.
    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Record an admission that was not executed.
    #[inline]
    pub fn record_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one more task running; returns the new count.
    #[inline]
    pub(crate) fn enter(&self) -> usize {
        self.running.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub(crate) fn leave(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::Acquire);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Mean execution time per completed admission.
    pub fn average_exec_time_us(&self) -> f64 {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.total_exec_time_us.load(Ordering::Relaxed) as f64 / completed as f64
    }
}

/// Pools, delay queue and statistics of one node.
#[derive(Debug)]
pub struct TaskEngine {
    node: Arc<ServiceNode>,
    pools: Arc<PoolSet>,
    delay: Arc<DelayQueue>,
    stats: Arc<SchedulerStats>,
    stopped: AtomicBool,
}

impl TaskEngine {
    /// Spawn the configured pools and the timer thread for `node`, and route
    /// the node's tasks through the new engine.
    ///
    /// `config.node_name` must name `node`. A pool named
    /// [`THREAD_POOL_DEFAULT`] is always started; tasks whose pool is not
    /// configured fall back to it. The delay queue becomes the
    /// node's timer service unless the node already has one.
    pub fn start(
        config: &RuntimeConfig,
        node: &Arc<ServiceNode>,
    ) -> anyhow::Result<Arc<TaskEngine>> {
        config.validate().context("invalid runtime config")?;
        if config.node_name != node.name() {
            anyhow::bail!(
                "runtime config is for node `{}`, not `{}`",
                config.node_name,
                node.name()
            );
        }

        let mut pool_configs = config.pools.clone();
        if config.pool(THREAD_POOL_DEFAULT).is_none() {
            pool_configs.push(PoolConfig::new(THREAD_POOL_DEFAULT, 1));
        }

        let stats = Arc::new(SchedulerStats::default());
        let idle_timeout = Duration::from_millis(config.idle_timeout_ms.max(1));

        let mut pools = IndexMap::new();
        for pool_config in &pool_configs {
            match WorkerPool::start(node, pool_config, idle_timeout, stats.clone()) {
                Ok(pool) => {
                    pools.insert(pool.code(), pool);
                },
                Err(err) => {
                    pools.values().for_each(|p: &Arc<WorkerPool>| p.shutdown());
                    return Err(err);
                },
            }
        }
        let pools = Arc::new(PoolSet::new(pools, PoolCode::default_pool()));

        let resolution = Duration::from_millis(config.timer_resolution_ms.max(1));
        let delay = match DelayQueue::start(node, pools.clone(), resolution, stats.clone()) {
            Ok(delay) => delay,
            Err(err) => {
                pools.iter().for_each(|p| p.shutdown());
                return Err(err);
            },
        };
        node.install_tsvc(delay.clone());

        let engine = Arc::new(TaskEngine {
            node: node.clone(),
            pools,
            delay,
            stats,
            stopped: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&engine);
        let dispatcher: Weak<dyn TaskDispatcher> = weak;
        node.attach_dispatcher(dispatcher);

        info!(
            node = %node.name(),
            pools = pool_configs.len(),
            "task engine started"
        );
        Ok(engine)
    }

    #[inline]
    pub fn node(&self) -> &Arc<ServiceNode> {
        &self.node
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// The pool running `code`.
    pub fn pool(
        &self,
        code: PoolCode,
    ) -> TaskResult<Arc<WorkerPool>> {
        self.pools.get(code).cloned()
    }

    /// Codes of the running pools.
    pub fn pool_codes(&self) -> Vec<PoolCode> {
        self.pools.iter().map(|p| p.code()).collect()
    }

    /// Tasks waiting for their delay.
    pub fn delayed(&self) -> usize {
        self.delay.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the timer thread and the pools, join them, then detach from the
    /// node. Queued and delayed tasks are cancelled, and so is any task a
    /// running worker re-admits while the engine stops. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.delay.stop();
        for pool in self.pools.iter() {
            pool.shutdown();
        }
        // Detached last: re-admissions from workers still finishing must
        // reach `dispatch` and be cancelled there.
        self.node.detach_dispatcher();

        info!(
            node = %self.node.name(),
            completed = self.stats.tasks_completed.load(Ordering::Relaxed),
            "task engine stopped"
        );
    }
}

impl TaskDispatcher for TaskEngine {
    fn dispatch(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    ) {
        if self.is_stopped() {
            warn!(task = %task.id(), code = %task.code(), "engine stopped, task cancelled");
            task.cancel(false);
            return;
        }

        if task.delay_ms() > 0 {
            self.delay.add_timer(task, pool);
        } else {
            self.pools.admit(task, pool);
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
