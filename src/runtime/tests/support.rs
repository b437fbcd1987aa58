//! Shared fixtures for the runtime unit tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::runtime::context;
use crate::runtime::node::{EnvProvider, ServiceNode, TaskDispatcher};
use crate::runtime::task::{PoolCode, Task};

/// Dispatcher that only records admissions; tests drive execution by hand
/// on the calling thread.
#[derive(Debug, Default)]
pub(crate) struct ManualDispatcher {
    queue: Mutex<VecDeque<(Arc<Task>, PoolCode)>>,
    admitted: AtomicU64,
}

impl ManualDispatcher {
    /// Tasks waiting to be run.
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Total admissions seen.
    pub(crate) fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Pool and delay of the oldest pending admission.
    pub(crate) fn peek(&self) -> Option<(PoolCode, u32)> {
        self.queue
            .lock()
            .front()
            .map(|(task, pool)| (*pool, task.delay_ms()))
    }

    /// Run the oldest pending admission. Returns false when none is pending.
    pub(crate) fn run_one(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some((task, _)) => {
                task.exec_internal();
                true
            },
            None => false,
        }
    }

    /// Run admissions until none is pending, including re-admissions.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl TaskDispatcher for ManualDispatcher {
    fn dispatch(
        &self,
        task: Arc<Task>,
        pool: PoolCode,
    ) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back((task, pool));
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub(crate) fn advance_ms(
        &self,
        ms: u64,
    ) {
        self.now_ns.fetch_add(ms * 1_000_000, Ordering::AcqRel);
    }
}

impl EnvProvider for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

/// A node wired to a manual dispatcher and clock, bound to the calling
/// thread.
pub(crate) struct Fixture {
    pub(crate) node: Arc<ServiceNode>,
    pub(crate) dispatcher: Arc<ManualDispatcher>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Fixture {
    pub(crate) fn new(name: &str) -> Self {
        let clock = Arc::new(ManualClock::default());
        let node = ServiceNode::builder(7, name).env(clock.clone()).build();
        let dispatcher = Arc::new(ManualDispatcher::default());
        let weak = Arc::downgrade(&dispatcher);
        let weak: Weak<dyn TaskDispatcher> = weak;
        node.attach_dispatcher(weak);
        context::set_context(node.clone(), None);

        Self {
            node,
            dispatcher,
            clock,
        }
    }

    /// Bind another thread to the same node.
    pub(crate) fn bind_current_thread(&self) {
        context::set_context(self.node.clone(), None);
    }
}
