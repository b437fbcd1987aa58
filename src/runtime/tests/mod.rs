//! 执行上下文与 TaskTracker 单元测试

pub(crate) mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::runtime::context;
use crate::runtime::task::{RawTask, TaskCode, TaskState};
use crate::runtime::tracker::TaskTracker;
use support::Fixture;

#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn test_no_context_non_fatal_accessors() {
        thread::spawn(|| {
            assert!(!context::is_initialized());
            assert!(context::try_current_node().is_none());
            assert!(context::try_current_worker().is_none());
            assert_eq!(context::current_task_id(), 0);
            assert_eq!(context::current_node_id(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_no_context_is_fatal() {
        let result = thread::spawn(|| {
            context::current_node();
        })
        .join();
        assert!(result.is_err());
    }

    #[test]
    fn test_task_creation_without_context_is_fatal() {
        let code = TaskCode::register_compute("LPC_CTX_NO_CONTEXT").unwrap();
        let result = thread::spawn(move || {
            RawTask::new(code, || {});
        })
        .join();
        assert!(result.is_err());
    }

    #[test]
    fn test_set_context_binds_node() {
        let fx = Fixture::new("ctx_node");
        assert!(context::is_initialized());
        assert_eq!(context::current_node_name(), "ctx_node");
        assert_eq!(context::current_node_id(), 7);
        assert!(context::current_worker().is_none());
        assert!(context::current_worker_index().is_none());
        assert!(context::current_rpc().is_none());
        assert!(context::current_disk().is_none());
        assert!(context::current_nfs().is_none());
        assert!(context::current_tsvc().is_none());
        assert!(context::current_task().is_none());

        fx.clock.advance_ms(3);
        assert_eq!(context::current_env().now_ms(), 3);
    }

    #[test]
    fn test_current_task_inside_execution() {
        let fx = Fixture::new("ctx_current");
        let code = TaskCode::register_compute("LPC_CTX_CURRENT").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let task = RawTask::new(code, move || {
            let current = context::current_task().unwrap();
            s.store(current.id().inner() as usize, Ordering::SeqCst);
            assert_eq!(context::current_task_id(), current.id().inner());
        });
        task.enqueue();
        fx.dispatcher.run_all();

        assert_eq!(seen.load(Ordering::SeqCst), task.id().inner() as usize);
        assert!(context::current_task().is_none());
    }
}

#[cfg(test)]
mod tracker_tests {
    use super::*;

    #[test]
    fn test_tracker_detaches_finished_task() {
        let fx = Fixture::new("tracker_detach");
        let code = TaskCode::register_compute("LPC_TRACKER_DETACH").unwrap();
        let tracker = TaskTracker::new();

        let task = RawTask::new(code, || {});
        task.set_tracker(&tracker);
        assert_eq!(tracker.len(), 1);
        assert!(task.has_tracker());

        task.enqueue();
        fx.dispatcher.run_all();
        assert_eq!(task.state(), TaskState::Finished);
        assert!(tracker.is_empty());
        assert!(!task.has_tracker());
    }

    #[test]
    fn test_tracker_skips_terminal_task() {
        let _fx = Fixture::new("tracker_terminal");
        let code = TaskCode::register_compute("LPC_TRACKER_TERMINAL").unwrap();
        let tracker = TaskTracker::new();

        let task = RawTask::new(code, || {});
        task.cancel(false);
        task.set_tracker(&tracker);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_drop_cancels_outstanding() {
        let fx = Fixture::new("tracker_drop");
        let code = TaskCode::register_compute("LPC_TRACKER_DROP").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let tracker = TaskTracker::new();
        let tasks: Vec<RawTask> = (0..3)
            .map(|_| {
                let r = ran.clone();
                let task = RawTask::new(code, move || {
                    r.fetch_add(1, Ordering::SeqCst);
                });
                task.set_tracker(&tracker);
                task.enqueue();
                task
            })
            .collect();
        assert_eq!(tracker.len(), 3);

        drop(tracker);
        for task in &tasks {
            assert_eq!(task.state(), TaskState::Cancelled);
            assert!(!task.has_tracker());
        }

        fx.dispatcher.run_all();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_outstanding_counts() {
        let fx = Fixture::new("tracker_count");
        let code = TaskCode::register_compute("LPC_TRACKER_COUNT").unwrap();
        let tracker = TaskTracker::new();

        let finished = RawTask::new(code, || {});
        finished.set_tracker(&tracker);
        finished.enqueue();
        fx.dispatcher.run_all();

        for _ in 0..2 {
            RawTask::new(code, || {}).set_tracker(&tracker);
        }
        assert_eq!(tracker.cancel_outstanding(), 2);
        assert!(tracker.is_empty());
        assert_eq!(tracker.cancel_outstanding(), 0);
    }

    #[test]
    fn test_drop_waits_for_running_task() {
        let fx = Arc::new(Fixture::new("tracker_wait"));
        let code = TaskCode::register_compute("LPC_TRACKER_WAIT").unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();

        let tracker = TaskTracker::new();
        let d = done.clone();
        let task = RawTask::new(code, move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            d.store(true, Ordering::SeqCst);
        });
        task.set_tracker(&tracker);
        task.enqueue();

        let worker_fx = fx.clone();
        let worker = thread::spawn(move || {
            worker_fx.bind_current_thread();
            worker_fx.dispatcher.run_all();
        });

        started_rx.recv().unwrap();
        drop(tracker);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Finished);
        worker.join().unwrap();
    }
}
