//! Component teardown through a task tracker
//!
//! A component owns a tracker; its periodic timers and outstanding RPC reply
//! tasks attach to it. Dropping the component cancels them, and a reply that
//! arrives afterwards is refused instead of reaching a dead callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft::runtime::task::{Message, THREAD_POOL_DEFAULT};
use weft::runtime::{
    ErrorCode, PoolCode, RpcResponseTask, ServiceNode, TaskCode, TaskPriority, TaskState,
    TaskTracker, TimerTask,
};

use crate::common;

struct Replica {
    heartbeats: Arc<AtomicUsize>,
    replies: Arc<AtomicUsize>,
    heartbeat: TimerTask,
    pending: Vec<RpcResponseTask>,
    tracker: TaskTracker,
}

impl Replica {
    fn open() -> Self {
        let tracker = TaskTracker::new();
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(AtomicUsize::new(0));

        let code = TaskCode::register_compute("LPC_IT_REPLICA_HEARTBEAT").unwrap();
        let h = heartbeats.clone();
        let heartbeat = TimerTask::new(
            code,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            5,
        );
        heartbeat.set_tracker(&tracker);
        heartbeat.enqueue();

        let rpc = TaskCode::register_rpc(
            "RPC_IT_REPLICA_PREPARE",
            TaskPriority::Normal,
            PoolCode::default_pool(),
            None,
        )
        .unwrap();
        let pending = (0..3)
            .map(|_| {
                let request = Arc::new(Message::new_request(rpc, None, 0, Vec::new()));
                let r = replies.clone();
                let response = RpcResponseTask::new(
                    request,
                    move |_, _, _| {
                        r.fetch_add(1, Ordering::SeqCst);
                    },
                    0,
                    None,
                )
                .unwrap();
                response.set_tracker(&tracker);
                response
            })
            .collect();

        Replica {
            heartbeats,
            replies,
            heartbeat,
            pending,
            tracker,
        }
    }
}

fn wait_for(
    what: impl Fn() -> bool,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while !what() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

#[test]
fn test_drop_cancels_timers_and_pending_replies() {
    let (_node, _engine) = common::start(
        ServiceNode::builder(3, "teardown"),
        &common::config("teardown", &[(THREAD_POOL_DEFAULT, 2)]),
    );

    let replica = Replica::open();
    assert_eq!(replica.tracker.len(), 4);

    let heartbeats = replica.heartbeats.clone();
    assert!(wait_for(
        || heartbeats.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(5)
    ));

    // One reply arrives before shutdown and is delivered.
    assert!(replica.pending[0].enqueue_response(ErrorCode::Ok, None));
    assert!(replica.pending[0].wait(Duration::from_secs(5)));
    assert_eq!(replica.replies.load(Ordering::SeqCst), 1);
    assert!(wait_for(|| replica.tracker.len() == 3, Duration::from_secs(5)));

    let heartbeat = replica.heartbeat.clone();
    let late = replica.pending[1].clone();
    let replies = replica.replies.clone();
    drop(replica);

    assert_eq!(heartbeat.state(), TaskState::Cancelled);
    assert_eq!(late.state(), TaskState::Cancelled);

    let ticks = heartbeats.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(heartbeats.load(Ordering::SeqCst), ticks);

    // The transport answers after the component is gone.
    assert!(!late.enqueue_response(ErrorCode::Ok, None));
    assert_eq!(replies.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_outstanding_keeps_component_usable() {
    let (_node, _engine) = common::start(
        ServiceNode::builder(4, "teardown_reuse"),
        &common::config("teardown_reuse", &[(THREAD_POOL_DEFAULT, 1)]),
    );

    let replica = Replica::open();
    // The heartbeat may be mid-execution; it is flagged rather than moved.
    let cancelled = replica.tracker.cancel_outstanding();
    assert!((3..=4).contains(&cancelled));
    assert!(replica.tracker.is_empty());
    for response in &replica.pending {
        assert!(!response.enqueue_response(ErrorCode::Timeout, None));
    }

    // A task launched after the drain is tracked again.
    let code = TaskCode::register_compute("LPC_IT_REPLICA_FOLLOWUP").unwrap();
    let followup = weft::RawTask::new(code, || {});
    followup.set_tracker(&replica.tracker);
    assert_eq!(replica.tracker.len(), 1);
    followup.enqueue();
    assert!(followup.wait(Duration::from_secs(5)));
    assert!(wait_for(|| replica.tracker.is_empty(), Duration::from_secs(5)));
    assert_eq!(replica.replies.load(Ordering::SeqCst), 0);
}
