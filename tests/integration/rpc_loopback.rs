//! RPC round trips over an in-process loopback transport
//!
//! The transport dispatches each call as an `RpcRequestTask` on the same
//! node; the handler replies through `context::current_rpc()`, and the reply
//! completes the caller's `RpcResponseTask`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use weft::runtime::context;
use weft::runtime::task::{Message, THREAD_POOL_DEFAULT};
use weft::runtime::{
    ErrorCode, PoolCode, RpcEngine, RpcRequestTask, RpcResponseTask, ServiceNode, TaskCode,
    TaskPriority,
};

use crate::common;

#[derive(Default)]
struct Loopback {
    node: OnceCell<Weak<ServiceNode>>,
    pending: Mutex<HashMap<u64, RpcResponseTask>>,
    lose_requests: AtomicBool,
}

impl Loopback {
    fn bind(
        &self,
        node: &Arc<ServiceNode>,
    ) {
        let _ = self.node.set(Arc::downgrade(node));
    }
}

impl RpcEngine for Loopback {
    fn call(
        &self,
        request: Arc<Message>,
        response: RpcResponseTask,
    ) {
        if self.lose_requests.load(Ordering::SeqCst) {
            response.enqueue_response(ErrorCode::Timeout, None);
            return;
        }

        let server = self.node.get().and_then(Weak::upgrade);
        self.pending.lock().insert(request.header.rpc_id, response);
        let task = RpcRequestTask::new(
            request,
            |msg| {
                let mut body = msg.body().to_vec();
                body.reverse();
                let reply = msg.create_response(body).expect("rpc code has an ack");
                context::current_rpc().expect("node has rpc").reply(reply);
            },
            server,
        );
        task.enqueue();
    }

    fn reply(
        &self,
        reply: Arc<Message>,
    ) {
        let response = self.pending.lock().remove(&reply.header.rpc_id);
        if let Some(response) = response {
            response.enqueue_response(ErrorCode::Ok, Some(reply));
        }
    }
}

fn loopback_node(
    name: &str,
    pools: &[(&str, usize)],
) -> (Arc<Loopback>, Arc<ServiceNode>, Arc<weft::TaskEngine>) {
    let rpc = Arc::new(Loopback::default());
    let (node, engine) = common::start(
        ServiceNode::builder(1, name).rpc(rpc.clone()),
        &common::config(name, pools),
    );
    rpc.bind(&node);
    (rpc, node, engine)
}

type Outcome = Arc<Mutex<Option<(ErrorCode, Option<Vec<u8>>)>>>;

fn call(
    node: &Arc<ServiceNode>,
    code: TaskCode,
    body: &[u8],
) -> (RpcResponseTask, Outcome) {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let request = Arc::new(Message::new_request(code, None, 0, body.to_vec()));

    let o = outcome.clone();
    let response = RpcResponseTask::new(
        request.clone(),
        move |err, _, reply| *o.lock() = Some((err, reply.map(|r| r.body().to_vec()))),
        0,
        None,
    )
    .unwrap();
    node.rpc().unwrap().call(request, response.clone());
    (response, outcome)
}

#[test]
fn test_rpc_round_trip() {
    let (_rpc, node, _engine) = loopback_node("rpc_round_trip", &[(THREAD_POOL_DEFAULT, 2)]);
    let code = TaskCode::register_rpc(
        "RPC_IT_ECHO",
        TaskPriority::Normal,
        PoolCode::default_pool(),
        None,
    )
    .unwrap();

    let (response, outcome) = call(&node, code, b"abc");
    assert!(response.wait(Duration::from_secs(5)));
    assert_eq!(*outcome.lock(), Some((ErrorCode::Ok, Some(b"cba".to_vec()))));
    assert_eq!(response.error(), ErrorCode::Ok);
}

#[test]
fn test_rpc_many_calls() {
    let (rpc, node, _engine) = loopback_node("rpc_many", &[(THREAD_POOL_DEFAULT, 4)]);
    let code = TaskCode::register_rpc(
        "RPC_IT_MANY",
        TaskPriority::High,
        PoolCode::default_pool(),
        None,
    )
    .unwrap();

    let calls: Vec<_> = (0..32u8).map(|i| call(&node, code, &[i, 0])).collect();
    for (i, (response, outcome)) in calls.iter().enumerate() {
        assert!(response.wait(Duration::from_secs(5)));
        assert_eq!(*outcome.lock(), Some((ErrorCode::Ok, Some(vec![0, i as u8]))));
    }
    assert!(rpc.pending.lock().is_empty());
}

#[test]
fn test_rpc_timeout_reported_to_callback() {
    let (rpc, node, _engine) = loopback_node("rpc_timeout", &[(THREAD_POOL_DEFAULT, 1)]);
    rpc.lose_requests.store(true, Ordering::SeqCst);
    let code = TaskCode::register_rpc(
        "RPC_IT_LOST",
        TaskPriority::Normal,
        PoolCode::default_pool(),
        Some(50),
    )
    .unwrap();

    let (response, outcome) = call(&node, code, b"x");
    assert!(response.wait(Duration::from_secs(5)));
    assert_eq!(*outcome.lock(), Some((ErrorCode::Timeout, None)));
}

#[test]
fn test_reply_delivered_on_caller_pool() {
    let (_rpc, node, _engine) = loopback_node(
        "rpc_caller_pool",
        &[(THREAD_POOL_DEFAULT, 1), ("THREAD_POOL_IT_CALLER", 1)],
    );
    let caller = PoolCode::register("THREAD_POOL_IT_CALLER");
    let code = TaskCode::register_rpc(
        "RPC_IT_CALLER_POOL",
        TaskPriority::Normal,
        PoolCode::default_pool(),
        None,
    )
    .unwrap();

    let delivered_on = Arc::new(Mutex::new(None));
    let request = Arc::new(Message::new_request(code, None, 0, b"p".to_vec()));
    let d = delivered_on.clone();
    let response = RpcResponseTask::new(
        request.clone(),
        move |_, _, _| *d.lock() = context::current_worker().map(|w| w.pool),
        0,
        None,
    )
    .unwrap();
    response.set_caller_pool(caller);
    node.rpc().unwrap().call(request, response.clone());

    assert!(response.wait(Duration::from_secs(5)));
    assert_eq!(*delivered_on.lock(), Some(caller));
}
