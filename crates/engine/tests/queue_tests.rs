//! Queue manager and failover tests
//!
//! Covers the bindable ranking order, the replicated directory under a
//! two-node fabric, node-death failover and partition heal convergence.

use std::time::Duration;

use chrono::DateTime;

use cpx_agent_core::types::CallId;
use cpx_engine::cluster::{Cluster, NodeId};
use cpx_engine::config::QueueConfig;
use cpx_engine::database::Store;
use cpx_engine::queue::manager::{rank_bindable_queues, QueueManager, QueueManagerHandle};
use cpx_engine::queue::worker::{QueueWorker, QueuedCall};
use cpx_engine::queue::Recipe;

fn queued(priority: i64, at_secs: i64) -> QueuedCall {
    QueuedCall {
        priority,
        enqueued_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
        call_id: CallId::new(),
        handle: None,
    }
}

fn worker(name: &str) -> cpx_engine::queue::worker::QueueHandle {
    QueueWorker::spawn(name, NodeId("n1".into()), Recipe::default())
}

/// Retry a condition until it holds or the window closes.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held: {what}");
}

// === ranking ===

#[tokio::test]
async fn weight_dominates_equal_priority() {
    let q1 = worker("q1");
    q1.enqueue(queued(10, 100));
    let q2 = worker("q2");
    q2.enqueue(queued(10, 200));

    let ranked = rank_bindable_queues(vec![
        ("q1".into(), q1.clone(), 1),
        ("q2".into(), q2.clone(), 10),
    ])
    .await;

    let names: Vec<&str> = ranked.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, vec!["q2", "q1"]);

    // Same outcome when q2 also holds the older call.
    let q2_old = worker("q2");
    q2_old.enqueue(queued(10, 50));
    let ranked = rank_bindable_queues(vec![
        ("q1".into(), q1, 1),
        ("q2".into(), q2_old, 10),
    ])
    .await;
    let names: Vec<&str> = ranked.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, vec!["q2", "q1"]);
}

#[tokio::test]
async fn priority_beats_equal_weight() {
    let q1 = worker("q1");
    q1.enqueue(queued(10, 100));
    let q3 = worker("q3");
    q3.enqueue(queued(0, 200));

    let ranked = rank_bindable_queues(vec![
        ("q1".into(), q1, 1),
        ("q3".into(), q3, 1),
    ])
    .await;
    let names: Vec<&str> = ranked.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, vec!["q3", "q1"]);
}

#[tokio::test]
async fn empty_queues_are_excluded_and_output_is_a_permutation() {
    let q1 = worker("q1");
    q1.enqueue(queued(5, 100));
    let q2 = worker("q2");
    q2.enqueue(queued(5, 200));
    let empty = worker("empty");

    let ranked = rank_bindable_queues(vec![
        ("q1".into(), q1, 2),
        ("empty".into(), empty, 50),
        ("q2".into(), q2, 2),
    ])
    .await;

    let mut names: Vec<&str> = ranked.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    names.sort();
    assert_eq!(names, vec!["q1", "q2"]);
}

#[tokio::test]
async fn ranking_is_stable_for_identical_keys() {
    // Three queues with identical (weight, priority, enqueue_time).
    let make = |name: &str| {
        let handle = worker(name);
        handle.enqueue(queued(10, 100));
        (name.to_string(), handle, 1)
    };
    let ranked = rank_bindable_queues(vec![make("a"), make("b"), make("c")]).await;
    let names: Vec<&str> = ranked.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn collapsed_weights_are_strictly_monotonic() {
    let q1 = worker("q1");
    q1.enqueue(queued(10, 100));
    let q2 = worker("q2");
    q2.enqueue(queued(10, 200));
    q2.enqueue(queued(20, 300));

    let ranked = rank_bindable_queues(vec![
        ("q1".into(), q1, 1),
        ("q2".into(), q2, 3),
    ])
    .await;

    // q2: w = 3 × 2 = 6, first of two → 6 + 2 - 1 = 7.
    // q1: w = 1 × 1 = 1, second → 1 + 2 - 2 = 1.
    assert_eq!(ranked[0].name, "q2");
    assert_eq!(ranked[0].weight, 7);
    assert_eq!(ranked[1].weight, 1);
    assert!(ranked[0].weight > ranked[1].weight);
}

// === replicated directory ===

struct TwoNodes {
    cluster: Cluster<cpx_engine::queue::manager::PeerMsg>,
    a: QueueManagerHandle,
    b: QueueManagerHandle,
    store: Store,
}

async fn two_nodes() -> TwoNodes {
    let store = Store::new_in_memory().await.unwrap();
    let cluster = Cluster::new();
    let node_a = cluster.join(NodeId("a".into()));
    let node_b = cluster.join(NodeId("b".into()));
    let a = QueueManager::spawn(node_a, store.clone(), QueueConfig::default());
    let b = QueueManager::spawn(node_b, store.clone(), QueueConfig::default());
    TwoNodes { cluster, a, b, store }
}

#[tokio::test]
async fn add_queue_registers_with_the_leader() {
    let nodes = two_nodes().await;

    let result = nodes.a.add_queue("q1", None, None).await.unwrap();
    assert!(!result.already_existed());

    // A second add on either node reports the existing queue.
    let result = nodes.a.add_queue("q1", None, None).await.unwrap();
    assert!(result.already_existed());
    let result = nodes.b.add_queue("q1", None, None).await.unwrap();
    assert!(result.already_existed());

    assert!(nodes.b.query_queue("q1").await.unwrap());
    assert!(!nodes.b.query_queue("nope").await.unwrap());

    // Follower adds go through the leader too.
    let result = nodes.b.add_queue("q2", None, None).await.unwrap();
    assert!(!result.already_existed());
    let names: Vec<String> = nodes
        .a
        .queues()
        .await
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(names.contains(&"q1".to_string()));
    assert!(names.contains(&"q2".to_string()));
}

#[tokio::test]
async fn leader_death_fails_over_to_survivor() {
    let nodes = two_nodes().await;

    nodes.a.add_queue("q1", None, None).await.unwrap();
    assert!(nodes.b.query_queue("q1").await.unwrap());

    // The config survived in the store.
    assert!(nodes.store.get_queue_def("q1").await.unwrap().is_some());

    nodes.cluster.kill(&NodeId("a".into()));

    // B takes over and restarts q1 from persisted config.
    let b = nodes.b.clone();
    eventually("q1 restarted on b", || {
        let b = b.clone();
        async move { b.query_queue("q1").await.unwrap_or(false) }
    })
    .await;

    let result = nodes.b.add_queue("q1", None, None).await.unwrap();
    assert!(result.already_existed());
    assert_eq!(result.handle().node, NodeId("b".into()));
}

#[tokio::test]
async fn partition_heal_converges_to_the_leader() {
    let nodes = two_nodes().await;
    let a_id = NodeId("a".into());
    let b_id = NodeId("b".into());

    nodes.cluster.partition(&[&[a_id.clone()], &[b_id.clone()]]);

    // Both sides run independently; the same name can exist twice.
    nodes.a.add_queue("dup", None, None).await.unwrap();
    nodes.b.add_queue("dup", None, None).await.unwrap();
    nodes.b.add_queue("only_b", None, None).await.unwrap();

    nodes.cluster.heal();

    // Post-heal: every node answers queues() identically, the leader's
    // mapping wins the duplicate, and the loser's worker is stopped.
    let a = nodes.a.clone();
    let b = nodes.b.clone();
    eventually("views converge", || {
        let a = a.clone();
        let b = b.clone();
        async move {
            let Ok(view_a) = a.queues().await else { return false };
            let Ok(view_b) = b.queues().await else { return false };
            let mut names_a: Vec<(String, NodeId)> =
                view_a.into_iter().map(|(n, h)| (n, h.node)).collect();
            let mut names_b: Vec<(String, NodeId)> =
                view_b.into_iter().map(|(n, h)| (n, h.node)).collect();
            names_a.sort();
            names_b.sort();
            names_a == names_b && names_a.iter().any(|(n, _)| n == "only_b")
        }
    })
    .await;

    let dup = nodes.a.get_queue("dup").await.unwrap().expect("dup survives");
    assert_eq!(dup.node, a_id);
    let dup_via_b = nodes.b.get_queue("dup").await.unwrap().expect("dup via b");
    assert_eq!(dup_via_b.node, a_id);
}

#[tokio::test]
async fn dead_queue_worker_restarts_from_config() {
    let nodes = two_nodes().await;

    let result = nodes.a.add_queue("q1", None, None).await.unwrap();
    let original = result.handle().clone();
    original.stop();

    let a = nodes.a.clone();
    eventually("worker restarted", || {
        let a = a.clone();
        async move {
            match a.get_queue("q1").await {
                Ok(Some(handle)) => !handle.is_closed(),
                _ => false,
            }
        }
    })
    .await;
}

#[tokio::test]
async fn dead_queue_worker_without_config_is_dropped() {
    let nodes = two_nodes().await;

    let result = nodes.a.add_queue("vanishing", None, None).await.unwrap();
    let handle = result.handle().clone();

    // Remove the persisted definition, then kill the worker.
    nodes.store.delete_queue_def("vanishing").await.unwrap();
    handle.stop();

    let a = nodes.a.clone();
    eventually("entry dropped", || {
        let a = a.clone();
        async move { !a.query_queue("vanishing").await.unwrap_or(true) }
    })
    .await;
}
