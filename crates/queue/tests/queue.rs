#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kolibri_core::{EventKind, ResourceKey, WorkItem};
use kolibri_queue::{EventQueue, ExponentialBackoff, KeyState};

fn key(name: &str) -> ResourceKey { ResourceKey::namespaced("a", name) }

fn item(name: &str, kind: EventKind) -> WorkItem { WorkItem::new(key(name), kind) }

fn queue() -> EventQueue {
    EventQueue::new("test", Box::new(ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))))
}

#[test]
fn duplicate_adds_collapse_and_latest_kind_wins() {
    let q = queue();
    q.add(item("x", EventKind::Create));
    q.add(item("y", EventKind::Create));
    q.add(item("x", EventKind::Update));
    assert_eq!(q.len(), 2);

    // first enqueue keeps its position, last kind wins
    assert_eq!(q.try_get(), Some(item("x", EventKind::Update)));
    assert_eq!(q.try_get(), Some(item("y", EventKind::Create)));
    assert_eq!(q.try_get(), None);
}

#[test]
fn key_is_exclusive_while_processing() {
    let q = queue();
    q.add(item("x", EventKind::Create));
    let got = q.try_get().unwrap();
    assert_eq!(q.state_of(&got.key), Some(KeyState::Processing));

    q.add(item("x", EventKind::Update));
    assert_eq!(q.try_get(), None, "same key must not be handed out twice");
    assert_eq!(q.tracked(), 1);

    q.done(&got.key);
    assert_eq!(q.state_of(&got.key), Some(KeyState::Ready));
    assert_eq!(q.try_get(), Some(item("x", EventKind::Update)));
}

#[test]
fn success_leaves_no_trace() {
    let q = queue();
    q.add(item("x", EventKind::Create));
    let got = q.try_get().unwrap();
    q.forget(&got.key);
    q.done(&got.key);
    assert_eq!(q.num_requeues(&got.key), 0);
    assert_eq!(q.state_of(&got.key), None);
    assert_eq!(q.tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_retry_waits_increasing_delays() {
    let q = queue();
    q.add(item("x", EventKind::Update));
    let mut waits = Vec::new();
    for _ in 0..3 {
        let got = q.get().await.unwrap();
        q.add_rate_limited(&got);
        q.done(&got.key);
        assert_eq!(q.state_of(&got.key), Some(KeyState::Delayed));
        let t0 = tokio::time::Instant::now();
        let again = q.get().await.unwrap();
        waits.push(t0.elapsed());
        assert_eq!(again, item("x", EventKind::Update));
        // hand it back for the next round
        q.add(again.clone());
        q.done(&again.key);
    }
    for (waited, expected) in waits.iter().zip([10u64, 20, 40]) {
        let expected = Duration::from_millis(expected);
        assert!(*waited >= expected && *waited < expected + Duration::from_millis(2), "{waited:?} vs {expected:?}");
    }
    assert_eq!(q.num_requeues(&key("x")), 3);
}

#[tokio::test(start_paused = true)]
async fn new_notification_preempts_backoff() {
    let q = queue();
    q.add(item("x", EventKind::Create));
    let got = q.get().await.unwrap();
    q.add_rate_limited(&got);
    q.add_rate_limited(&got);
    q.done(&got.key);
    assert_eq!(q.state_of(&got.key), Some(KeyState::Delayed));

    q.add(item("x", EventKind::Delete));
    assert_eq!(q.state_of(&got.key), Some(KeyState::Ready));
    assert_eq!(q.try_get(), Some(item("x", EventKind::Delete)));
    q.done(&got.key);

    // the stale timer must not resurrect the key
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(q.try_get(), None);
    assert_eq!(q.tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn notification_during_failed_attempt_requeues_immediately() {
    let q = queue();
    q.add(item("x", EventKind::Create));
    let got = q.get().await.unwrap();
    q.add(item("x", EventKind::Update));
    q.add_rate_limited(&got);
    q.done(&got.key);
    assert_eq!(q.state_of(&got.key), Some(KeyState::Ready));
    assert_eq!(q.try_get(), Some(item("x", EventKind::Update)));
}

#[tokio::test]
async fn get_blocks_until_add() {
    let q = Arc::new(queue());
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    q.add(item("x", EventKind::Create));
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(got, Some(item("x", EventKind::Create)));
}

#[tokio::test]
async fn shutdown_drains_ready_then_releases_waiters() {
    let q = Arc::new(queue());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    for w in waiters {
        let got = tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        assert_eq!(got, None);
    }

    let q = queue();
    q.add(item("x", EventKind::Create));
    q.add_after(item("y", EventKind::Create), Duration::from_secs(60));
    q.shut_down();
    q.add(item("z", EventKind::Create));
    assert_eq!(q.get().await, Some(item("x", EventKind::Create)));
    assert_eq!(q.get().await, None);
    assert_eq!(q.state_of(&key("y")), None, "delayed items are dropped on shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_getters_never_share_a_key() {
    use std::sync::Mutex;

    let q = Arc::new(queue());
    let holding: Arc<Mutex<std::collections::HashSet<ResourceKey>>> = Arc::default();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let q = Arc::clone(&q);
        let holding = Arc::clone(&holding);
        tasks.push(tokio::spawn(async move {
            let mut handled = 0usize;
            while let Some(it) = q.get().await {
                assert!(holding.lock().unwrap().insert(it.key.clone()), "{} handed out twice", it.key);
                tokio::task::yield_now().await;
                holding.lock().unwrap().remove(&it.key);
                q.done(&it.key);
                handled += 1;
            }
            handled
        }));
    }
    for round in 0..50 {
        for n in 0..5 {
            let kind = if round % 2 == 0 { EventKind::Create } else { EventKind::Update };
            q.add(item(&format!("k{n}"), kind));
        }
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    q.shut_down();
    let mut total = 0usize;
    for t in tasks {
        total += t.await.unwrap();
    }
    assert!(total >= 5, "every key is processed at least once");
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u8),
        Get,
        Done(u8),
        Retry(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..3).prop_map(|(k, kind)| Op::Add(k, kind)),
            Just(Op::Get),
            (0u8..4).prop_map(Op::Done),
            (0u8..4).prop_map(Op::Retry),
        ]
    }

    fn kind(n: u8) -> EventKind {
        match n {
            0 => EventKind::Create,
            1 => EventKind::Update,
            _ => EventKind::Delete,
        }
    }

    proptest! {
        #[test]
        fn at_most_one_entry_per_key(ops in proptest::collection::vec(op(), 1..80)) {
            let q = queue();
            let mut processing: std::collections::HashSet<ResourceKey> = Default::default();
            for op in ops {
                match op {
                    Op::Add(k, kd) => q.add(item(&format!("k{k}"), kind(kd))),
                    Op::Get => {
                        if let Some(it) = q.try_get() {
                            prop_assert!(processing.insert(it.key.clone()), "{} handed out while processing", it.key);
                        }
                    }
                    Op::Done(k) => {
                        let key = key(&format!("k{k}"));
                        if processing.remove(&key) {
                            q.done(&key);
                        }
                    }
                    Op::Retry(k) => {
                        let key = key(&format!("k{k}"));
                        if processing.contains(&key) {
                            q.add_rate_limited(&WorkItem::new(key, EventKind::Update));
                        }
                    }
                }
                prop_assert!(q.len() <= 4);
                prop_assert!(q.tracked() <= 4);
                for k in &processing {
                    prop_assert_eq!(q.state_of(k), Some(KeyState::Processing));
                }
            }
        }
    }
}
