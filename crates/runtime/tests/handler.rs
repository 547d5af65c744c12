#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
use kolibri_core::{EventKind, EventRecorder, RecordedEvent, ResourceKey, WatchSource};
use kolibri_kubehub::MemorySource;
use kolibri_queue::BackoffConfig;
use kolibri_runtime::{Handler, HandlerBuilder, HandlerError};
use kube::api::ObjectMeta;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

fn cm(ns: &str, name: &str, rv: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), resource_version: Some(rv.into()), ..Default::default() },
        ..Default::default()
    }
}

fn key(ns: &str, name: &str) -> ResourceKey { ResourceKey::namespaced(ns, name) }

fn backoff(base_ms: u64) -> BackoffConfig {
    BackoffConfig { base_delay: Duration::from_millis(base_ms), max_delay: Duration::from_secs(10), bucket_qps: 0.0, bucket_burst: 1 }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn spawn_run<S: WatchSource>(h: &Handler<S>) -> (CancellationToken, JoinHandle<Result<(), HandlerError>>) {
    let cancel = CancellationToken::new();
    let h = h.clone();
    let token = cancel.clone();
    (cancel, tokio::spawn(async move { h.run(token).await }))
}

#[tokio::test]
async fn create_success_leaves_no_queue_state() {
    let src = MemorySource::<ConfigMap>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let h = HandlerBuilder::<ConfigMap>::new()
        .on_create(move |ctx| {
            let s = Arc::clone(&s);
            async move {
                s.lock().unwrap().push((ctx.namespace().to_string(), ctx.name().to_string(), ctx.last_seen().is_some()));
                Ok(())
            }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    src.apply(cm("a", "x", "1"));
    eventually(|| seen.lock().unwrap().len() == 1 && h.queue().tracked() == 0).await;
    assert_eq!(seen.lock().unwrap()[0], ("a".to_string(), "x".to_string(), true));
    assert_eq!(h.queue().num_requeues(&key("a", "x")), 0);
    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(h.queue().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn failed_update_is_retried_with_growing_delays() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "1"));
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::clone(&attempts);
    let h = HandlerBuilder::<ConfigMap>::new()
        .backoff(backoff(10))
        .on_change(move |_ctx| {
            let a = Arc::clone(&a);
            async move {
                let n = {
                    let mut v = a.lock().unwrap();
                    v.push(Instant::now());
                    v.len()
                };
                if n <= 3 {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(())
            }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    // initial create has no callback and is forgotten
    eventually(|| h.queue().tracked() == 0 && src.start_calls() == 1).await;
    src.apply(cm("a", "x", "2"));
    eventually(|| attempts.lock().unwrap().len() == 4 && h.queue().tracked() == 0).await;

    let at = attempts.lock().unwrap().clone();
    for (i, expected) in [10u64, 20, 40].into_iter().enumerate() {
        let gap = at[i + 1] - at[i];
        let expected = Duration::from_millis(expected);
        assert!(gap >= expected && gap < expected + Duration::from_millis(5), "retry {i}: waited {gap:?}, expected {expected:?}");
    }
    assert_eq!(h.queue().num_requeues(&key("a", "x")), 0);
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "1"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&attempts);
    let h = HandlerBuilder::<ConfigMap>::new()
        .backoff(backoff(1))
        .max_retries(10)
        .on_create(move |_ctx| {
            a.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("permanent failure")) }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| attempts.load(Ordering::SeqCst) == 11 && h.queue().tracked() == 0).await;
    sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 11);
    assert_eq!(h.queue().num_requeues(&key("a", "x")), 0);
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn vanished_object_skips_create_but_delivers_delete() {
    let src = MemorySource::<ConfigMap>::new();
    let creates = Arc::new(AtomicUsize::new(0));
    let deletes = Arc::new(Mutex::new(Vec::new()));
    let (c, d) = (Arc::clone(&creates), Arc::clone(&deletes));
    let h = HandlerBuilder::<ConfigMap>::new()
        .on_create(move |_ctx| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .on_delete(move |ctx| {
            d.lock().unwrap().push((ctx.key().to_string(), ctx.last_seen().is_some(), ctx.object().is_err()));
            async { Ok(()) }
        })
        .build(src.clone())
        .unwrap();

    // Notifications land in the queue before any worker runs.
    src.start(CancellationToken::new());
    src.apply(cm("a", "stale", "1"));
    src.evict(&key("a", "stale"));
    src.apply(cm("a", "gone", "1"));
    src.delete(&key("a", "gone"));
    assert_eq!(h.queue().len(), 2);

    let (cancel, run) = spawn_run(&h);
    eventually(|| deletes.lock().unwrap().len() == 1 && h.queue().tracked() == 0).await;
    assert_eq!(creates.load(Ordering::SeqCst), 0);
    assert_eq!(deletes.lock().unwrap()[0], ("a/gone".to_string(), false, true));
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn missed_delete_reaches_callback_with_last_known_key() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "1"));
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let d = Arc::clone(&deleted);
    let h = HandlerBuilder::<ConfigMap>::new()
        .on_delete(move |ctx| {
            d.lock().unwrap().push(ctx.key().clone());
            async { Ok(()) }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| h.queue().tracked() == 0 && src.start_calls() == 1).await;
    src.evict_then_delete(&key("a", "x"));
    eventually(|| deleted.lock().unwrap().len() == 1).await;
    assert_eq!(deleted.lock().unwrap()[0], key("a", "x"));
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn panicking_callback_is_retried() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "1"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&attempts);
    let h = HandlerBuilder::<ConfigMap>::new()
        .backoff(backoff(1))
        .on_create(move |_ctx| {
            let n = a.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("callback blew up");
                }
                Ok(())
            }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| attempts.load(Ordering::SeqCst) == 2 && h.queue().tracked() == 0).await;
    assert_eq!(h.queue().num_requeues(&key("a", "x")), 0);
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[derive(Default)]
struct Captured(Mutex<Vec<(ObjectReference, RecordedEvent)>>);

impl EventRecorder for Captured {
    fn record(&self, regarding: &ObjectReference, event: RecordedEvent) {
        self.0.lock().unwrap().push((regarding.clone(), event));
    }
}

#[tokio::test]
async fn successful_dispatch_records_synced_event() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "7"));
    let recorder = Arc::new(Captured::default());
    let h = HandlerBuilder::<ConfigMap>::new()
        .recorder(recorder.clone())
        .on_create(|_ctx| async { Ok(()) })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| recorder.0.lock().unwrap().len() == 1).await;
    let (regarding, event) = recorder.0.lock().unwrap()[0].clone();
    assert_eq!(regarding.name.as_deref(), Some("x"));
    assert_eq!(regarding.kind.as_deref(), Some("ConfigMap"));
    assert_eq!(event, RecordedEvent::normal("Synced", "v1/ConfigMap 'a/x@7' synced successfully"));
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn workers_reconcile_distinct_keys_in_parallel() {
    let src = MemorySource::<ConfigMap>::new();
    for n in ["p", "q", "r", "s"] {
        src.apply(cm("a", n, "1"));
    }
    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let done = Arc::new(AtomicUsize::new(0));
    let (b, d) = (Arc::clone(&barrier), Arc::clone(&done));
    let h = HandlerBuilder::<ConfigMap>::new()
        .workers(4)
        .backoff(backoff(1))
        .on_create(move |_ctx| {
            let (b, d) = (Arc::clone(&b), Arc::clone(&d));
            async move {
                tokio::time::timeout(Duration::from_secs(5), b.wait()).await?;
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| done.load(Ordering::SeqCst) == 4).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn context_exposes_path_and_live_object() {
    let src = MemorySource::<ConfigMap>::new();
    src.apply(cm("a", "x", "1"));
    let paths = Arc::new(Mutex::new(Vec::new()));
    let p = Arc::clone(&paths);
    let h = HandlerBuilder::<ConfigMap>::new()
        .on_create(move |ctx| {
            let p = Arc::clone(&p);
            async move {
                let step = ctx.named("step");
                let live = ctx.object()?;
                p.lock().unwrap().push((
                    ctx.path().to_string(),
                    step.path().to_string(),
                    live.metadata.resource_version.clone(),
                    ctx.event(),
                    step.is_cancelled(),
                ));
                Ok(())
            }
        })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    eventually(|| paths.lock().unwrap().len() == 1).await;
    assert_eq!(
        paths.lock().unwrap()[0],
        ("v1/ConfigMap.a/x".to_string(), "v1/ConfigMap.a/x.step".to_string(), Some("1".to_string()), EventKind::Create, false)
    );
    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cache_sync_timeout_is_fatal() {
    let src = MemorySource::<ConfigMap>::never_syncing();
    let h = HandlerBuilder::<ConfigMap>::new()
        .cache_sync_timeout(Some(Duration::from_millis(50)))
        .on_create(|_ctx| async { Ok(()) })
        .build(src.clone())
        .unwrap();
    let err = h.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HandlerError::CacheSyncTimeout { .. }), "{err}");
    assert!(h.queue().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn cancellation_before_sync_is_clean() {
    let src = MemorySource::<ConfigMap>::never_syncing();
    let h = HandlerBuilder::<ConfigMap>::new()
        .cache_sync_timeout(None)
        .on_create(|_ctx| async { Ok(()) })
        .build(src.clone())
        .unwrap();
    let (cancel, run) = spawn_run(&h);
    sleep(Duration::from_secs(300)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
}
