//! Handler run loop: cache sync, worker pool, dispatch and retry bookkeeping.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kolibri_core::{EventKind, EventRecorder, ObjectLookup, RecordedEvent, WatchSource, WorkItem};
use kolibri_queue::EventQueue;
use kube::Resource;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::callback::Callbacks;
use crate::{Context, HandlerError, HandlerOptions};

/// One resource type bound to its callbacks, queue, and watch source.
///
/// Built by [`crate::HandlerBuilder`]; cheap to clone.
pub struct Handler<S: WatchSource> {
    inner: Arc<Inner<S>>,
}

impl<S: WatchSource> Clone for Handler<S> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

pub(crate) struct Inner<S: WatchSource> {
    pub(crate) name: String,
    /// `<apiVersion>/<kind>` of the watched type.
    pub(crate) resource: String,
    pub(crate) source: Arc<S>,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) callbacks: Callbacks<S::Object>,
    pub(crate) options: HandlerOptions,
    pub(crate) recorder: Option<Arc<dyn EventRecorder>>,
}

enum Outcome {
    Reconciled,
    NoCallback,
    Stale,
}

impl<S: WatchSource> Handler<S> {
    pub(crate) fn from_inner(inner: Inner<S>) -> Self { Self { inner: Arc::new(inner) } }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn queue(&self) -> &Arc<EventQueue> { &self.inner.queue }

    pub fn source(&self) -> &S { &self.inner.source }

    pub fn options(&self) -> &HandlerOptions { &self.inner.options }

    /// Run until `cancel` fires. Returns `Ok` on a clean shutdown, including
    /// cancellation before the caches synced.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), HandlerError> {
        let inner = &self.inner;
        let source_stop = cancel.child_token();
        let _stop_source = source_stop.clone().drop_guard();
        info!(handler = %inner.name, resource = %inner.resource, workers = inner.options.workers, "handler: starting");
        let started = Instant::now();
        inner.source.start(source_stop);

        let synced = self.wait_for_sync(&cancel).await;
        match synced {
            Ok(true) => {}
            Ok(false) => {
                inner.queue.shut_down();
                info!(handler = %inner.name, "handler: cancelled before caches synced");
                return Ok(());
            }
            Err(e) => {
                inner.queue.shut_down();
                error!(handler = %inner.name, error = %e, "handler: cache sync failed");
                return Err(e);
            }
        }
        info!(handler = %inner.name, took_ms = started.elapsed().as_millis() as u64, "handler: caches synced");

        let local = cancel.child_token();
        let mut workers = JoinSet::new();
        for id in 0..inner.options.workers {
            workers.spawn(worker(Arc::clone(inner), local.clone(), id));
        }

        let mut failure: Option<HandlerError> = None;
        loop {
            tokio::select! {
                _ = local.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        failure = Some(HandlerError::WorkerCrashed { handler: inner.name.clone(), reason: e.to_string() });
                        local.cancel();
                        break;
                    }
                    None => break,
                },
            }
        }

        inner.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(handler = %inner.name, error = %e, "handler: worker crashed during shutdown");
                failure.get_or_insert(HandlerError::WorkerCrashed { handler: inner.name.clone(), reason: e.to_string() });
            }
        }
        info!(handler = %inner.name, "handler: stopped");
        failure.map_or(Ok(()), Err)
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<bool, HandlerError> {
        let inner = &self.inner;
        let wait = inner.source.wait_for_cache_sync(cancel);
        match inner.options.cache_sync_timeout {
            None => Ok(wait.await),
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(synced) => Ok(synced),
                Err(_) => Err(HandlerError::CacheSyncTimeout { handler: inner.name.clone(), timeout }),
            },
        }
    }
}

async fn worker<S: WatchSource>(inner: Arc<Inner<S>>, cancel: CancellationToken, id: usize) {
    debug!(handler = %inner.name, worker = id, "handler: worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inner.queue.get() => next,
        };
        let Some(item) = next else { break };
        inner.process(item, &cancel).await;
    }
    debug!(handler = %inner.name, worker = id, "handler: worker exiting");
}

impl<S: WatchSource> Inner<S> {
    async fn process(&self, item: WorkItem, cancel: &CancellationToken) {
        let started = Instant::now();
        let result = self.dispatch(&item, cancel).await;
        histogram!("kolibri_handler_dispatch_ms", started.elapsed().as_secs_f64() * 1000.0, "handler" => self.name.clone());
        match result {
            Ok(outcome) => {
                match outcome {
                    Outcome::Reconciled => counter!("kolibri_handler_success_total", 1, "handler" => self.name.clone()),
                    Outcome::Stale => counter!("kolibri_handler_stale_total", 1, "handler" => self.name.clone()),
                    Outcome::NoCallback => {}
                }
                self.queue.forget(&item.key);
            }
            Err(e) => {
                let retries = self.queue.num_requeues(&item.key);
                if retries < self.options.max_retries {
                    counter!("kolibri_handler_failure_total", 1, "handler" => self.name.clone());
                    warn!(
                        handler = %self.name, key = %item.key, event = %item.kind, retries,
                        error = %format!("{e:#}"), "handler: callback failed, requeueing"
                    );
                    self.queue.add_rate_limited(&item);
                } else {
                    counter!("kolibri_handler_dropped_total", 1, "handler" => self.name.clone());
                    error!(
                        handler = %self.name, key = %item.key, event = %item.kind, retries,
                        error = %format!("{e:#}"), "handler: giving up after max retries"
                    );
                    self.queue.forget(&item.key);
                }
            }
        }
        self.queue.done(&item.key);
    }

    async fn dispatch(&self, item: &WorkItem, cancel: &CancellationToken) -> anyhow::Result<Outcome> {
        let Some(callback) = self.callbacks.get(item.kind) else {
            debug!(handler = %self.name, key = %item.key, event = %item.kind, "handler: no callback for event");
            return Ok(Outcome::NoCallback);
        };
        let snapshot = match self.source.get(&item.key) {
            Ok(obj) => Some(obj),
            Err(e) if e.is_not_found() && item.kind == EventKind::Delete => None,
            Err(e) if e.is_not_found() => {
                debug!(handler = %self.name, key = %item.key, event = %item.kind, "handler: object gone, skipping");
                return Ok(Outcome::Stale);
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("looking up {}", item.key))),
        };

        let lookup: Arc<dyn ObjectLookup<S::Object>> = Arc::clone(&self.source) as Arc<dyn ObjectLookup<S::Object>>;
        let ctx = Context::new(&self.name, item, cancel.clone(), lookup, snapshot.clone());
        let span = ctx.span().clone();
        let callback = Arc::clone(callback);
        let run = AssertUnwindSafe(async move { callback.call(ctx).await }).catch_unwind();
        match run.instrument(span).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(panic) => anyhow::bail!("{} callback panicked: {}", item.kind, panic_message(panic.as_ref())),
        }

        if let Some(obj) = snapshot {
            self.record_synced(&obj);
        }
        Ok(Outcome::Reconciled)
    }

    fn record_synced(&self, obj: &S::Object) {
        let Some(recorder) = &self.recorder else { return };
        let meta = obj.meta();
        let id = format!(
            "{}/{}@{}",
            meta.namespace.as_deref().unwrap_or(""),
            meta.name.as_deref().unwrap_or(""),
            meta.resource_version.as_deref().unwrap_or("")
        );
        let note = format!("{} '{}' synced successfully", self.resource, id);
        recorder.record(&obj.object_ref(&()), RecordedEvent::normal("Synced", note));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
