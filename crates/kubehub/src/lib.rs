//! Kolibri kubehub – watch sources feeding the reconciliation engine.
//!
//! [`KubeWatchSource`] lists and watches one resource type through kube-rs
//! and keeps its own object cache; [`MemorySource`] is the in-process
//! equivalent driven by hand.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kolibri_core::{EventHandler, NamespaceScope, Object, ObjectLookup, ResourceKey, SourceError, SourceFactory, WatchSource};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cache;
pub mod memory;
mod recorder;

pub use memory::MemorySource;
pub use recorder::KubeEventRecorder;

use cache::ObjectCache;

/// Factory for a [`KubeWatchSource`]; the namespace scope is applied when
/// the handler is built.
pub struct KubeSource<K> {
    client: Client,
    namespaced: bool,
    make_api: fn(Client, Option<&str>) -> Api<K>,
    config: watcher::Config,
}

fn namespaced_api<K>(client: Client, ns: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match ns {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _ns: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    Api::all(client)
}

impl<K> KubeSource<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope> + DeserializeOwned,
{
    pub fn namespaced(client: Client) -> Self {
        Self { client, namespaced: true, make_api: namespaced_api::<K>, config: watcher::Config::default() }
    }
}

impl<K> KubeSource<K>
where
    K: Object + Resource<Scope = ClusterResourceScope> + DeserializeOwned,
{
    pub fn cluster(client: Client) -> Self {
        Self { client, namespaced: false, make_api: cluster_api::<K>, config: watcher::Config::default() }
    }
}

impl<K> KubeSource<K> {
    /// Watcher settings (label/field selectors, timeouts).
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }
}

impl<K> SourceFactory for KubeSource<K>
where
    K: Object + DeserializeOwned,
{
    type Source = KubeWatchSource<K>;

    fn create(self, scope: &NamespaceScope) -> Result<Self::Source, SourceError> {
        let ns = scope.resolve(self.client.default_namespace());
        if ns.is_some() && !self.namespaced {
            return Err(SourceError::Unsupported(format!(
                "namespace scope {:?} on cluster-scoped {}",
                scope,
                K::kind(&())
            )));
        }
        let api = (self.make_api)(self.client, ns.as_deref());
        Ok(KubeWatchSource::new(api, self.config, ns))
    }
}

/// List+watch source for one resource type.
pub struct KubeWatchSource<K: Object> {
    inner: Arc<Inner<K>>,
}

impl<K: Object> Clone for KubeWatchSource<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<K: Object> {
    api: Api<K>,
    config: watcher::Config,
    namespace: Option<String>,
    cache: ObjectCache<K>,
    started: AtomicBool,
    synced: AtomicBool,
}

impl<K: Object + DeserializeOwned> KubeWatchSource<K> {
    pub fn new(api: Api<K>, config: watcher::Config, namespace: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                namespace,
                cache: ObjectCache::new(),
                started: AtomicBool::new(false),
                synced: AtomicBool::new(false),
            }),
        }
    }

    /// Namespace restriction in effect, `None` for all namespaces.
    pub fn namespace(&self) -> Option<&str> { self.inner.namespace.as_deref() }

    pub fn cached(&self) -> usize { self.inner.cache.len() }
}

impl<K: Object + DeserializeOwned> Inner<K> {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let kind = K::kind(&()).to_string();
        let stream = watcher::watcher(self.api.clone(), self.config.clone()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, ns = ?self.namespace, "kubehub: watcher started");
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Event::Applied(o))) => {
                    let note = self.cache.apply(o);
                    self.cache.emit([note]);
                }
                Some(Ok(Event::Deleted(o))) => {
                    let note = self.cache.delete_observed(o);
                    self.cache.emit([note]);
                }
                Some(Ok(Event::Restarted(list))) => {
                    debug!(kind = %kind, count = list.len(), "kubehub: watch restart");
                    let notes = self.cache.replace(list);
                    self.cache.emit(notes);
                    if !self.synced.swap(true, Ordering::SeqCst) {
                        info!(kind = %kind, cached = self.cache.len(), "kubehub: cache synced");
                    }
                }
                Some(Err(e)) => {
                    counter!("kolibri_watch_errors_total", 1, "kind" => kind.clone());
                    warn!(kind = %kind, error = %e, "kubehub: watch error, backing off");
                }
                None => {
                    warn!(kind = %kind, "kubehub: watcher stream ended");
                    break;
                }
            }
        }
        info!(kind = %kind, "kubehub: watcher stopped");
    }
}

impl<K: Object + DeserializeOwned> ObjectLookup<K> for KubeWatchSource<K> {
    fn get(&self, key: &ResourceKey) -> Result<Arc<K>, SourceError> { self.inner.cache.get(key) }
}

impl<K: Object + DeserializeOwned> WatchSource for KubeWatchSource<K> {
    type Object = K;

    fn has_synced(&self) -> bool { self.inner.synced.load(Ordering::SeqCst) }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) { self.inner.cache.add_handler(handler); }

    fn start(&self, stop: CancellationToken) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(kind = %K::kind(&()), "kubehub: watcher already started");
            return;
        }
        tokio::spawn(Arc::clone(&self.inner).run(stop));
    }
}
