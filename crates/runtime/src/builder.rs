use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kolibri_core::{
    EventKind, EventRecorder, NamespaceScope, Object, ResourceVersionChanged, SourceFactory, UpdatePolicy, WatchSource,
};
use kolibri_queue::{BackoffConfig, EventQueue};
use kube::Resource;
use tracing::info;
use uuid::Uuid;

use crate::callback::{Callback, Callbacks};
use crate::handler::Inner;
use crate::{BuildError, Context, Handler, HandlerOptions, NotificationAdapter};

/// Fluent configuration for a [`Handler`] watching `K`.
///
/// Misuse (a callback or namespace set twice) is remembered and reported by
/// [`HandlerBuilder::build`], which always returns the first problem.
pub struct HandlerBuilder<K: Object> {
    name: Option<String>,
    controller: String,
    scope: Option<NamespaceScope>,
    policy: Option<Arc<dyn UpdatePolicy<K>>>,
    callbacks: Callbacks<K>,
    options: HandlerOptions,
    recorder: Option<Arc<dyn EventRecorder>>,
    error: Option<BuildError>,
}

impl<K: Object> Default for HandlerBuilder<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> HandlerBuilder<K> {
    pub fn new() -> Self {
        Self {
            name: None,
            controller: "kolibri".to_string(),
            scope: None,
            policy: None,
            callbacks: Callbacks::default(),
            options: HandlerOptions::default(),
            recorder: None,
            error: None,
        }
    }

    fn fail(mut self, err: BuildError) -> Self {
        self.error.get_or_insert(err);
        self
    }

    /// Handler name used in logs, metrics, and by the coordinator.
    /// Defaults to `<apiVersion>/<kind>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Controller name, used for the queue name.
    pub fn controller(mut self, controller: impl Into<String>) -> Self {
        self.controller = controller.into();
        self
    }

    pub fn namespace_scope(mut self, scope: NamespaceScope) -> Self {
        if self.scope.is_some() {
            return self.fail(BuildError::DuplicateNamespace);
        }
        self.scope = Some(scope);
        self
    }

    pub fn on_namespace(self, namespace: impl Into<String>) -> Self { self.namespace_scope(NamespaceScope::Namespace(namespace.into())) }

    pub fn on_all_namespaces(self) -> Self { self.namespace_scope(NamespaceScope::All) }

    pub fn on_current_namespace(self) -> Self { self.namespace_scope(NamespaceScope::Current) }

    /// Gate for update notifications. Defaults to [`ResourceVersionChanged`].
    pub fn update_policy(mut self, policy: impl UpdatePolicy<K> + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Register `callback` for `kind`.
    pub fn callback(mut self, kind: EventKind, callback: impl Callback<K>) -> Self {
        if !self.callbacks.set(kind, Arc::new(callback)) {
            return self.fail(BuildError::DuplicateCallback(kind));
        }
        self
    }

    pub fn on_create<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Context<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callback(EventKind::Create, f)
    }

    pub fn on_change<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Context<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callback(EventKind::Update, f)
    }

    pub fn on_delete<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Context<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callback(EventKind::Delete, f)
    }

    /// Replace all tuning at once.
    pub fn options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.options.workers = workers;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.options.backoff = backoff;
        self
    }

    pub fn cache_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.cache_sync_timeout = timeout;
        self
    }

    /// Emit a `Synced` event for every successfully reconciled object.
    pub fn recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Validate, create the watch source for the configured scope, and wire
    /// the notification adapter into it.
    pub fn build<F>(self, factory: F) -> Result<Handler<F::Source>, BuildError>
    where
        F: SourceFactory,
        F::Source: WatchSource<Object = K>,
    {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.callbacks.is_empty() {
            return Err(BuildError::NoCallbacks);
        }
        if self.options.workers == 0 {
            return Err(BuildError::InvalidWorkers);
        }
        let scope = self.scope.unwrap_or_default();
        let source = factory.create(&scope)?;

        let resource = format!("{}/{}", K::api_version(&()), K::kind(&()));
        let name = self.name.unwrap_or_else(|| resource.clone());
        let queue_name = format!("kolibri:{}:{}@{}", self.controller, resource, Uuid::new_v4());
        let queue = Arc::new(EventQueue::new(queue_name, self.options.backoff.build()));
        let policy: Arc<dyn UpdatePolicy<K>> = self.policy.unwrap_or_else(|| Arc::new(ResourceVersionChanged) as Arc<dyn UpdatePolicy<K>>);
        source.add_event_handler(Arc::new(NotificationAdapter::new(name.clone(), Arc::clone(&queue), policy)));
        info!(handler = %name, queue = %queue.name(), scope = ?scope, "handler: built");

        Ok(Handler::from_inner(Inner {
            name,
            resource,
            source: Arc::new(source),
            queue,
            callbacks: self.callbacks,
            options: self.options,
            recorder: self.recorder,
        }))
    }
}
