//! Per-dispatch context handed to callbacks.

use std::sync::Arc;

use kolibri_core::{EventKind, ObjectLookup, ResourceKey, SourceError, WorkItem};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Span;

/// Everything a callback learns about the item it is reconciling.
///
/// The context carries identity and a snapshot taken at dispatch time. Use
/// [`Context::object`] to read the current state from the watch cache.
pub struct Context<K> {
    key: ResourceKey,
    event: EventKind,
    path: String,
    cancel: CancellationToken,
    lookup: Arc<dyn ObjectLookup<K>>,
    snapshot: Option<Arc<K>>,
    span: Span,
}

impl<K> Clone for Context<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            event: self.event,
            path: self.path.clone(),
            cancel: self.cancel.clone(),
            lookup: Arc::clone(&self.lookup),
            snapshot: self.snapshot.clone(),
            span: self.span.clone(),
        }
    }
}

impl<K> Context<K> {
    pub(crate) fn new(
        handler: &str,
        item: &WorkItem,
        cancel: CancellationToken,
        lookup: Arc<dyn ObjectLookup<K>>,
        snapshot: Option<Arc<K>>,
    ) -> Self {
        let path = format!("{}.{}", handler, item.key);
        let span = tracing::info_span!("reconcile", ctx = %path, event = %item.kind);
        Self { key: item.key.clone(), event: item.kind, path, cancel, lookup, snapshot, span }
    }

    pub fn key(&self) -> &ResourceKey { &self.key }

    /// Empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str { self.key.namespace().unwrap_or("") }

    pub fn name(&self) -> &str { self.key.name() }

    pub fn event(&self) -> EventKind { self.event }

    /// Dotted logging path, `<handler>.<key>` plus any [`Context::named`] segments.
    pub fn path(&self) -> &str { &self.path }

    pub fn span(&self) -> &Span { &self.span }

    /// Object as it was when the item was dispatched. `None` for a delete
    /// whose object had already left the cache.
    pub fn last_seen(&self) -> Option<&Arc<K>> { self.snapshot.as_ref() }

    /// Current state from the watch cache.
    pub fn object(&self) -> Result<Arc<K>, SourceError> { self.lookup.get(&self.key) }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Resolves when the handler is shutting down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> { self.cancel.cancelled() }

    pub fn cancellation_token(&self) -> &CancellationToken { &self.cancel }

    /// Child context for a sub-step; logs under `<path>.<segment>`.
    pub fn named(&self, segment: &str) -> Self {
        let path = format!("{}.{}", self.path, segment);
        let span = tracing::info_span!(parent: &self.span, "step", ctx = %path);
        Self { path, span, ..self.clone() }
    }
}

impl<K> std::fmt::Debug for Context<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.path)
            .field("event", &self.event)
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}
