//! In-process watch source. Objects are applied and deleted by hand, which
//! makes it suitable for tests, demos, and feeding non-kube inventories.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use kolibri_core::{
    DeletedObject, EventHandler, NamespaceScope, Object, ObjectLookup, ResourceKey, SourceError, SourceFactory,
    Tombstone, WatchSource,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{Note, ObjectCache};

/// Namespace reported for [`NamespaceScope::Current`].
pub const DEFAULT_NAMESPACE: &str = "default";

pub struct MemorySource<K: Object> {
    inner: Arc<Inner<K>>,
}

impl<K: Object> Clone for MemorySource<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<K> {
    cache: ObjectCache<K>,
    namespace: RwLock<Option<String>>,
    sync_on_start: bool,
    started: AtomicBool,
    synced: AtomicBool,
    starts: AtomicUsize,
}

impl<K: Object> Default for MemorySource<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> MemorySource<K> {
    /// Source that reports synced as soon as it is started.
    pub fn new() -> Self { Self::build(true) }

    /// Source whose cache never syncs unless [`MemorySource::set_synced`] is called.
    pub fn never_syncing() -> Self { Self::build(false) }

    fn build(sync_on_start: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: ObjectCache::new(),
                namespace: RwLock::new(None),
                sync_on_start,
                started: AtomicBool::new(false),
                synced: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
            }),
        }
    }

    fn in_scope(&self, obj: &K) -> bool {
        let ns = self.inner.namespace.read().unwrap_or_else(PoisonError::into_inner);
        match ns.as_deref() {
            None => true,
            Some(ns) => obj.meta().namespace.as_deref() == Some(ns),
        }
    }

    fn is_started(&self) -> bool { self.inner.started.load(Ordering::SeqCst) }

    /// Create or update `obj`. Notifications are only delivered once started;
    /// objects applied before that are announced as adds by `start`.
    pub fn apply(&self, obj: K) {
        if !self.in_scope(&obj) {
            debug!(name = ?obj.meta().name, "memory: object outside namespace scope ignored");
            return;
        }
        let note = self.inner.cache.apply(obj);
        if self.is_started() {
            self.inner.cache.emit([note]);
        }
    }

    /// Delete `key`, announcing its cached state.
    pub fn delete(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let note = self.inner.cache.delete(key)?;
        let last = match &note {
            Note::Delete(DeletedObject::Known(o)) => Some(Arc::clone(o)),
            _ => None,
        };
        if self.is_started() {
            self.inner.cache.emit([note]);
        }
        last
    }

    /// Evict `key` from the cache first, then deliver its delete as a
    /// tombstone, as happens when a delete is missed during a disconnect.
    pub fn evict_then_delete(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let last = self.inner.cache.evict(key)?;
        if self.is_started() {
            let tombstone = Tombstone { key: key.to_string(), last_state: Some(Arc::clone(&last)) };
            self.inner.cache.emit([Note::Delete(DeletedObject::Tombstone(tombstone))]);
        }
        Some(last)
    }

    /// Deliver a tombstone that carries no object at all.
    pub fn empty_tombstone(&self, key: &str) {
        let tombstone = Tombstone { key: key.to_string(), last_state: None };
        self.inner.cache.emit([Note::Delete(DeletedObject::Tombstone(tombstone))]);
    }

    /// Update the cache without notifying anyone.
    pub fn apply_silently(&self, obj: K) { let _ = self.inner.cache.apply(obj); }

    /// Drop `key` from the cache without notifying anyone.
    pub fn evict(&self, key: &ResourceKey) -> Option<Arc<K>> { self.inner.cache.evict(key) }

    pub fn set_synced(&self, synced: bool) { self.inner.synced.store(synced, Ordering::SeqCst); }

    /// Number of `start` calls seen, including ignored repeats.
    pub fn start_calls(&self) -> usize { self.inner.starts.load(Ordering::SeqCst) }

    pub fn namespace(&self) -> Option<String> {
        self.inner.namespace.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize { self.inner.cache.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Object> ObjectLookup<K> for MemorySource<K> {
    fn get(&self, key: &ResourceKey) -> Result<Arc<K>, SourceError> { self.inner.cache.get(key) }
}

impl<K: Object> WatchSource for MemorySource<K> {
    type Object = K;

    fn has_synced(&self) -> bool { self.inner.synced.load(Ordering::SeqCst) }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) { self.inner.cache.add_handler(handler); }

    fn start(&self, _stop: CancellationToken) {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let initial: Vec<Note<K>> = self.inner.cache.objects().into_iter().map(Note::Add).collect();
        debug!(count = initial.len(), "memory: initial listing");
        self.inner.cache.emit(initial);
        if self.inner.sync_on_start {
            self.inner.synced.store(true, Ordering::SeqCst);
        }
    }
}

/// Handing a memory source to a handler restricts it to the handler's scope.
impl<K: Object> SourceFactory for MemorySource<K> {
    type Source = MemorySource<K>;

    fn create(self, scope: &NamespaceScope) -> Result<Self::Source, SourceError> {
        *self.inner.namespace.write().unwrap_or_else(PoisonError::into_inner) = scope.resolve(DEFAULT_NAMESPACE);
        Ok(self)
    }
}
