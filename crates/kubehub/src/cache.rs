//! Object cache shared by the watch sources, plus notification fan-out.

use std::sync::{Arc, PoisonError, RwLock};

use kolibri_core::{DeletedObject, EventHandler, Object, ResourceKey, SourceError, Tombstone};
use rustc_hash::FxHashMap;
use tracing::warn;

/// A notification computed under the cache lock, delivered after it is released.
pub(crate) enum Note<K> {
    Add(Arc<K>),
    Update(Arc<K>, Arc<K>),
    Delete(DeletedObject<K>),
}

pub(crate) struct ObjectCache<K> {
    objects: RwLock<FxHashMap<ResourceKey, Arc<K>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
}

impl<K: Object> ObjectCache<K> {
    pub(crate) fn new() -> Self { Self { objects: RwLock::new(FxHashMap::default()), handlers: RwLock::new(Vec::new()) } }

    pub(crate) fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub(crate) fn get(&self, key: &ResourceKey) -> Result<Arc<K>, SourceError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.get(key).cloned().ok_or_else(|| SourceError::NotFound(key.clone()))
    }

    pub(crate) fn len(&self) -> usize { self.objects.read().unwrap_or_else(PoisonError::into_inner).len() }

    /// All cached objects, ordered by key.
    pub(crate) fn objects(&self) -> Vec<Arc<K>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(&ResourceKey, &Arc<K>)> = objects.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Insert or replace `obj`. Objects without identity are not cached but
    /// still announced, so the consumer decides what to do with them.
    pub(crate) fn apply(&self, obj: K) -> Note<K> {
        let obj = Arc::new(obj);
        let key = match ResourceKey::from_resource(obj.as_ref()) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "kubehub: object without identity, not cached");
                return Note::Add(obj);
            }
        };
        let prev = self.objects.write().unwrap_or_else(PoisonError::into_inner).insert(key, Arc::clone(&obj));
        match prev {
            Some(old) => Note::Update(old, obj),
            None => Note::Add(obj),
        }
    }

    /// Remove `key`, announcing the cached state as the final one.
    pub(crate) fn delete(&self, key: &ResourceKey) -> Option<Note<K>> {
        let prev = self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        prev.map(|o| Note::Delete(DeletedObject::Known(o)))
    }

    /// Remove a deleted object reported by the watch; uses the watch payload
    /// when the cache never held it.
    pub(crate) fn delete_observed(&self, obj: K) -> Note<K> {
        match ResourceKey::from_resource(&obj) {
            Ok(key) => {
                self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(&key);
            }
            Err(e) => warn!(error = %e, "kubehub: deleted object without identity"),
        }
        Note::Delete(DeletedObject::Known(Arc::new(obj)))
    }

    /// Drop `key` from the cache without announcing it.
    pub(crate) fn evict(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    /// Replace the whole cache with a fresh listing. Objects that vanished in
    /// between are announced as tombstones: their delete was never observed.
    pub(crate) fn replace(&self, list: Vec<K>) -> Vec<Note<K>> {
        let mut fresh: FxHashMap<ResourceKey, Arc<K>> = FxHashMap::default();
        let mut notes = Vec::with_capacity(list.len());
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        for o in list {
            let obj = Arc::new(o);
            match ResourceKey::from_resource(obj.as_ref()) {
                Ok(key) => {
                    match objects.remove(&key) {
                        Some(old) => notes.push(Note::Update(old, Arc::clone(&obj))),
                        None => notes.push(Note::Add(Arc::clone(&obj))),
                    }
                    fresh.insert(key, obj);
                }
                Err(e) => warn!(error = %e, "kubehub: listed object without identity, skipped"),
            }
        }
        let mut gone: Vec<(ResourceKey, Arc<K>)> = objects.drain().collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, last) in gone {
            notes.push(Note::Delete(DeletedObject::Tombstone(Tombstone { key: key.to_string(), last_state: Some(last) })));
        }
        *objects = fresh;
        notes
    }

    /// Deliver notes to every registered handler, in order.
    pub(crate) fn emit(&self, notes: impl IntoIterator<Item = Note<K>>) {
        let handlers: Vec<Arc<dyn EventHandler<K>>> = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        if handlers.is_empty() {
            return;
        }
        for note in notes {
            for h in handlers.iter() {
                match &note {
                    Note::Add(o) => h.on_add(Arc::clone(o)),
                    Note::Update(old, new) => h.on_update(Arc::clone(old), Arc::clone(new)),
                    Note::Delete(d) => h.on_delete(d.clone()),
                }
            }
        }
    }
}
