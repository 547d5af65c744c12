//! Update policies: decide whether an update notification is worth queuing.

use kube::ResourceExt;

use crate::Object;

/// Predicate over `(old, new)` snapshots of an updated object.
pub trait UpdatePolicy<K>: Send + Sync {
    fn should_enqueue(&self, old: &K, new: &K) -> bool;
}

impl<K, F> UpdatePolicy<K> for F
where
    F: Fn(&K, &K) -> bool + Send + Sync,
{
    fn should_enqueue(&self, old: &K, new: &K) -> bool { self(old, new) }
}

/// Default policy: enqueue when `metadata.resourceVersion` differs.
/// Periodic resyncs deliver identical versions and are filtered out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceVersionChanged;

impl<K: Object> UpdatePolicy<K> for ResourceVersionChanged {
    fn should_enqueue(&self, old: &K, new: &K) -> bool { old.resource_version() != new.resource_version() }
}

/// Enqueue only when `metadata.generation` differs (spec changes, not status).
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChanged;

impl<K: Object> UpdatePolicy<K> for GenerationChanged {
    fn should_enqueue(&self, old: &K, new: &K) -> bool { old.meta().generation != new.meta().generation }
}

/// Enqueue every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl<K> UpdatePolicy<K> for Always {
    fn should_enqueue(&self, _old: &K, _new: &K) -> bool { true }
}
