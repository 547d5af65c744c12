use kolibri_core::UpdatePolicy;
use kube::{Resource, ResourceExt};

/// Enqueues an update only when the value of `label` changed, including
/// the label appearing or disappearing.
#[derive(Debug, Clone)]
pub struct LabelChanged {
    pub label: String,
}

impl<K: Resource + Send + Sync> UpdatePolicy<K> for LabelChanged {
    fn should_enqueue(&self, old: &K, new: &K) -> bool { old.labels().get(&self.label) != new.labels().get(&self.label) }
}
