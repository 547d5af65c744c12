//! Turns raw watch notifications into queued work items.

use std::sync::Arc;

use kolibri_core::{DeletedObject, EventHandler, EventKind, KeyError, Object, ResourceKey, UpdatePolicy, WorkItem};
use kolibri_queue::EventQueue;
use metrics::counter;
use tracing::{debug, warn};

/// [`EventHandler`] that enqueues the identity of every relevant change.
///
/// Only keys are queued; bursts of notifications for one object collapse in
/// the queue and the worker reads the object back when it dispatches.
pub struct NotificationAdapter<K> {
    handler: String,
    queue: Arc<EventQueue>,
    policy: Arc<dyn UpdatePolicy<K>>,
}

impl<K: Object> NotificationAdapter<K> {
    pub fn new(handler: impl Into<String>, queue: Arc<EventQueue>, policy: Arc<dyn UpdatePolicy<K>>) -> Self {
        Self { handler: handler.into(), queue, policy }
    }

    fn dropped(&self, kind: EventKind, err: &KeyError) {
        counter!("kolibri_adapter_dropped_total", 1, "handler" => self.handler.clone(), "event" => kind.as_str());
        warn!(handler = %self.handler, event = %kind, error = %err, "adapter: notification dropped");
    }

    fn enqueue(&self, kind: EventKind, key: ResourceKey) {
        debug!(handler = %self.handler, event = %kind, key = %key, "adapter: enqueue");
        self.queue.add(WorkItem::new(key, kind));
    }
}

/// Unwrap a delete notification to the object it carries.
fn deleted_object<K>(obj: DeletedObject<K>) -> Result<Arc<K>, KeyError> {
    match obj {
        DeletedObject::Known(o) => Ok(o),
        DeletedObject::Tombstone(t) => t.last_state.ok_or(KeyError::EmptyTombstone(t.key)),
    }
}

impl<K: Object> EventHandler<K> for NotificationAdapter<K> {
    fn on_add(&self, obj: Arc<K>) {
        match ResourceKey::from_resource(obj.as_ref()) {
            Ok(key) => self.enqueue(EventKind::Create, key),
            Err(e) => self.dropped(EventKind::Create, &e),
        }
    }

    fn on_update(&self, old: Arc<K>, new: Arc<K>) {
        if let Err(e) = ResourceKey::from_resource(old.as_ref()) {
            return self.dropped(EventKind::Update, &e);
        }
        let key = match ResourceKey::from_resource(new.as_ref()) {
            Ok(key) => key,
            Err(e) => return self.dropped(EventKind::Update, &e),
        };
        if !self.policy.should_enqueue(&old, &new) {
            debug!(handler = %self.handler, key = %key, "adapter: update filtered by policy");
            return;
        }
        self.enqueue(EventKind::Update, key);
    }

    fn on_delete(&self, obj: DeletedObject<K>) {
        let key = deleted_object(obj).and_then(|o| ResourceKey::from_resource(o.as_ref()));
        match key {
            Ok(key) => self.enqueue(EventKind::Delete, key),
            Err(e) => self.dropped(EventKind::Delete, &e),
        }
    }
}
