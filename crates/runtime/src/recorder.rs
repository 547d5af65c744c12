use k8s_openapi::api::core::v1::ObjectReference;
use kolibri_core::{EventRecorder, EventType, RecordedEvent};
use tracing::{info, warn};

/// Writes recorded events to the log instead of the API server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, regarding: &ObjectReference, event: RecordedEvent) {
        let kind = regarding.kind.as_deref().unwrap_or("");
        let ns = regarding.namespace.as_deref().unwrap_or("");
        let name = regarding.name.as_deref().unwrap_or("");
        match event.type_ {
            EventType::Normal => info!(kind, ns, name, reason = %event.reason, "event: {}", event.note),
            EventType::Warning => warn!(kind, ns, name, reason = %event.reason, "event: {}", event.note),
        }
    }
}
