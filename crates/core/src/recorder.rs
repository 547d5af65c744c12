//! Optional sink for human-readable events about reconciled objects.

use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

impl RecordedEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self { type_: EventType::Normal, reason: reason.into(), note: note.into() }
    }
}

/// Receives events after dispatch. Must return promptly and never fail the caller.
pub trait EventRecorder: Send + Sync {
    fn record(&self, regarding: &ObjectReference, event: RecordedEvent);
}
