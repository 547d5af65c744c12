use k8s_openapi::api::core::v1::ObjectReference;
use kolibri_core::{EventRecorder, EventType, RecordedEvent};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Publishes recorded events as Kubernetes `Event` objects from a background
/// task. `record` never waits: events are dropped when the buffer is full.
#[derive(Clone)]
pub struct KubeEventRecorder {
    tx: mpsc::Sender<(ObjectReference, RecordedEvent)>,
}

impl KubeEventRecorder {
    /// Must be called from within a tokio runtime.
    pub fn spawn(client: Client, controller: impl Into<String>, cap: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<(ObjectReference, RecordedEvent)>(cap.max(1));
        let reporter = Reporter { controller: controller.into(), instance: std::env::var("POD_NAME").ok() };
        tokio::spawn(async move {
            while let Some((regarding, ev)) = rx.recv().await {
                let recorder = Recorder::new(client.clone(), reporter.clone(), regarding);
                let type_ = match ev.type_ {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                };
                let published = recorder
                    .publish(Event { type_, reason: ev.reason, note: Some(ev.note), action: "Reconcile".into(), secondary: None })
                    .await;
                if let Err(e) = published {
                    warn!(error = %e, "kubehub: event publish failed");
                }
            }
            debug!("kubehub: event recorder stopped");
        });
        Self { tx }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, regarding: &ObjectReference, event: RecordedEvent) {
        if self.tx.try_send((regarding.clone(), event)).is_err() {
            counter!("kolibri_events_dropped_total", 1);
            debug!(name = ?regarding.name, "kubehub: event buffer full, dropped");
        }
    }
}
