use std::future::Future;

use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use pingsource_controller_apis::PingSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Severity {
    Normal,
    Warning,
}

/// Best-effort, human readable breadcrumbs on a PingSource. Failing to
/// deliver one never fails a reconcile.
pub(crate) trait Notifier {
    fn emit(
        &self,
        source: &PingSource,
        severity: Severity,
        reason: &str,
        note: String,
    ) -> impl Future<Output = ()> + Send;
}

/// [`Notifier`] publishing Kubernetes events.
#[derive(Clone)]
pub(crate) struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl Notifier for EventRecorder {
    async fn emit(&self, source: &PingSource, severity: Severity, reason: &str, note: String) {
        let event = Event {
            type_: match severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &source.object_ref(&())).await {
            warn!(
                "failed to publish event {} for PingSource {}: {}",
                reason,
                source.id(),
                e
            );
        }
    }
}
