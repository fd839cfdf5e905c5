//! Publishes warning events against the objects that caused them.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use tracing::warn;

pub const REASON_CONFIG_ERROR: &str = "Config Error";
pub const REASON_CONFIG_WARNINGS: &str = "Config Warnings";

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warning(&self, reference: ObjectReference, reason: &str, note: String);
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "lbc".into(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warning(&self, reference: ObjectReference, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Sync".into(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(%err, "failed to publish warning event");
        }
    }
}

/// An event sink that only logs. Used in dry-run mode and by tests.
#[derive(Debug, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn warning(&self, reference: ObjectReference, reason: &str, note: String) {
        warn!(
            object = ?reference.name,
            namespace = ?reference.namespace,
            reason,
            note,
            "warning event"
        );
    }
}

pub fn reference_for<K>(object: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    object.object_ref(&())
}
