//! Kubernetes Events for NooBaaSource resources
//!
//! Health transitions and adapter start failures are published as Events on
//! the resource so they show up in `kubectl describe`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting controller name on published Events
pub const REPORTER: &str = "noobaa-source-controller";

/// Event notes are capped by the API server at 1kB
const MAX_NOTE_LEN: usize = 1024;

pub mod reasons {
    pub const SOURCE_UNHEALTHY: &str = "SourceUnhealthy";
    pub const SOURCE_HEALTHY: &str = "SourceHealthy";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const ADAPTER_FAILED: &str = "AdapterFailed";
}

pub mod actions {
    pub const REPORT_HEALTH: &str = "ReportHealth";
    pub const START_ADAPTER: &str = "StartAdapter";
}

/// Publishes Events about a resource; failures are logged, never returned
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by the events.k8s.io API
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER.to_string(),
                instance: std::env::var("CONTROLLER_POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: note.map(|n| truncate_note(&n)),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                name = reference.name.as_deref().unwrap_or_default(),
                namespace = reference.namespace.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Shorten `note` to the API limit on a char boundary
pub fn truncate_note(note: &str) -> String {
    if note.len() <= MAX_NOTE_LEN {
        return note.to_string();
    }
    let mut end = MAX_NOTE_LEN;
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note[..end].to_string()
}
