//! Object events.
//!
//! Warnings raised during reconciliation are both logged and attached to
//! the object they concern, so that `kubectl describe` shows them.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use tracing::{info, warn};

use crate::api::{ObjectKey, Resource};
use crate::store::kube::KubeClient;

pub const REASON_SELECTING_ALL: &str = "SelectingAll";
pub const REASON_FAILED_PLACEMENT: &str = "FailedPlacement";
pub const REASON_FAILED_NODESET_POD: &str = "FailedNodeSetPod";
pub const REASON_CONFLICTING_CONTROLLER: &str = "ConflictingController";
pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const REASON_FAILED_CREATE: &str = "FailedCreate";
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const REASON_FAILED_DELETE: &str = "FailedDelete";
pub const REASON_SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
pub const REASON_FAILED_UPDATE: &str = "FailedUpdate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// The object an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvolvedObject {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub key: ObjectKey,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub object: InvolvedObject,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn new<R: Resource>(
        obj: &R,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            object: InvolvedObject {
                api_version: R::API_VERSION,
                kind: R::KIND,
                key: obj.key(),
                uid: obj.meta().uid.clone(),
            },
            event_type,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Sink for object events. Delivery is best effort.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: Event);
}

fn log_event(event: &Event) {
    match event.event_type {
        EventType::Normal => info!(
            kind = event.object.kind,
            object = %event.object.key,
            reason = %event.reason,
            "{}", event.message
        ),
        EventType::Warning => warn!(
            kind = event.object.kind,
            object = %event.object.key,
            reason = %event.reason,
            "{}", event.message
        ),
    }
}

/// Writes events to the log only.
#[derive(Debug, Default)]
pub struct LoggingRecorder;

#[async_trait]
impl EventRecorder for LoggingRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Posts `core/v1` events to the API server.
pub struct KubeEventRecorder {
    client: KubeClient,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: KubeClient, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);

        let namespace = &event.object.key.namespace;
        let now = Utc::now();
        let body = json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {
                "generateName": format!("{}.", event.object.key.name),
                "namespace": namespace,
            },
            "involvedObject": {
                "apiVersion": event.object.api_version,
                "kind": event.object.kind,
                "namespace": namespace,
                "name": event.object.key.name,
                "uid": event.object.uid,
            },
            "type": event.event_type.as_str(),
            "reason": event.reason,
            "message": event.message,
            "source": {"component": self.component},
            "firstTimestamp": now,
            "lastTimestamp": now,
            "count": 1,
        });
        let url = format!(
            "{}/api/v1/namespaces/{}/events",
            self.client.base_url(),
            namespace
        );

        match self.client.request(Method::POST, &url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), reason = %event.reason, "Failed to post event");
            }
            Err(e) => warn!(error = %e, reason = %event.reason, "Failed to post event"),
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NodeSet, ObjectMeta};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn nodeset() -> NodeSet {
        NodeSet {
            metadata: ObjectMeta {
                name: "compute".into(),
                namespace: "slurm".into(),
                uid: "uid-1".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_recorder_keeps_events() {
        let recorder = MemoryRecorder::new();
        recorder
            .record(Event::new(
                &nodeset(),
                EventType::Warning,
                REASON_SELECTING_ALL,
                "This NodeSet is selecting all pods",
            ))
            .await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object.kind, "NodeSet");
        assert_eq!(events[0].object.uid, "uid-1");
        assert_eq!(recorder.reasons(), vec![REASON_SELECTING_ALL.to_string()]);
    }

    #[tokio::test]
    async fn test_kube_recorder_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/slurm/events"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = KubeClient::new(&server.uri(), None, None).unwrap();
        let recorder = KubeEventRecorder::new(client, "nodeset-controller");
        recorder
            .record(Event::new(
                &nodeset(),
                EventType::Normal,
                REASON_SUCCESSFUL_CREATE,
                "create Pod compute-0 in NodeSet compute successful",
            ))
            .await;
    }
}
