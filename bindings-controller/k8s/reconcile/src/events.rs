//! Kubernetes events about bindings.
//!
//! Publishing is fire-and-forget: failures are logged and never fail a
//! reconcile.

use async_trait::async_trait;
use bindings_controller_k8s_api::{Client, ObjectReference};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

pub mod reasons {
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    pub const FINALIZER_REMOVED: &str = "FinalizerRemoved";
}

pub const ACTION_RECONCILE: &str = "Reconcile";

#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

// === impl KubeEventPublisher ===

impl KubeEventPublisher {
    pub fn new(client: Client, controller: impl Into<String>, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
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
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: ACTION_RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, reference).await {
            tracing::warn!(reason, %error, "Failed to publish event");
        }
    }
}
