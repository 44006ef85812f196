use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

/// The portion of a workload that bindings operate on: its metadata and its
/// pod template (`spec.template`).
///
/// Any resource shaped like a Deployment, StatefulSet, DaemonSet, Job, etc.
/// may be decoded as a `PodSpecable`; all other fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PodSpecable {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpecableSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PodSpecableSpec {
    #[serde(default)]
    pub template: PodTemplateSpec,
}

impl PodSpecable {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
