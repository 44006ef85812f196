use crate::{status::BindingStatus, subject::SubjectRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Projects a secret into the pod template of the subject workload(s) as a
/// read-only volume mounted into every container.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "bindings.podspec.dev",
    version = "v1alpha1",
    kind = "SecretBinding",
    status = "BindingStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecretBindingSpec {
    pub subject: SubjectRef,
    pub secret: SecretRef,
    /// Where the secret is mounted. Defaults to `/var/bindings/<binding name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}
