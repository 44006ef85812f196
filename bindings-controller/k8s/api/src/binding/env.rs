use crate::{status::BindingStatus, subject::SubjectRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Injects environment variables into every container of the subject
/// workload(s).
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "bindings.podspec.dev",
    version = "v1alpha1",
    kind = "EnvBinding",
    status = "BindingStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EnvBindingSpec {
    pub subject: SubjectRef,
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}
